//! Pairing coordinator: mints a short-lived pairing code from the cloud,
//! shows it to the operator, and polls until the code is redeemed for a
//! persistent credential. Resumable across restarts and tolerant of races
//! with a code redeemed elsewhere.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::credentials::{CredentialStore, StoredCredential};
use crate::logs::LogRing;
use crate::BRIDGE_VERSION;

pub const POLL_INTERVAL: Duration = Duration::from_millis(5_000);
pub const MAX_POLL_ATTEMPTS: u32 = 120;

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PairingCodeRequest {
    pub bridge_id: String,
    pub bridge_version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ha_version: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingCode {
    pub code: String,
    #[serde(default)]
    pub expires_at: Option<String>,
    #[serde(default)]
    pub expires_in_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingStatusBody {
    pub status: String,
    #[serde(default)]
    pub bridge_credential: Option<String>,
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub bridge_id: Option<String>,
}

/// One poll of the status endpoint, as the coordinator sees it.
#[derive(Debug)]
pub enum PollResponse {
    Status(PairingStatusBody),
    /// HTTP 404: the code is gone, possibly because it was just redeemed.
    NotFound,
    /// The endpoint answered with something other than JSON; treated as a
    /// transient misconfiguration.
    NotJson { content_type: String },
}

#[derive(Debug, Error)]
pub enum PairingError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("unexpected http status {0}")]
    HttpStatus(StatusCode),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

#[async_trait]
pub trait PairingBackend: Send + Sync {
    async fn create_code(
        &self,
        base_url: &str,
        request: &PairingCodeRequest,
    ) -> Result<PairingCode, PairingError>;

    async fn poll_status(&self, base_url: &str, code: &str)
        -> Result<PollResponse, PairingError>;
}

pub struct ReqwestPairingBackend {
    client: reqwest::Client,
}

impl ReqwestPairingBackend {
    pub fn new() -> Result<Self, PairingError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .timeout(Duration::from_secs(8))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl PairingBackend for ReqwestPairingBackend {
    async fn create_code(
        &self,
        base_url: &str,
        request: &PairingCodeRequest,
    ) -> Result<PairingCode, PairingError> {
        let endpoint = format!("{base_url}/api/bridge/pairing-codes");
        let response = self.client.post(endpoint).json(request).send().await?;
        if !response.status().is_success() {
            return Err(PairingError::HttpStatus(response.status()));
        }
        Ok(response.json().await?)
    }

    async fn poll_status(
        &self,
        base_url: &str,
        code: &str,
    ) -> Result<PollResponse, PairingError> {
        let endpoint = format!("{base_url}/api/bridge/pairing-codes/{code}/status");
        let response = self.client.get(endpoint).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(PollResponse::NotFound);
        }
        if !response.status().is_success() {
            return Err(PairingError::HttpStatus(response.status()));
        }
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        if !content_type.contains("json") {
            return Ok(PollResponse::NotJson { content_type });
        }
        let body = response
            .json()
            .await
            .map_err(|err| PairingError::InvalidResponse(err.to_string()))?;
        Ok(PollResponse::Status(body))
    }
}

/// How a pairing run ended. `Paired` is the only outcome that leaves a
/// credential in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingOutcome {
    Paired,
    CodeExpired,
    /// The code was redeemed but the secret was claimed by another bridge
    /// instance; a restart with a fresh code is required.
    CodeClaimed,
    AttemptsExhausted,
}

pub struct PairingCoordinator {
    backend: Arc<dyn PairingBackend>,
    store: Arc<CredentialStore>,
    ring: LogRing,
    cloud_url: String,
    bridge_id: String,
    ha_version: Option<String>,
}

impl PairingCoordinator {
    pub fn new(
        cloud_url: impl Into<String>,
        bridge_id: impl Into<String>,
        ha_version: Option<String>,
        store: Arc<CredentialStore>,
        ring: LogRing,
    ) -> Result<Self, PairingError> {
        Ok(Self {
            backend: Arc::new(ReqwestPairingBackend::new()?),
            store,
            ring,
            cloud_url: cloud_url.into(),
            bridge_id: bridge_id.into(),
            ha_version,
        })
    }

    #[cfg(test)]
    fn with_backend(
        backend: Arc<dyn PairingBackend>,
        store: Arc<CredentialStore>,
        cloud_url: impl Into<String>,
        bridge_id: impl Into<String>,
    ) -> Self {
        Self {
            backend,
            store,
            ring: LogRing::default(),
            cloud_url: cloud_url.into(),
            bridge_id: bridge_id.into(),
            ha_version: None,
        }
    }

    /// Run the pairing flow to completion. Returns immediately when a
    /// credential is already resident.
    pub async fn run(&self) -> Result<PairingOutcome, PairingError> {
        if self.store.is_paired() {
            debug!(target: "bridge::pairing", "already paired; skipping pairing flow");
            return Ok(PairingOutcome::Paired);
        }

        let request = PairingCodeRequest {
            bridge_id: self.bridge_id.clone(),
            bridge_version: BRIDGE_VERSION.to_string(),
            ha_version: self.ha_version.clone(),
        };
        let code = self
            .backend
            .create_code(&self.cloud_url, &request)
            .await?;
        self.display_code(&code);

        for attempt in 1..=MAX_POLL_ATTEMPTS {
            // Another path may have completed pairing in the meantime.
            if self.store.is_paired() {
                return Ok(PairingOutcome::Paired);
            }

            match self.backend.poll_status(&self.cloud_url, &code.code).await {
                Ok(PollResponse::Status(body)) => match body.status.as_str() {
                    "paired" => return Ok(self.handle_paired(body)),
                    "expired" => {
                        warn!(
                            target: "bridge::pairing",
                            code = %code.code,
                            "pairing code expired; restart the bridge for a fresh one"
                        );
                        self.ring.record("warn", "pairing code expired");
                        return Ok(PairingOutcome::CodeExpired);
                    }
                    other => {
                        debug!(target: "bridge::pairing", status = other, attempt, "pairing pending");
                    }
                },
                Ok(PollResponse::NotFound) => {
                    if self.store.is_paired() {
                        return Ok(PairingOutcome::Paired);
                    }
                    // Race with a just-redeemed code; keep polling.
                    debug!(target: "bridge::pairing", attempt, "pairing code not found yet");
                }
                Ok(PollResponse::NotJson { content_type }) => {
                    warn!(
                        target: "bridge::pairing",
                        %content_type,
                        "status endpoint returned non-JSON; is CLOUD_URL pointing at the right host?"
                    );
                }
                Err(err) => {
                    warn!(target: "bridge::pairing", error = %err, attempt, "pairing poll failed");
                }
            }

            tokio::time::sleep(POLL_INTERVAL).await;
        }

        warn!(
            target: "bridge::pairing",
            "pairing window closed without redemption; restart the bridge to try again"
        );
        Ok(PairingOutcome::AttemptsExhausted)
    }

    fn handle_paired(&self, body: PairingStatusBody) -> PairingOutcome {
        let material = body
            .bridge_credential
            .filter(|credential| !credential.is_empty())
            .zip(body.tenant_id);
        match material {
            Some((bridge_credential, tenant_id)) => {
                let credential = StoredCredential {
                    bridge_id: body.bridge_id.unwrap_or_else(|| self.bridge_id.clone()),
                    bridge_credential,
                    tenant_id,
                    paired_at: Some(Utc::now()),
                    cloud_url: Some(self.cloud_url.clone()),
                };
                if let Err(err) = self.store.save(credential) {
                    warn!(target: "bridge::pairing", error = %err, "failed to persist credential");
                    return PairingOutcome::CodeClaimed;
                }
                info!(target: "bridge::pairing", "pairing complete; credential persisted");
                self.ring.record("info", "pairing complete");
                PairingOutcome::Paired
            }
            None => {
                // Redeemed, but the secret was already claimed. If we hold it
                // locally we are that claimant; otherwise someone else is.
                if self.store.is_paired() {
                    PairingOutcome::Paired
                } else {
                    warn!(
                        target: "bridge::pairing",
                        "pairing code was redeemed by another bridge; restart to mint a new code"
                    );
                    self.ring
                        .record("warn", "pairing code redeemed by another bridge");
                    PairingOutcome::CodeClaimed
                }
            }
        }
    }

    fn display_code(&self, code: &PairingCode) {
        let expires = code
            .expires_in_seconds
            .map(|seconds| format!("{} minutes", seconds / 60))
            .unwrap_or_else(|| "a few minutes".into());
        println!("==============================================");
        println!("  Pairing code: {}", code.code);
        println!("  Enter this code in the helm dashboard to");
        println!("  link this bridge. It expires in {expires}.");
        println!("==============================================");
        info!(target: "bridge::pairing", code = %code.code, "pairing code issued");
        self.ring
            .record("info", format!("pairing code issued: {}", code.code));
    }
}
