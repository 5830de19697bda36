//! Cloud session manager: an authenticated WebSocket client that streams
//! heartbeats and state batches up, takes commands down, and clears the
//! stored credential when the cloud reports it revoked.

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use helm_proto::{
    decode_cloud_message, encode_bridge_message, BridgeMessage, CloudMessage, CommandEnvelope,
    CommandStatus, DecodeError, FullSyncData, PROTOCOL_VERSION,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::batcher::FlushedBatch;
use crate::credentials::{CredentialStore, StoredCredential};
use crate::logs::LogRing;
use crate::stats::BridgeStats;

const INITIAL_BACKOFF: Duration = Duration::from_millis(1_000);
const MAX_BACKOFF: Duration = Duration::from_millis(60_000);
const MAX_RECONNECT_ATTEMPTS: u32 = 10;

/// Events emitted to the orchestrator.
#[derive(Debug)]
pub enum CloudEvent {
    Connected,
    Authenticated { tenant_id: Option<String> },
    AuthFailed { message: String },
    Command(CommandEnvelope),
    RequestFullSync,
    Disconnected,
    Error { message: String },
}

#[derive(Debug, Error)]
pub enum CloudError {
    #[error("invalid cloud url `{0}`")]
    InvalidUrl(String),
}

#[derive(Debug, Clone)]
pub struct CloudSettings {
    pub ws_url: String,
    pub bridge_id: String,
    pub heartbeat_interval: Duration,
}

impl CloudSettings {
    pub fn new(
        base_url: &str,
        bridge_id: impl Into<String>,
        heartbeat_interval: Duration,
    ) -> Result<Self, CloudError> {
        Ok(Self {
            ws_url: cloud_ws_url(base_url)?,
            bridge_id: bridge_id.into(),
            heartbeat_interval,
        })
    }
}

/// Derive the cloud's bridge endpoint from its base URL: swap the scheme to
/// ws/wss and append `/ws/bridge`.
pub fn cloud_ws_url(base_url: &str) -> Result<String, CloudError> {
    let trimmed = base_url.trim().trim_end_matches('/');
    let ws_base = if let Some(rest) = trimmed.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = trimmed.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if trimmed.starts_with("ws://") || trimmed.starts_with("wss://") {
        trimmed.to_string()
    } else {
        return Err(CloudError::InvalidUrl(base_url.to_string()));
    };
    Ok(format!("{ws_base}/ws/bridge"))
}

/// True when an auth failure means the credential itself is dead and pairing
/// has to happen again.
fn is_credential_rejection(error: &str) -> bool {
    let lowered = error.to_ascii_lowercase();
    lowered.contains("revoked") || lowered.contains("invalid")
}

enum CloudRequest {
    Connect,
    SendFullSync(FullSyncData),
    SendStateBatch(FlushedBatch),
    SendMessage(BridgeMessage),
    Disconnect,
}

/// Cloneable handle over the session task. Outbound helpers are no-ops while
/// the socket is closed or unauthenticated.
#[derive(Clone)]
pub struct CloudClient {
    request_tx: mpsc::UnboundedSender<CloudRequest>,
}

impl CloudClient {
    pub fn spawn(
        settings: CloudSettings,
        store: Arc<CredentialStore>,
        stats: Arc<BridgeStats>,
        ring: LogRing,
    ) -> (
        Self,
        mpsc::UnboundedReceiver<CloudEvent>,
        watch::Receiver<bool>,
    ) {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (auth_tx, auth_rx) = watch::channel(false);
        tokio::spawn(run(
            settings, store, stats, ring, request_rx, event_tx, auth_tx,
        ));
        (Self { request_tx }, event_rx, auth_rx)
    }

    /// Begin the connect loop. A no-op while no credential is resident.
    pub fn connect(&self) {
        let _ = self.request_tx.send(CloudRequest::Connect);
    }

    pub fn send_full_sync(&self, data: FullSyncData) {
        let _ = self.request_tx.send(CloudRequest::SendFullSync(data));
    }

    pub fn send_state_batch(&self, batch: FlushedBatch) {
        let _ = self.request_tx.send(CloudRequest::SendStateBatch(batch));
    }

    pub fn send_message(&self, message: BridgeMessage) {
        let _ = self.request_tx.send(CloudRequest::SendMessage(message));
    }

    /// Stop reconnecting and close the socket.
    pub fn disconnect(&self) {
        let _ = self.request_tx.send(CloudRequest::Disconnect);
    }
}

enum SessionEnd {
    /// Process shutdown requested locally.
    Shutdown,
    /// Stop reconnecting (revocation or a cloud-ordered disconnect) but keep
    /// serving a later explicit connect, e.g. after re-pairing.
    Halt,
    /// Transport drop; reconnect policy applies.
    Dropped,
}

async fn run(
    settings: CloudSettings,
    store: Arc<CredentialStore>,
    stats: Arc<BridgeStats>,
    ring: LogRing,
    mut request_rx: mpsc::UnboundedReceiver<CloudRequest>,
    event_tx: mpsc::UnboundedSender<CloudEvent>,
    auth_tx: watch::Sender<bool>,
) {
    'idle: loop {
        match request_rx.recv().await {
            Some(CloudRequest::Connect) => {}
            Some(CloudRequest::Disconnect) | None => return,
            Some(_) => continue, // outbound helpers are no-ops while closed
        }
        if !store.is_paired() {
            debug!(target: "bridge::cloud", "connect requested but no credential is resident");
            continue;
        }

        let mut attempts: u32 = 0;
        loop {
            let Some(credential) = store.current() else {
                continue 'idle;
            };
            let end = run_session(
                &settings,
                &credential,
                &store,
                &stats,
                &ring,
                &mut request_rx,
                &event_tx,
                &auth_tx,
                &mut attempts,
            )
            .await;
            let _ = auth_tx.send(false);
            match end {
                SessionEnd::Shutdown => return,
                SessionEnd::Halt => continue 'idle,
                SessionEnd::Dropped => {
                    let _ = event_tx.send(CloudEvent::Disconnected);
                    attempts += 1;
                    stats.record_cloud_reconnect();
                    if attempts > MAX_RECONNECT_ATTEMPTS {
                        warn!(
                            target: "bridge::cloud",
                            attempts = attempts - 1,
                            "exhausted cloud reconnect attempts; waiting for restart"
                        );
                        let _ = event_tx.send(CloudEvent::Error {
                            message: "exhausted cloud reconnect attempts".into(),
                        });
                        continue 'idle;
                    }
                    let delay = backoff_delay(attempts);
                    info!(
                        target: "bridge::cloud",
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        "cloud disconnected; reconnecting"
                    );
                    if !sleep_unless_disconnected(&mut request_rx, delay).await {
                        return;
                    }
                }
            }
        }
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    let delay = INITIAL_BACKOFF * 2u32.pow(exp);
    delay.min(MAX_BACKOFF)
}

async fn sleep_unless_disconnected(
    request_rx: &mut mpsc::UnboundedReceiver<CloudRequest>,
    delay: Duration,
) -> bool {
    let wake = Instant::now() + delay;
    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(wake) => return true,
            request = request_rx.recv() => match request {
                Some(CloudRequest::Disconnect) | None => return false,
                Some(_) => {} // dropped while disconnected
            },
        }
    }
}

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

struct Session<'a> {
    settings: &'a CloudSettings,
    store: &'a CredentialStore,
    stats: &'a BridgeStats,
    ring: &'a LogRing,
    ws_tx: WsSink,
    authenticated: bool,
    tenant_id: Option<String>,
    acked: HashSet<Uuid>,
    resulted: HashSet<Uuid>,
}

impl Session<'_> {
    async fn write(&mut self, message: &BridgeMessage) -> Result<(), ()> {
        let frame = match encode_bridge_message(message) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(target: "bridge::cloud", error = %err, "failed to encode outbound frame");
                return Ok(());
            }
        };
        self.ws_tx.send(Message::Text(frame)).await.map_err(|err| {
            warn!(target: "bridge::cloud", error = %err, "cloud write failed");
        })
    }

    async fn write_if_authenticated(&mut self, message: &BridgeMessage) -> Result<(), ()> {
        if !self.authenticated {
            debug!(target: "bridge::cloud", "dropping outbound frame while unauthenticated");
            return Ok(());
        }
        self.write(message).await
    }

    async fn send_heartbeat(&mut self) -> Result<(), ()> {
        let stats = self.stats.heartbeat(&self.settings.bridge_id);
        self.write(&BridgeMessage::Heartbeat { stats }).await
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_session(
    settings: &CloudSettings,
    credential: &StoredCredential,
    store: &CredentialStore,
    stats: &BridgeStats,
    ring: &LogRing,
    request_rx: &mut mpsc::UnboundedReceiver<CloudRequest>,
    event_tx: &mpsc::UnboundedSender<CloudEvent>,
    auth_tx: &watch::Sender<bool>,
    attempts: &mut u32,
) -> SessionEnd {
    let (ws_stream, _) = match connect_async(&settings.ws_url).await {
        Ok(connected) => connected,
        Err(err) => {
            warn!(target: "bridge::cloud", error = %err, url = %settings.ws_url, "cloud connect failed");
            return SessionEnd::Dropped;
        }
    };
    info!(target: "bridge::cloud", url = %settings.ws_url, "cloud socket open");
    ring.record("info", "cloud socket open");
    let _ = event_tx.send(CloudEvent::Connected);

    let (ws_tx, mut ws_rx) = ws_stream.split();
    let mut session = Session {
        settings,
        store,
        stats,
        ring,
        ws_tx,
        authenticated: false,
        tenant_id: None,
        acked: HashSet::new(),
        resulted: HashSet::new(),
    };

    // Authenticate immediately on open; the cloud answers with auth_result.
    let authenticate = BridgeMessage::Authenticate {
        bridge_id: settings.bridge_id.clone(),
        bridge_credential: credential.bridge_credential.clone(),
        protocol_version: PROTOCOL_VERSION,
    };
    if session.write(&authenticate).await.is_err() {
        return SessionEnd::Dropped;
    }

    let mut heartbeat = tokio::time::interval_at(
        Instant::now() + settings.heartbeat_interval,
        settings.heartbeat_interval,
    );
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            frame = ws_rx.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    match handle_message(&text, &mut session, event_tx, auth_tx, attempts).await {
                        MessageOutcome::Continue => {}
                        MessageOutcome::End(end) => return end,
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    debug!(target: "bridge::cloud", "cloud socket closed");
                    return SessionEnd::Dropped;
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    warn!(target: "bridge::cloud", error = %err, "cloud socket error");
                    return SessionEnd::Dropped;
                }
            },
            request = request_rx.recv() => match request {
                Some(CloudRequest::Connect) => {} // already connected
                Some(CloudRequest::SendFullSync(data)) => {
                    let frame = crate::executor::full_sync_frame(stats, data);
                    if session.write_if_authenticated(&frame).await.is_err() {
                        return SessionEnd::Dropped;
                    }
                }
                Some(CloudRequest::SendStateBatch(batch)) => {
                    let frame = BridgeMessage::StateBatch {
                        batch_id: batch.batch_id,
                        is_overflow: false,
                        events: batch.events,
                    };
                    if session.write_if_authenticated(&frame).await.is_err() {
                        return SessionEnd::Dropped;
                    }
                }
                Some(CloudRequest::SendMessage(message)) => {
                    if let BridgeMessage::CommandResult { cmd_id, .. } = &message {
                        if !session.resulted.insert(*cmd_id) {
                            debug!(target: "bridge::cloud", cmd_id = %cmd_id, "duplicate command result suppressed");
                            continue;
                        }
                    }
                    if session.write_if_authenticated(&message).await.is_err() {
                        return SessionEnd::Dropped;
                    }
                }
                Some(CloudRequest::Disconnect) | None => {
                    let _ = session.ws_tx.send(Message::Close(None)).await;
                    return SessionEnd::Shutdown;
                }
            },
            _ = heartbeat.tick(), if session.authenticated => {
                if session.send_heartbeat().await.is_err() {
                    return SessionEnd::Dropped;
                }
            }
        }
    }
}

enum MessageOutcome {
    Continue,
    End(SessionEnd),
}

async fn handle_message(
    text: &str,
    session: &mut Session<'_>,
    event_tx: &mpsc::UnboundedSender<CloudEvent>,
    auth_tx: &watch::Sender<bool>,
    attempts: &mut u32,
) -> MessageOutcome {
    let message = match decode_cloud_message(text) {
        Ok(message) => message,
        Err(DecodeError::UnknownType(tag)) => {
            debug!(target: "bridge::cloud", message_type = %tag, "ignoring unknown cloud message");
            return MessageOutcome::Continue;
        }
        Err(err @ DecodeError::Invalid { .. }) => {
            // A known type with a broken schema earns a complaint; the
            // session itself carries on.
            debug!(target: "bridge::cloud", error = %err, "schema violation in cloud frame");
            let complaint = BridgeMessage::Error {
                code: "PROTOCOL".into(),
                message: err.to_string(),
            };
            if session.write_if_authenticated(&complaint).await.is_err() {
                return MessageOutcome::End(SessionEnd::Dropped);
            }
            return MessageOutcome::Continue;
        }
        Err(err) => {
            debug!(target: "bridge::cloud", error = %err, "undecodable cloud frame dropped");
            return MessageOutcome::Continue;
        }
    };

    match message {
        CloudMessage::AuthResult {
            success: true,
            tenant_id,
            ..
        } => {
            session.authenticated = true;
            session.tenant_id = tenant_id.clone();
            *attempts = 0;
            let _ = auth_tx.send(true);
            info!(target: "bridge::cloud", tenant_id = ?session.tenant_id, "cloud session authenticated");
            session.ring.record("info", "cloud session authenticated");
            let _ = event_tx.send(CloudEvent::Authenticated { tenant_id });
            MessageOutcome::Continue
        }
        CloudMessage::AuthResult {
            success: false,
            error,
            ..
        } => {
            let message = error.unwrap_or_else(|| "cloud rejected authentication".into());
            if is_credential_rejection(&message) {
                warn!(
                    target: "bridge::cloud",
                    %message,
                    "credential rejected; clearing it. Re-pair this bridge from the helm dashboard"
                );
                session
                    .ring
                    .record("warn", format!("credential rejected: {message}"));
                if let Err(err) = session.store.clear() {
                    warn!(target: "bridge::cloud", error = %err, "failed to clear credential file");
                }
                let _ = event_tx.send(CloudEvent::AuthFailed { message });
                MessageOutcome::End(SessionEnd::Halt)
            } else {
                warn!(target: "bridge::cloud", %message, "cloud authentication failed");
                let _ = event_tx.send(CloudEvent::Error { message });
                MessageOutcome::End(SessionEnd::Dropped)
            }
        }
        CloudMessage::Command { envelope } => {
            if session.acked.contains(&envelope.cmd_id) || session.resulted.contains(&envelope.cmd_id)
            {
                debug!(
                    target: "bridge::cloud",
                    cmd_id = %envelope.cmd_id,
                    "duplicate command delivery ignored"
                );
                return MessageOutcome::Continue;
            }
            if envelope.requires_ack {
                session.acked.insert(envelope.cmd_id);
                let ack = BridgeMessage::CommandAck {
                    cmd_id: envelope.cmd_id,
                    status: CommandStatus::Acknowledged,
                    received_at: chrono::Utc::now(),
                };
                if session.write(&ack).await.is_err() {
                    return MessageOutcome::End(SessionEnd::Dropped);
                }
            }
            let _ = event_tx.send(CloudEvent::Command(envelope));
            MessageOutcome::Continue
        }
        CloudMessage::RequestFullSync => {
            let _ = event_tx.send(CloudEvent::RequestFullSync);
            MessageOutcome::Continue
        }
        CloudMessage::RequestHeartbeat => {
            if session.send_heartbeat().await.is_err() {
                return MessageOutcome::End(SessionEnd::Dropped);
            }
            MessageOutcome::Continue
        }
        CloudMessage::Disconnect { reason } => {
            let reason = reason.unwrap_or_default();
            info!(target: "bridge::cloud", %reason, "cloud ordered a disconnect");
            session
                .ring
                .record("info", format!("cloud ordered a disconnect: {reason}"));
            if matches!(reason.as_str(), "user_disconnected" | "user_reset") {
                if let Err(err) = session.store.clear() {
                    warn!(target: "bridge::cloud", error = %err, "failed to clear credential file");
                }
            }
            let _ = session.ws_tx.send(Message::Close(None)).await;
            let _ = event_tx.send(CloudEvent::Disconnected);
            MessageOutcome::End(SessionEnd::Halt)
        }
        CloudMessage::RequestLogs { lines } => {
            let frame = BridgeMessage::BridgeLogs {
                bridge_id: session.settings.bridge_id.clone(),
                lines: session.ring.snapshot(lines),
            };
            if session.write(&frame).await.is_err() {
                return MessageOutcome::End(SessionEnd::Dropped);
            }
            MessageOutcome::Continue
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ws_url_appends_bridge_path() {
        assert_eq!(
            cloud_ws_url("https://helm.replit.app").unwrap(),
            "wss://helm.replit.app/ws/bridge"
        );
        assert_eq!(
            cloud_ws_url("http://localhost:3000/").unwrap(),
            "ws://localhost:3000/ws/bridge"
        );
    }

    #[test]
    fn ws_url_rejects_unknown_scheme() {
        assert!(matches!(
            cloud_ws_url("gopher://helm"),
            Err(CloudError::InvalidUrl(_))
        ));
    }

    #[test]
    fn credential_rejection_detection_is_case_insensitive() {
        assert!(is_credential_rejection("Credential revoked"));
        assert!(is_credential_rejection("INVALID bridge credential"));
        assert!(!is_credential_rejection("temporarily unavailable"));
    }

    #[test]
    fn backoff_caps_at_sixty_seconds() {
        let delays: Vec<u64> = (1..=MAX_RECONNECT_ATTEMPTS)
            .map(|attempt| backoff_delay(attempt).as_millis() as u64)
            .collect();
        assert_eq!(
            delays,
            vec![1_000, 2_000, 4_000, 8_000, 16_000, 32_000, 60_000, 60_000, 60_000, 60_000]
        );
    }
}
