use rand::{distributions::Alphanumeric, Rng};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Immutable process-lifetime configuration, resolved once at startup.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub ha_url: String,
    pub ha_token: String,
    pub cloud_url: String,
    pub bridge_id: String,
    pub credential_path: PathBuf,
    pub health_port: u16,
    pub heartbeat_interval: Duration,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("HA_TOKEN (or SUPERVISOR_TOKEN) is required but not set")]
    MissingHubToken,
    #[error("invalid {name} `{value}`: {reason}")]
    InvalidUrl {
        name: &'static str,
        value: String,
        reason: String,
    },
    #[error("invalid {name} `{value}`: expected a number")]
    InvalidNumber { name: &'static str, value: String },
}

const DEFAULT_HA_URL: &str = "http://supervisor/core";
const DEFAULT_CLOUD_URL: &str = "https://helm.replit.app";
const DEFAULT_CREDENTIAL_PATH: &str = "/data/credentials.json";
const DEFAULT_HEALTH_PORT: u16 = 8099;
const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 60_000;

impl BridgeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let ha_url = std::env::var("HA_URL")
            .or_else(|_| std::env::var("SUPERVISOR_URL"))
            .unwrap_or_else(|_| DEFAULT_HA_URL.into());
        let ha_url = normalize_base_url("HA_URL", &ha_url)?;

        let ha_token = std::env::var("HA_TOKEN")
            .or_else(|_| std::env::var("SUPERVISOR_TOKEN"))
            .ok()
            .filter(|token| !token.trim().is_empty())
            .ok_or(ConfigError::MissingHubToken)?;

        let cloud_url =
            std::env::var("CLOUD_URL").unwrap_or_else(|_| DEFAULT_CLOUD_URL.into());
        let cloud_url = normalize_base_url("CLOUD_URL", &cloud_url)?;

        let bridge_id = std::env::var("BRIDGE_ID")
            .ok()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(generate_bridge_id);

        let credential_path = std::env::var("CREDENTIAL_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CREDENTIAL_PATH));

        let health_port = parse_env_number("HEALTH_PORT", DEFAULT_HEALTH_PORT)?;
        let heartbeat_interval_ms: u64 =
            parse_env_number("HEARTBEAT_INTERVAL_MS", DEFAULT_HEARTBEAT_INTERVAL_MS)?;

        Ok(Self {
            ha_url,
            ha_token,
            cloud_url,
            bridge_id,
            credential_path,
            health_port,
            heartbeat_interval: Duration::from_millis(heartbeat_interval_ms),
        })
    }
}

fn parse_env_number<T: std::str::FromStr>(
    name: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| ConfigError::InvalidNumber { name, value: raw }),
        Err(_) => Ok(default),
    }
}

/// Validate a base URL and strip any trailing slash so paths can be appended
/// uniformly.
fn normalize_base_url(name: &'static str, raw: &str) -> Result<String, ConfigError> {
    let trimmed = raw.trim().trim_end_matches('/');
    Url::parse(trimmed).map_err(|err| ConfigError::InvalidUrl {
        name,
        value: raw.to_string(),
        reason: err.to_string(),
    })?;
    Ok(trimmed.to_string())
}

/// Stable id of the form `helm-bridge-<8 lowercase alnum>`, minted once and
/// then pinned via the BRIDGE_ID environment variable or the credential file.
pub fn generate_bridge_id() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .map(|c| char::from(c).to_ascii_lowercase())
        .take(8)
        .collect();
    format!("helm-bridge-{suffix}")
}
