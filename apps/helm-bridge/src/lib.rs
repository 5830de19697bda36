pub mod batcher;
pub mod bridge;
pub mod cloud;
pub mod config;
pub mod credentials;
pub mod executor;
pub mod hub;
pub mod logs;
pub mod pairing;
pub mod stats;
pub mod sync;
pub mod telemetry;

/// Version string reported to the cloud in heartbeats and pairing requests.
pub const BRIDGE_VERSION: &str = env!("CARGO_PKG_VERSION");
