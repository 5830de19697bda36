use chrono::{DateTime, Utc};
use helm_proto::HeartbeatStats;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use crate::BRIDGE_VERSION;

/// Connection-health counters shared by the hub pump, the batcher, and the
/// cloud session's heartbeat ticker.
#[derive(Debug)]
pub struct BridgeStats {
    started: Instant,
    ha_connected: AtomicBool,
    ha_version: Mutex<Option<String>>,
    entity_count: AtomicUsize,
    last_event_at: Mutex<Option<DateTime<Utc>>>,
    cloud_reconnects: AtomicU64,
}

impl Default for BridgeStats {
    fn default() -> Self {
        Self {
            started: Instant::now(),
            ha_connected: AtomicBool::new(false),
            ha_version: Mutex::new(None),
            entity_count: AtomicUsize::new(0),
            last_event_at: Mutex::new(None),
            cloud_reconnects: AtomicU64::new(0),
        }
    }
}

impl BridgeStats {
    pub fn set_ha_connected(&self, connected: bool) {
        self.ha_connected.store(connected, Ordering::Relaxed);
    }

    pub fn ha_connected(&self) -> bool {
        self.ha_connected.load(Ordering::Relaxed)
    }

    pub fn set_ha_version(&self, version: Option<String>) {
        *self.ha_version.lock().unwrap() = version;
    }

    pub fn ha_version(&self) -> Option<String> {
        self.ha_version.lock().unwrap().clone()
    }

    pub fn set_entity_count(&self, count: usize) {
        self.entity_count.store(count, Ordering::Relaxed);
    }

    pub fn record_event(&self, timestamp: DateTime<Utc>) {
        *self.last_event_at.lock().unwrap() = Some(timestamp);
    }

    pub fn record_cloud_reconnect(&self) {
        self.cloud_reconnects.fetch_add(1, Ordering::Relaxed);
    }

    /// Assemble the payload for one heartbeat frame.
    pub fn heartbeat(&self, bridge_id: &str) -> HeartbeatStats {
        HeartbeatStats {
            bridge_id: bridge_id.to_string(),
            timestamp: Utc::now(),
            bridge_version: BRIDGE_VERSION.to_string(),
            protocol_version: helm_proto::PROTOCOL_VERSION,
            ha_version: self.ha_version(),
            ha_connected: self.ha_connected(),
            cloud_connected: true,
            last_event_at: *self.last_event_at.lock().unwrap(),
            entity_count: self.entity_count.load(Ordering::Relaxed),
            reconnect_count: self.cloud_reconnects.load(Ordering::Relaxed),
            uptime_seconds: self.started.elapsed().as_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_reflects_recorded_state() {
        let stats = BridgeStats::default();
        stats.set_ha_connected(true);
        stats.set_ha_version(Some("2024.6.1".into()));
        stats.set_entity_count(12);
        stats.record_cloud_reconnect();
        stats.record_cloud_reconnect();
        let now = Utc::now();
        stats.record_event(now);

        let heartbeat = stats.heartbeat("helm-bridge-abcd1234");
        assert_eq!(heartbeat.bridge_id, "helm-bridge-abcd1234");
        assert_eq!(heartbeat.ha_version.as_deref(), Some("2024.6.1"));
        assert!(heartbeat.ha_connected);
        assert!(heartbeat.cloud_connected);
        assert_eq!(heartbeat.entity_count, 12);
        assert_eq!(heartbeat.reconnect_count, 2);
        assert_eq!(heartbeat.last_event_at, Some(now));
    }
}
