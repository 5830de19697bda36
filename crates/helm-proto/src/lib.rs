//! Shared protocol definitions for bridge ↔ cloud communication.
//! Keeping this in a dedicated crate allows regeneration of bindings
//! for the cloud side without pulling in the bridge runtime.
//!
//! Every frame is a single JSON object with a required string field `type`
//! discriminating the variant. Unknown inbound types must never be fatal:
//! [`decode_cloud_message`] reports them as [`DecodeError::UnknownType`] so
//! the session loop can log and drop the frame.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Protocol revision carried in `authenticate` and `heartbeat` frames.
pub const PROTOCOL_VERSION: u32 = 1;

/// Messages sent from the bridge to the cloud.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeMessage {
    #[serde(rename_all = "camelCase")]
    Authenticate {
        bridge_id: String,
        bridge_credential: String,
        protocol_version: u32,
    },
    #[serde(rename_all = "camelCase")]
    Heartbeat {
        #[serde(flatten)]
        stats: HeartbeatStats,
    },
    #[serde(rename_all = "camelCase")]
    FullSync {
        synced_at: DateTime<Utc>,
        ha_version: String,
        data: FullSyncData,
    },
    #[serde(rename_all = "camelCase")]
    StateBatch {
        batch_id: Uuid,
        is_overflow: bool,
        events: Vec<BatchEvent>,
    },
    /// Defined in the schema; the bridge currently never emits it.
    #[serde(rename_all = "camelCase")]
    SyncStatus {
        status: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    CommandAck {
        cmd_id: Uuid,
        status: CommandStatus,
        received_at: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    CommandResult {
        cmd_id: Uuid,
        status: CommandStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<CommandError>,
    },
    #[serde(rename_all = "camelCase")]
    Error { code: String, message: String },
    #[serde(rename_all = "camelCase")]
    BridgeLogs {
        bridge_id: String,
        lines: Vec<LogLine>,
    },
}

/// Messages received from the cloud.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CloudMessage {
    #[serde(rename_all = "camelCase")]
    AuthResult {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tenant_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Command {
        #[serde(flatten)]
        envelope: CommandEnvelope,
    },
    RequestFullSync,
    RequestHeartbeat,
    #[serde(rename_all = "camelCase")]
    Disconnect {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    RequestLogs {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        lines: Option<usize>,
    },
}

/// A command issued by the cloud for execution against the hub.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CommandEnvelope {
    pub cmd_id: Uuid,
    pub tenant_id: String,
    pub issued_at: DateTime<Utc>,
    pub command_type: CommandType,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub requires_ack: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_ms: Option<u64>,
}

impl CommandEnvelope {
    /// True once `ttl_ms` has elapsed since `issued_at`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.ttl_ms {
            Some(ttl) => {
                let age = now.signed_duration_since(self.issued_at);
                age.num_milliseconds() >= ttl as i64
            }
            None => false,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CommandType {
    HaCallService,
    HaFullResync,
    HaRefreshEntity,
    /// Anything the bridge does not recognize; answered with a failed result.
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Acknowledged,
    Completed,
    Failed,
    Expired,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CommandError {
    pub code: String,
    pub message: String,
}

impl CommandError {
    pub fn execution_failed(message: impl Into<String>) -> Self {
        Self {
            code: "EXECUTION_FAILED".into(),
            message: message.into(),
        }
    }

    pub fn unknown_command(message: impl Into<String>) -> Self {
        Self {
            code: "UNKNOWN_COMMAND".into(),
            message: message.into(),
        }
    }
}

/// One coalesced state change inside a `state_batch` frame.
///
/// The state payloads are opaque to the protocol: the hub's shape (a string
/// value, an attribute dictionary, two timestamps) passes through untouched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BatchEvent {
    pub entity_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_state: Option<Value>,
    pub new_state: Value,
    pub timestamp: DateTime<Utc>,
}

/// Snapshot payload inside a `full_sync` frame.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FullSyncData {
    pub areas: Vec<Value>,
    pub devices: Vec<Value>,
    pub entities: Vec<EntitySnapshot>,
    pub services: Vec<ServiceDomain>,
}

/// An entity's current state joined with its registry entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EntitySnapshot {
    pub entity_id: String,
    pub state: String,
    #[serde(default)]
    pub attributes: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_changed: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub area_id: Option<String>,
}

/// One service domain with its service map, as reshaped from the hub's
/// map-of-maps response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceDomain {
    pub domain: String,
    pub services: Value,
}

/// Connection-health statistics carried by every heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatStats {
    pub bridge_id: String,
    pub timestamp: DateTime<Utc>,
    pub bridge_version: String,
    pub protocol_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ha_version: Option<String>,
    pub ha_connected: bool,
    pub cloud_connected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_event_at: Option<DateTime<Utc>>,
    pub entity_count: usize,
    pub reconnect_count: u64,
    pub uptime_seconds: u64,
}

/// One captured log line inside a `bridge_logs` frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LogLine {
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("frame is not a JSON object: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("frame is missing the `type` field")]
    MissingType,
    #[error("unknown message type `{0}`")]
    UnknownType(String),
    #[error("invalid `{message_type}` frame: {source}")]
    Invalid {
        message_type: String,
        #[source]
        source: serde_json::Error,
    },
}

const CLOUD_MESSAGE_TYPES: &[&str] = &[
    "auth_result",
    "command",
    "request_full_sync",
    "request_heartbeat",
    "disconnect",
    "request_logs",
];

/// Encode an outbound frame as a single JSON text message.
pub fn encode_bridge_message(message: &BridgeMessage) -> Result<String, serde_json::Error> {
    serde_json::to_string(message)
}

/// Decode an inbound cloud frame, distinguishing unknown types (which the
/// session drops with a log line) from schema violations on known types.
pub fn decode_cloud_message(raw: &str) -> Result<CloudMessage, DecodeError> {
    let value: Value = serde_json::from_str(raw)?;
    let message_type = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(DecodeError::MissingType)?
        .to_string();
    if !CLOUD_MESSAGE_TYPES.contains(&message_type.as_str()) {
        return Err(DecodeError::UnknownType(message_type));
    }
    serde_json::from_value(value).map_err(|source| DecodeError::Invalid {
        message_type,
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn roundtrip(message: BridgeMessage) {
        let encoded = encode_bridge_message(&message).unwrap();
        let decoded: BridgeMessage = serde_json::from_str(&encoded).unwrap();
        assert_eq!(message, decoded);
    }

    #[test]
    fn bridge_message_variants_roundtrip() {
        roundtrip(BridgeMessage::Authenticate {
            bridge_id: "helm-bridge-abcd1234".into(),
            bridge_credential: "bc_deadbeef".into(),
            protocol_version: PROTOCOL_VERSION,
        });
        roundtrip(BridgeMessage::Heartbeat {
            stats: HeartbeatStats {
                bridge_id: "helm-bridge-abcd1234".into(),
                timestamp: Utc::now(),
                bridge_version: "0.3.1".into(),
                protocol_version: PROTOCOL_VERSION,
                ha_version: Some("2024.6.1".into()),
                ha_connected: true,
                cloud_connected: true,
                last_event_at: None,
                entity_count: 42,
                reconnect_count: 3,
                uptime_seconds: 120,
            },
        });
        roundtrip(BridgeMessage::FullSync {
            synced_at: Utc::now(),
            ha_version: "2024.6.1".into(),
            data: FullSyncData {
                areas: vec![json!({"area_id": "kitchen"})],
                devices: vec![json!({"id": "dev1"})],
                entities: vec![EntitySnapshot {
                    entity_id: "light.kitchen".into(),
                    state: "on".into(),
                    attributes: json!({"brightness": 255}),
                    last_changed: Some(Utc::now()),
                    last_updated: Some(Utc::now()),
                    device_id: Some("dev1".into()),
                    area_id: Some("kitchen".into()),
                }],
                services: vec![ServiceDomain {
                    domain: "light".into(),
                    services: json!({"turn_on": {}}),
                }],
            },
        });
        roundtrip(BridgeMessage::StateBatch {
            batch_id: Uuid::new_v4(),
            is_overflow: false,
            events: vec![BatchEvent {
                entity_id: "light.kitchen".into(),
                old_state: None,
                new_state: json!({"state": "on"}),
                timestamp: Utc::now(),
            }],
        });
        roundtrip(BridgeMessage::SyncStatus {
            status: "idle".into(),
            message: None,
        });
        roundtrip(BridgeMessage::CommandAck {
            cmd_id: Uuid::new_v4(),
            status: CommandStatus::Acknowledged,
            received_at: Utc::now(),
        });
        roundtrip(BridgeMessage::CommandResult {
            cmd_id: Uuid::new_v4(),
            status: CommandStatus::Completed,
            result: Some(json!({"haResponse": null})),
            error: None,
        });
        roundtrip(BridgeMessage::Error {
            code: "PROTOCOL".into(),
            message: "bad frame".into(),
        });
        roundtrip(BridgeMessage::BridgeLogs {
            bridge_id: "helm-bridge-abcd1234".into(),
            lines: vec![LogLine {
                timestamp: Utc::now(),
                level: "info".into(),
                message: "connected".into(),
            }],
        });
    }

    #[test]
    fn cloud_message_variants_roundtrip() {
        let messages = vec![
            CloudMessage::AuthResult {
                success: true,
                tenant_id: Some("42".into()),
                error: None,
            },
            CloudMessage::Command {
                envelope: CommandEnvelope {
                    cmd_id: Uuid::new_v4(),
                    tenant_id: "42".into(),
                    issued_at: Utc::now(),
                    command_type: CommandType::HaCallService,
                    payload: json!({"domain": "light", "service": "turn_on"}),
                    requires_ack: true,
                    ttl_ms: Some(30_000),
                },
            },
            CloudMessage::RequestFullSync,
            CloudMessage::RequestHeartbeat,
            CloudMessage::Disconnect {
                reason: Some("user_disconnected".into()),
            },
            CloudMessage::RequestLogs { lines: Some(100) },
        ];
        for message in messages {
            let encoded = serde_json::to_string(&message).unwrap();
            let decoded = decode_cloud_message(&encoded).unwrap();
            assert_eq!(message, decoded);
        }
    }

    #[test]
    fn authenticate_frame_uses_wire_names() {
        let frame = encode_bridge_message(&BridgeMessage::Authenticate {
            bridge_id: "helm-bridge-abcd1234".into(),
            bridge_credential: "bc_deadbeef".into(),
            protocol_version: 1,
        })
        .unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["type"], "authenticate");
        assert_eq!(value["bridgeId"], "helm-bridge-abcd1234");
        assert_eq!(value["bridgeCredential"], "bc_deadbeef");
        assert_eq!(value["protocolVersion"], 1);
    }

    #[test]
    fn command_frame_matches_cloud_shape() {
        let raw = json!({
            "type": "command",
            "cmdId": "11111111-1111-1111-1111-111111111111",
            "tenantId": "42",
            "issuedAt": "2026-01-15T12:00:00Z",
            "commandType": "ha_call_service",
            "payload": {
                "domain": "light",
                "service": "turn_on",
                "serviceData": {"entity_id": "light.kitchen"}
            },
            "requiresAck": true
        })
        .to_string();
        match decode_cloud_message(&raw).unwrap() {
            CloudMessage::Command { envelope } => {
                assert_eq!(
                    envelope.cmd_id.to_string(),
                    "11111111-1111-1111-1111-111111111111"
                );
                assert_eq!(envelope.command_type, CommandType::HaCallService);
                assert!(envelope.requires_ack);
                assert_eq!(envelope.ttl_ms, None);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn unrecognized_command_type_decodes_as_unknown() {
        let raw = json!({
            "type": "command",
            "cmdId": "11111111-1111-1111-1111-111111111111",
            "tenantId": "42",
            "issuedAt": "2026-01-15T12:00:00Z",
            "commandType": "ha_reboot",
            "payload": {},
            "requiresAck": false
        })
        .to_string();
        match decode_cloud_message(&raw).unwrap() {
            CloudMessage::Command { envelope } => {
                assert_eq!(envelope.command_type, CommandType::Unknown);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn unknown_type_is_reported_not_fatal() {
        let raw = json!({"type": "totally_new", "anything": 1}).to_string();
        match decode_cloud_message(&raw) {
            Err(DecodeError::UnknownType(tag)) => assert_eq!(tag, "totally_new"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn missing_type_is_an_error() {
        assert!(matches!(
            decode_cloud_message("{\"success\": true}"),
            Err(DecodeError::MissingType)
        ));
    }

    #[test]
    fn known_type_with_bad_schema_is_invalid() {
        let raw = json!({"type": "command", "cmdId": 7}).to_string();
        match decode_cloud_message(&raw) {
            Err(DecodeError::Invalid { message_type, .. }) => {
                assert_eq!(message_type, "command");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn ttl_expiry_is_measured_from_issued_at() {
        let envelope = CommandEnvelope {
            cmd_id: Uuid::new_v4(),
            tenant_id: "42".into(),
            issued_at: Utc::now() - chrono::Duration::milliseconds(5_000),
            command_type: CommandType::HaCallService,
            payload: Value::Null,
            requires_ack: false,
            ttl_ms: Some(1_000),
        };
        assert!(envelope.is_expired(Utc::now()));

        let fresh = CommandEnvelope {
            ttl_ms: Some(60_000),
            ..envelope.clone()
        };
        assert!(!fresh.is_expired(Utc::now()));

        let unbounded = CommandEnvelope {
            ttl_ms: None,
            ..envelope
        };
        assert!(!unbounded.is_expired(Utc::now()));
    }
}
