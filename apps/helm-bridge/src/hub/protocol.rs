//! The hub's native WebSocket framing: an auth handshake followed by
//! numbered request/response pairs and un-numbered event pushes.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Map, Value};

/// Frames the hub sends to us. Anything outside this set is dropped by the
/// session loop without failing the connection.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HubFrame {
    AuthRequired {
        #[serde(default)]
        ha_version: Option<String>,
    },
    AuthOk {
        #[serde(default)]
        ha_version: Option<String>,
    },
    AuthInvalid {
        #[serde(default)]
        message: Option<String>,
    },
    Result {
        id: u64,
        success: bool,
        #[serde(default)]
        result: Option<Value>,
        #[serde(default)]
        error: Option<HubResultError>,
    },
    Event {
        #[serde(default)]
        id: Option<u64>,
        event: HubEventFrame,
    },
    Pong {
        #[serde(default)]
        id: Option<u64>,
    },
}

const HUB_FRAME_TYPES: &[&str] = &[
    "auth_required",
    "auth_ok",
    "auth_invalid",
    "result",
    "event",
    "pong",
];

impl HubFrame {
    /// Decode an inbound text frame, returning `None` for frame types the
    /// bridge does not care about.
    pub fn decode(raw: &str) -> Result<Option<Self>, serde_json::Error> {
        let value: Value = serde_json::from_str(raw)?;
        let known = value
            .get("type")
            .and_then(Value::as_str)
            .map(|tag| HUB_FRAME_TYPES.contains(&tag))
            .unwrap_or(false);
        if !known {
            return Ok(None);
        }
        serde_json::from_value(value).map(Some)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HubResultError {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl HubResultError {
    pub fn message(&self) -> String {
        self.message
            .clone()
            .unwrap_or_else(|| "hub command failed".to_string())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HubEventFrame {
    pub event_type: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub time_fired: Option<DateTime<Utc>>,
}

/// A single `state_changed` push, extracted from an event frame. The state
/// payloads stay opaque: a string value, an attribute dictionary, and two
/// timestamps, exactly as the hub shipped them.
#[derive(Debug, Clone, PartialEq)]
pub struct StateChange {
    pub entity_id: String,
    pub old_state: Option<Value>,
    pub new_state: Value,
    pub timestamp: DateTime<Utc>,
}

impl StateChange {
    pub fn from_event(event: HubEventFrame) -> Option<Self> {
        if event.event_type != "state_changed" {
            return None;
        }
        let data = event.data;
        let entity_id = data.get("entity_id")?.as_str()?.to_string();
        let old_state = match data.get("old_state") {
            None | Some(Value::Null) => None,
            Some(state) => Some(state.clone()),
        };
        let new_state = data.get("new_state").cloned().unwrap_or(Value::Null);
        Some(Self {
            entity_id,
            old_state,
            new_state,
            timestamp: event.time_fired.unwrap_or_else(Utc::now),
        })
    }
}

/// Build an outbound command frame: the payload object with `id` and `type`
/// spliced in.
pub fn command_frame(id: u64, command: &str, data: Option<Value>) -> Value {
    let mut object = match data {
        Some(Value::Object(map)) => map,
        Some(other) => {
            let mut map = Map::new();
            map.insert("data".to_string(), other);
            map
        }
        None => Map::new(),
    };
    object.insert("id".to_string(), json!(id));
    object.insert("type".to_string(), json!(command));
    Value::Object(object)
}

pub fn auth_frame(token: &str) -> Value {
    json!({"type": "auth", "access_token": token})
}

pub fn subscribe_state_changes_frame(id: u64) -> Value {
    command_frame(id, "subscribe_events", Some(json!({"event_type": "state_changed"})))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_auth_handshake_frames() {
        let frame = HubFrame::decode(r#"{"type":"auth_required","ha_version":"2024.6.1"}"#)
            .unwrap()
            .unwrap();
        assert!(matches!(frame, HubFrame::AuthRequired { ha_version: Some(v) } if v == "2024.6.1"));

        let frame = HubFrame::decode(r#"{"type":"auth_invalid","message":"bad token"}"#)
            .unwrap()
            .unwrap();
        assert!(matches!(frame, HubFrame::AuthInvalid { message: Some(m) } if m == "bad token"));
    }

    #[test]
    fn unknown_frame_types_are_skipped() {
        assert!(HubFrame::decode(r#"{"type":"zones_updated"}"#)
            .unwrap()
            .is_none());
        assert!(HubFrame::decode(r#"{"no_type_at_all":1}"#).unwrap().is_none());
    }

    #[test]
    fn command_frame_splices_id_and_type() {
        let frame = command_frame(
            7,
            "call_service",
            Some(json!({"domain": "light", "service": "turn_on"})),
        );
        assert_eq!(frame["id"], 7);
        assert_eq!(frame["type"], "call_service");
        assert_eq!(frame["domain"], "light");
    }

    #[test]
    fn state_change_extraction() {
        let event = HubEventFrame {
            event_type: "state_changed".into(),
            data: json!({
                "entity_id": "light.kitchen",
                "old_state": null,
                "new_state": {"state": "on", "attributes": {}}
            }),
            time_fired: Some(Utc::now()),
        };
        let change = StateChange::from_event(event).unwrap();
        assert_eq!(change.entity_id, "light.kitchen");
        assert!(change.old_state.is_none());
        assert_eq!(change.new_state["state"], "on");
    }

    #[test]
    fn non_state_events_are_ignored() {
        let event = HubEventFrame {
            event_type: "service_registered".into(),
            data: json!({}),
            time_fired: None,
        };
        assert!(StateChange::from_event(event).is_none());
    }
}
