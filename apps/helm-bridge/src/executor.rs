//! Command executor: turns a cloud command envelope into hub RPC calls and
//! the outbound frames reporting the outcome. Acknowledgement is the cloud
//! session's job and has already happened by the time a command lands here.

use chrono::Utc;
use helm_proto::{
    BridgeMessage, CommandEnvelope, CommandError, CommandStatus, CommandType, FullSyncData,
};
use serde_json::{json, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::hub::HubApi;
use crate::stats::BridgeStats;
use crate::sync::collect_full_sync;

/// Execute one command. The returned frames are emitted to the cloud in
/// order; the last one is always the `command_result`.
pub async fn execute(
    hub: &dyn HubApi,
    stats: &BridgeStats,
    envelope: &CommandEnvelope,
) -> Vec<BridgeMessage> {
    if envelope.is_expired(Utc::now()) {
        debug!(
            target: "bridge::executor",
            cmd_id = %envelope.cmd_id,
            ttl_ms = ?envelope.ttl_ms,
            "command expired before dispatch"
        );
        return vec![result(envelope.cmd_id, CommandStatus::Expired, None, None)];
    }

    match envelope.command_type {
        CommandType::HaCallService => vec![call_service(hub, envelope).await],
        CommandType::HaFullResync => full_resync(hub, stats, envelope).await,
        CommandType::HaRefreshEntity => vec![refresh_entity(hub, envelope).await],
        CommandType::Unknown => {
            warn!(
                target: "bridge::executor",
                cmd_id = %envelope.cmd_id,
                "unrecognized command type"
            );
            vec![failed(
                envelope.cmd_id,
                CommandError::unknown_command("unrecognized command type"),
            )]
        }
    }
}

async fn call_service(hub: &dyn HubApi, envelope: &CommandEnvelope) -> BridgeMessage {
    let payload = &envelope.payload;
    let (domain, service) = match (
        payload.get("domain").and_then(Value::as_str),
        payload.get("service").and_then(Value::as_str),
    ) {
        (Some(domain), Some(service)) => (domain, service),
        _ => {
            return failed(
                envelope.cmd_id,
                CommandError::execution_failed("payload is missing domain or service"),
            )
        }
    };
    let service_data = payload
        .get("serviceData")
        .cloned()
        .unwrap_or_else(|| json!({}));

    match hub.call_service(domain, service, service_data).await {
        Ok(response) => result(
            envelope.cmd_id,
            CommandStatus::Completed,
            Some(json!({"haResponse": response})),
            None,
        ),
        Err(err) => {
            warn!(
                target: "bridge::executor",
                cmd_id = %envelope.cmd_id,
                domain,
                service,
                error = %err,
                "service call failed"
            );
            failed(
                envelope.cmd_id,
                CommandError::execution_failed(err.to_string()),
            )
        }
    }
}

/// Resync runs the full-sync collector and ships a fresh snapshot ahead of
/// the command result, so the cloud's copy is rebuilt even though it never
/// asked with `request_full_sync`.
async fn full_resync(
    hub: &dyn HubApi,
    stats: &BridgeStats,
    envelope: &CommandEnvelope,
) -> Vec<BridgeMessage> {
    let data = collect_full_sync(hub).await;
    stats.set_entity_count(data.entities.len());
    let summary = json!({
        "areas": data.areas.len(),
        "devices": data.devices.len(),
        "entities": data.entities.len(),
        "services": data.services.len(),
    });
    vec![
        full_sync_frame(stats, data),
        result(
            envelope.cmd_id,
            CommandStatus::Completed,
            Some(summary),
            None,
        ),
    ]
}

async fn refresh_entity(hub: &dyn HubApi, envelope: &CommandEnvelope) -> BridgeMessage {
    let Some(entity_id) = envelope.payload.get("entityId").and_then(Value::as_str) else {
        return failed(
            envelope.cmd_id,
            CommandError::execution_failed("payload is missing entityId"),
        );
    };

    let states = match hub.get_states().await {
        Ok(states) => states,
        Err(err) => {
            return failed(
                envelope.cmd_id,
                CommandError::execution_failed(err.to_string()),
            )
        }
    };

    let state = states.as_array().and_then(|states| {
        states
            .iter()
            .find(|state| state.get("entity_id").and_then(Value::as_str) == Some(entity_id))
            .cloned()
    });

    match state {
        Some(state) => result(
            envelope.cmd_id,
            CommandStatus::Completed,
            Some(json!({"state": state})),
            None,
        ),
        None => failed(
            envelope.cmd_id,
            CommandError::execution_failed(format!("entity {entity_id} not found")),
        ),
    }
}

pub fn full_sync_frame(stats: &BridgeStats, data: FullSyncData) -> BridgeMessage {
    BridgeMessage::FullSync {
        synced_at: Utc::now(),
        ha_version: stats.ha_version().unwrap_or_else(|| "unknown".into()),
        data,
    }
}

fn result(
    cmd_id: Uuid,
    status: CommandStatus,
    result: Option<Value>,
    error: Option<CommandError>,
) -> BridgeMessage {
    BridgeMessage::CommandResult {
        cmd_id,
        status,
        result,
        error,
    }
}

fn failed(cmd_id: Uuid, error: CommandError) -> BridgeMessage {
    result(cmd_id, CommandStatus::Failed, None, Some(error))
}
