//! Full-sync collector: snapshots the hub's topology and state into a single
//! `full_sync` payload. Each of the five registry queries is independently
//! tolerant of failure; a failed sub-collection becomes an empty one.

use chrono::{DateTime, Utc};
use helm_proto::{EntitySnapshot, FullSyncData, ServiceDomain};
use serde_json::Value;
use std::collections::HashMap;
use tracing::warn;

use crate::hub::{HubApi, HubError};

pub async fn collect_full_sync(hub: &dyn HubApi) -> FullSyncData {
    let (areas, devices, entities, states, services) = tokio::join!(
        hub.get_areas(),
        hub.get_devices(),
        hub.get_entities(),
        hub.get_states(),
        hub.get_services(),
    );

    let areas = collection_or_empty("areas", areas);
    let devices = collection_or_empty("devices", devices);
    let registry = collection_or_empty("entities", entities);
    let states = collection_or_empty("states", states);
    let services = services_or_empty(services);

    let registry_index = index_registry(&registry);
    let entities = states
        .into_iter()
        .filter_map(|state| entity_snapshot(state, &registry_index))
        .collect();

    FullSyncData {
        areas,
        devices,
        entities,
        services,
    }
}

fn collection_or_empty(name: &'static str, result: Result<Value, HubError>) -> Vec<Value> {
    match result {
        Ok(Value::Array(items)) => items,
        Ok(_) => {
            warn!(
                target: "bridge::sync",
                collection = name,
                "hub returned a non-list payload; substituting empty"
            );
            Vec::new()
        }
        Err(err) => {
            warn!(
                target: "bridge::sync",
                collection = name,
                error = %err,
                "hub query failed; substituting empty"
            );
            Vec::new()
        }
    }
}

/// The hub reports services as a map of domain → service map; the cloud wants
/// an array of `{domain, services}`.
fn services_or_empty(result: Result<Value, HubError>) -> Vec<ServiceDomain> {
    match result {
        Ok(Value::Object(domains)) => domains
            .into_iter()
            .map(|(domain, services)| ServiceDomain { domain, services })
            .collect(),
        Ok(_) => {
            warn!(
                target: "bridge::sync",
                collection = "services",
                "hub returned a non-object services payload; substituting empty"
            );
            Vec::new()
        }
        Err(err) => {
            warn!(
                target: "bridge::sync",
                collection = "services",
                error = %err,
                "hub services query failed; substituting empty"
            );
            Vec::new()
        }
    }
}

struct RegistryEntry {
    device_id: Option<String>,
    area_id: Option<String>,
}

fn index_registry(registry: &[Value]) -> HashMap<String, RegistryEntry> {
    registry
        .iter()
        .filter_map(|entry| {
            let entity_id = entry.get("entity_id")?.as_str()?.to_string();
            Some((
                entity_id,
                RegistryEntry {
                    device_id: string_field(entry, "device_id"),
                    area_id: string_field(entry, "area_id"),
                },
            ))
        })
        .collect()
}

fn entity_snapshot(
    state: Value,
    registry: &HashMap<String, RegistryEntry>,
) -> Option<EntitySnapshot> {
    let entity_id = state.get("entity_id")?.as_str()?.to_string();
    let entry = registry.get(&entity_id);
    Some(EntitySnapshot {
        state: state
            .get("state")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        attributes: state.get("attributes").cloned().unwrap_or(Value::Null),
        last_changed: timestamp_field(&state, "last_changed"),
        last_updated: timestamp_field(&state, "last_updated"),
        device_id: entry.and_then(|e| e.device_id.clone()),
        area_id: entry.and_then(|e| e.area_id.clone()),
        entity_id,
    })
}

fn string_field(value: &Value, key: &str) -> Option<String> {
    value.get(key)?.as_str().map(str::to_string)
}

fn timestamp_field(value: &Value, key: &str) -> Option<DateTime<Utc>> {
    serde_json::from_value(value.get(key)?.clone()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;

    /// Scripted hub whose registry queries can be failed individually.
    struct MockHub {
        fail_areas: bool,
    }

    #[async_trait]
    impl HubApi for MockHub {
        async fn get_config(&self) -> Result<Value, HubError> {
            Ok(json!({"version": "2024.6.1"}))
        }

        async fn get_areas(&self) -> Result<Value, HubError> {
            if self.fail_areas {
                Err(HubError::Timeout)
            } else {
                Ok(json!([{"area_id": "kitchen", "name": "Kitchen"}]))
            }
        }

        async fn get_devices(&self) -> Result<Value, HubError> {
            Ok(json!([{"id": "dev1", "name": "Hue Bulb"}]))
        }

        async fn get_entities(&self) -> Result<Value, HubError> {
            Ok(json!([
                {"entity_id": "light.kitchen", "device_id": "dev1", "area_id": "kitchen"},
                {"entity_id": "sensor.orphan", "device_id": null, "area_id": null}
            ]))
        }

        async fn get_states(&self) -> Result<Value, HubError> {
            Ok(json!([
                {
                    "entity_id": "light.kitchen",
                    "state": "on",
                    "attributes": {"brightness": 255},
                    "last_changed": "2026-01-15T12:00:00Z",
                    "last_updated": "2026-01-15T12:00:00Z"
                },
                {"entity_id": "sensor.unregistered", "state": "7", "attributes": {}}
            ]))
        }

        async fn get_services(&self) -> Result<Value, HubError> {
            Ok(json!({
                "light": {"turn_on": {}, "turn_off": {}},
                "switch": {"toggle": {}}
            }))
        }

        async fn call_service(
            &self,
            _domain: &str,
            _service: &str,
            _service_data: Value,
        ) -> Result<Value, HubError> {
            Ok(Value::Null)
        }
    }

    #[tokio::test]
    async fn snapshot_joins_registry_into_entities() {
        let data = collect_full_sync(&MockHub { fail_areas: false }).await;

        assert_eq!(data.areas.len(), 1);
        assert_eq!(data.devices.len(), 1);
        assert_eq!(data.entities.len(), 2);

        let kitchen = data
            .entities
            .iter()
            .find(|e| e.entity_id == "light.kitchen")
            .unwrap();
        assert_eq!(kitchen.state, "on");
        assert_eq!(kitchen.device_id.as_deref(), Some("dev1"));
        assert_eq!(kitchen.area_id.as_deref(), Some("kitchen"));

        let unregistered = data
            .entities
            .iter()
            .find(|e| e.entity_id == "sensor.unregistered")
            .unwrap();
        assert!(unregistered.device_id.is_none());
        assert!(unregistered.area_id.is_none());
    }

    #[tokio::test]
    async fn services_become_domain_array() {
        let data = collect_full_sync(&MockHub { fail_areas: false }).await;
        let domains: Vec<&str> = data.services.iter().map(|s| s.domain.as_str()).collect();
        assert!(domains.contains(&"light"));
        assert!(domains.contains(&"switch"));
        let light = data.services.iter().find(|s| s.domain == "light").unwrap();
        assert!(light.services.get("turn_on").is_some());
    }

    #[tokio::test]
    async fn failed_sub_collection_becomes_empty_without_aborting() {
        let data = collect_full_sync(&MockHub { fail_areas: true }).await;
        assert!(data.areas.is_empty());
        assert_eq!(data.devices.len(), 1);
        assert_eq!(data.entities.len(), 2);
        assert!(!data.services.is_empty());
    }
}
