//! Bridge orchestrator: wires the hub session, the cloud session, the state
//! batcher, and the pairing coordinator together, and owns the shutdown
//! sequence. Components talk through channels; the wiring happens here once.

use anyhow::{bail, Context, Result};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::batcher;
use crate::cloud::{CloudClient, CloudEvent, CloudSettings};
use crate::config::BridgeConfig;
use crate::credentials::CredentialStore;
use crate::executor;
use crate::hub::{HubClient, HubEvent, HubSettings};
use crate::logs::LogRing;
use crate::pairing::{PairingCoordinator, PairingOutcome};
use crate::stats::BridgeStats;
use crate::sync::collect_full_sync;

pub async fn run(config: BridgeConfig) -> Result<()> {
    let store = Arc::new(CredentialStore::new(&config.credential_path));
    let paired = store.load().is_some();
    let stats = Arc::new(BridgeStats::default());
    let ring = LogRing::default();

    info!(
        bridge_id = %config.bridge_id,
        ha_url = %config.ha_url,
        cloud_url = %config.cloud_url,
        health_port = config.health_port,
        paired,
        "starting helm bridge"
    );

    let cloud_settings = CloudSettings::new(
        &config.cloud_url,
        &config.bridge_id,
        config.heartbeat_interval,
    )
    .context("invalid cloud configuration")?;
    let (cloud, mut cloud_events, cloud_authenticated) = CloudClient::spawn(
        cloud_settings,
        store.clone(),
        stats.clone(),
        ring.clone(),
    );

    let (batch_tx, mut batch_rx) = mpsc::unbounded_channel();
    let (ingest_tx, batcher_task) =
        batcher::spawn(stats.clone(), cloud_authenticated, batch_tx);

    let hub_settings =
        HubSettings::new(&config.ha_url, &config.ha_token).context("invalid hub configuration")?;
    let (hub, mut hub_events) = HubClient::spawn(hub_settings);

    // Startup probe: the hub must come up and authenticate before anything
    // else happens. State changes arriving during the wait flow straight
    // into the batcher.
    wait_for_hub(&mut hub_events, &stats, &ring, &ingest_tx).await?;

    match hub.get_config().await {
        Ok(hub_config) => {
            let version = hub_config
                .get("version")
                .and_then(Value::as_str)
                .map(str::to_string);
            info!(ha_version = ?version, "hub reachable");
            stats.set_ha_version(version);
        }
        Err(err) => warn!(error = %err, "hub config query failed; version unknown"),
    }
    preload_entities(&hub, &stats).await;

    if store.is_paired() {
        cloud.connect();
    } else {
        let coordinator = PairingCoordinator::new(
            config.cloud_url.clone(),
            config.bridge_id.clone(),
            stats.ha_version(),
            store.clone(),
            ring.clone(),
        )
        .context("pairing client setup failed")?;
        let cloud_for_pairing = cloud.clone();
        tokio::spawn(async move {
            match coordinator.run().await {
                Ok(PairingOutcome::Paired) => cloud_for_pairing.connect(),
                Ok(outcome) => warn!(?outcome, "pairing did not complete"),
                Err(err) => error!(error = %err, "pairing flow failed"),
            }
        });
    }

    // Main event pump. Each session emits events; results flow back through
    // the session handles.
    let mut hub_open = true;
    let mut cloud_open = true;
    loop {
        tokio::select! {
            _ = shutdown_signal() => {
                info!("shutdown signal received");
                break;
            }
            event = hub_events.recv(), if hub_open => match event {
                Some(event) => handle_hub_event(event, &stats, &ring, &ingest_tx),
                None => {
                    error!("hub session ended; restart the bridge to reconnect");
                    hub_open = false;
                }
            },
            event = cloud_events.recv(), if cloud_open => match event {
                Some(event) => handle_cloud_event(event, &hub, &cloud, &stats, &ring),
                None => {
                    error!("cloud session ended; restart the bridge to reconnect");
                    cloud_open = false;
                }
            },
            batch = batch_rx.recv() => {
                if let Some(batch) = batch {
                    cloud.send_state_batch(batch);
                }
            }
        }
    }

    // Graceful shutdown: flush the batcher, then take the sessions down.
    drop(ingest_tx);
    let _ = batcher_task.await;
    while let Ok(batch) = batch_rx.try_recv() {
        cloud.send_state_batch(batch);
    }
    cloud.disconnect();
    hub.disconnect();
    info!("bridge stopped");
    Ok(())
}

/// Block until the hub session authenticates. Fatal when the token is
/// rejected or the reconnect attempts run out before first contact.
async fn wait_for_hub(
    hub_events: &mut mpsc::UnboundedReceiver<HubEvent>,
    stats: &BridgeStats,
    ring: &LogRing,
    ingest_tx: &mpsc::UnboundedSender<crate::hub::protocol::StateChange>,
) -> Result<()> {
    loop {
        match hub_events.recv().await {
            Some(HubEvent::Authenticated { ha_version }) => {
                stats.set_ha_connected(true);
                if ha_version.is_some() {
                    stats.set_ha_version(ha_version);
                }
                ring.record("info", "hub session authenticated");
                return Ok(());
            }
            Some(HubEvent::AuthFailed { message }) => {
                ring.record("error", format!("hub authentication failed: {message}"));
                bail!("hub authentication failed: {message}");
            }
            Some(HubEvent::Error { message }) => {
                bail!("hub unreachable: {message}");
            }
            Some(HubEvent::StateChanged(change)) => {
                let _ = ingest_tx.send(change);
            }
            Some(HubEvent::Disconnected) => {}
            None => bail!("hub session ended before authenticating"),
        }
    }
}

/// Load the entity registry and initial states. Both are non-fatal; the
/// entity count just stays at zero until the first full sync.
async fn preload_entities(hub: &HubClient, stats: &BridgeStats) {
    match hub.get_entities().await {
        Ok(registry) => {
            let registered = registry.as_array().map(Vec::len).unwrap_or(0);
            debug!(registered, "entity registry loaded");
        }
        Err(err) => warn!(error = %err, "entity registry preload failed"),
    }
    match hub.get_states().await {
        Ok(states) => {
            let count = states.as_array().map(Vec::len).unwrap_or(0);
            stats.set_entity_count(count);
            info!(entities = count, "initial states loaded");
        }
        Err(err) => warn!(error = %err, "initial state preload failed"),
    }
}

fn handle_hub_event(
    event: HubEvent,
    stats: &BridgeStats,
    ring: &LogRing,
    ingest_tx: &mpsc::UnboundedSender<crate::hub::protocol::StateChange>,
) {
    match event {
        HubEvent::StateChanged(change) => {
            let _ = ingest_tx.send(change);
        }
        HubEvent::Authenticated { ha_version } => {
            stats.set_ha_connected(true);
            if ha_version.is_some() {
                stats.set_ha_version(ha_version);
            }
            ring.record("info", "hub session authenticated");
        }
        HubEvent::Disconnected => {
            stats.set_ha_connected(false);
            ring.record("warn", "hub disconnected");
        }
        HubEvent::AuthFailed { message } => {
            error!(%message, "hub rejected the access token; update HA_TOKEN and restart");
            ring.record("error", format!("hub authentication failed: {message}"));
        }
        HubEvent::Error { message } => {
            error!(%message, "hub session error");
            ring.record("error", message);
        }
    }
}

fn handle_cloud_event(
    event: CloudEvent,
    hub: &HubClient,
    cloud: &CloudClient,
    stats: &Arc<BridgeStats>,
    ring: &LogRing,
) {
    match event {
        CloudEvent::Connected => debug!("cloud socket connected"),
        CloudEvent::Authenticated { tenant_id } => {
            info!(?tenant_id, "cloud session established");
        }
        CloudEvent::Command(envelope) => {
            let hub = hub.clone();
            let cloud = cloud.clone();
            let stats = stats.clone();
            tokio::spawn(async move {
                for frame in executor::execute(&hub, &stats, &envelope).await {
                    cloud.send_message(frame);
                }
            });
        }
        CloudEvent::RequestFullSync => {
            let hub = hub.clone();
            let cloud = cloud.clone();
            let stats = stats.clone();
            tokio::spawn(async move {
                let data = collect_full_sync(&hub).await;
                stats.set_entity_count(data.entities.len());
                cloud.send_full_sync(data);
            });
        }
        CloudEvent::Disconnected => {
            debug!("cloud disconnected");
        }
        CloudEvent::AuthFailed { message } => {
            warn!(%message, "cloud credential rejected; pair the bridge again");
        }
        CloudEvent::Error { message } => {
            warn!(%message, "cloud session error");
            ring.record("warn", message);
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut term = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            Ok(term) => term,
            Err(err) => {
                warn!(error = %err, "SIGTERM handler unavailable; relying on ctrl-c");
                let _ = ctrl_c.await;
                return;
            }
        };
        tokio::select! {
            _ = ctrl_c => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
