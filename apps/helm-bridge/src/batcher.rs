//! State batcher: coalesces bursty `state_changed` events into single
//! outbound batches on a debounce timer. Ingestion never blocks the hub
//! read path; a flush swaps the buffer and hands the batch to the cloud
//! session over a channel.

use chrono::Utc;
use helm_proto::BatchEvent;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::hub::protocol::StateChange;
use crate::stats::BridgeStats;

pub const DEBOUNCE: Duration = Duration::from_millis(500);

/// One flushed debounce window, ready to be framed as a `state_batch`.
#[derive(Debug, Clone, PartialEq)]
pub struct FlushedBatch {
    pub batch_id: Uuid,
    pub events: Vec<BatchEvent>,
}

/// Spawn the batcher task. Events go in on the returned sender; flushed
/// batches come out on `batch_tx`. Dropping the sender triggers one final
/// flush before the task exits.
pub fn spawn(
    stats: Arc<BridgeStats>,
    cloud_authenticated: watch::Receiver<bool>,
    batch_tx: mpsc::UnboundedSender<FlushedBatch>,
) -> (mpsc::UnboundedSender<StateChange>, JoinHandle<()>) {
    let (ingest_tx, ingest_rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(run(ingest_rx, stats, cloud_authenticated, batch_tx));
    (ingest_tx, task)
}

async fn run(
    mut ingest_rx: mpsc::UnboundedReceiver<StateChange>,
    stats: Arc<BridgeStats>,
    cloud_authenticated: watch::Receiver<bool>,
    batch_tx: mpsc::UnboundedSender<FlushedBatch>,
) {
    let mut buffer: Vec<StateChange> = Vec::new();
    let mut deadline: Option<Instant> = None;

    loop {
        let flush_at = deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));
        tokio::select! {
            change = ingest_rx.recv() => match change {
                Some(change) => {
                    stats.record_event(change.timestamp);
                    if buffer.is_empty() {
                        deadline = Some(Instant::now() + DEBOUNCE);
                    }
                    buffer.push(change);
                }
                None => {
                    // Shutdown: one final flush of whatever is buffered.
                    flush(&mut buffer, &cloud_authenticated, &batch_tx);
                    break;
                }
            },
            _ = tokio::time::sleep_until(flush_at), if deadline.is_some() => {
                deadline = None;
                flush(&mut buffer, &cloud_authenticated, &batch_tx);
            }
        }
    }
}

fn flush(
    buffer: &mut Vec<StateChange>,
    cloud_authenticated: &watch::Receiver<bool>,
    batch_tx: &mpsc::UnboundedSender<FlushedBatch>,
) {
    if buffer.is_empty() {
        return;
    }
    let drained = std::mem::take(buffer);
    if !*cloud_authenticated.borrow() {
        debug!(
            target: "bridge::batcher",
            dropped = drained.len(),
            "cloud not authenticated; discarding batch"
        );
        return;
    }
    let batch = FlushedBatch {
        batch_id: Uuid::new_v4(),
        events: drained.into_iter().map(to_batch_event).collect(),
    };
    let _ = batch_tx.send(batch);
}

fn to_batch_event(change: StateChange) -> BatchEvent {
    BatchEvent {
        entity_id: change.entity_id,
        old_state: change.old_state,
        new_state: change.new_state,
        timestamp: change.timestamp,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn change(entity_id: &str) -> StateChange {
        StateChange {
            entity_id: entity_id.into(),
            old_state: None,
            new_state: json!({"state": "on"}),
            timestamp: Utc::now(),
        }
    }

    fn harness(
        authenticated: bool,
    ) -> (
        mpsc::UnboundedSender<StateChange>,
        JoinHandle<()>,
        mpsc::UnboundedReceiver<FlushedBatch>,
        watch::Sender<bool>,
    ) {
        let stats = Arc::new(BridgeStats::default());
        let (auth_tx, auth_rx) = watch::channel(authenticated);
        let (batch_tx, batch_rx) = mpsc::unbounded_channel();
        let (ingest_tx, task) = spawn(stats, auth_rx, batch_tx);
        (ingest_tx, task, batch_rx, auth_tx)
    }

    #[tokio::test(start_paused = true)]
    async fn burst_coalesces_into_one_ordered_batch() {
        let (ingest_tx, task, mut batch_rx, _auth) = harness(true);

        for entity in ["sensor.a", "sensor.b", "sensor.a", "sensor.c"] {
            ingest_tx.send(change(entity)).unwrap();
        }
        tokio::time::sleep(DEBOUNCE + Duration::from_millis(50)).await;

        let batch = batch_rx.try_recv().expect("one batch");
        let order: Vec<&str> = batch.events.iter().map(|e| e.entity_id.as_str()).collect();
        assert_eq!(order, vec!["sensor.a", "sensor.b", "sensor.a", "sensor.c"]);
        assert!(batch_rx.try_recv().is_err(), "exactly one batch per window");

        drop(ingest_tx);
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn batches_get_distinct_ids() {
        let (ingest_tx, task, mut batch_rx, _auth) = harness(true);

        ingest_tx.send(change("sensor.a")).unwrap();
        tokio::time::sleep(DEBOUNCE + Duration::from_millis(50)).await;
        ingest_tx.send(change("sensor.b")).unwrap();
        tokio::time::sleep(DEBOUNCE + Duration::from_millis(50)).await;

        let first = batch_rx.try_recv().unwrap();
        let second = batch_rx.try_recv().unwrap();
        assert_ne!(first.batch_id, second.batch_id);

        drop(ingest_tx);
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn unauthenticated_flush_discards_and_empties_buffer() {
        let (ingest_tx, task, mut batch_rx, auth_tx) = harness(false);

        ingest_tx.send(change("sensor.a")).unwrap();
        tokio::time::sleep(DEBOUNCE + Duration::from_millis(50)).await;
        assert!(batch_rx.try_recv().is_err(), "batch discarded");

        // Buffer must be empty on resumption: the next window only carries
        // events ingested after the discarded flush.
        auth_tx.send(true).unwrap();
        ingest_tx.send(change("sensor.b")).unwrap();
        tokio::time::sleep(DEBOUNCE + Duration::from_millis(50)).await;

        let batch = batch_rx.try_recv().unwrap();
        assert_eq!(batch.events.len(), 1);
        assert_eq!(batch.events[0].entity_id, "sensor.b");

        drop(ingest_tx);
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn idle_timer_emits_nothing() {
        let (ingest_tx, task, mut batch_rx, _auth) = harness(true);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(batch_rx.try_recv().is_err());
        drop(ingest_tx);
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_performs_final_flush() {
        let (ingest_tx, task, mut batch_rx, _auth) = harness(true);

        ingest_tx.send(change("sensor.a")).unwrap();
        drop(ingest_tx);
        task.await.unwrap();

        let batch = batch_rx.try_recv().expect("final flush");
        assert_eq!(batch.events[0].entity_id, "sensor.a");
    }
}
