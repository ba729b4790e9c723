//! Grid synchronizer: the single authoritative applier of cell events.
//!
//! One reader task block-reads the event stream through the service's
//! consumer group and hands batches to a pool of workers over a bounded
//! channel. Each worker applies its event to the packed snapshot, records
//! it in the current epoch's updates window, publishes it on the broadcast
//! bus and acknowledges it. The processed-ID keys make redelivered
//! messages observable-once.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use common::{cell_bit_offset, encode_bus_payload, epoch_for_millis, updates_key, Cell};
use grid_store::{GridStore, StreamEvent};
use metrics::counter;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::error::SyncError;

/// Configuration for the synchronizer.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Event stream key.
    pub stream_key: String,
    /// Consumer group owned by this service.
    pub group: String,
    /// Consumer name within the group; stable per process.
    pub consumer: String,
    /// Snapshot key.
    pub grid_key: String,
    /// Grid edge length.
    pub grid_size: u16,
    /// Broadcast bus channel.
    pub bus_channel: String,
    /// Max messages per block-read.
    pub read_batch: usize,
    /// Block time for one stream read.
    pub read_block: Duration,
    /// Worker task count.
    pub workers: usize,
    /// Attempts per message before leaving it unacknowledged.
    pub max_attempts: u32,
    /// Base retry delay; attempt N sleeps N times this.
    pub retry_base: Duration,
    /// TTL of processed-ID keys; at least the redelivery horizon.
    pub processed_ttl: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            stream_key: "grid:events".to_string(),
            group: "grid-sync".to_string(),
            consumer: "grid-sync-worker".to_string(),
            grid_key: "grid".to_string(),
            grid_size: common::DEFAULT_GRID_SIZE,
            bus_channel: "grid:broadcast".to_string(),
            read_batch: 50,
            read_block: Duration::from_secs(1),
            workers: 10,
            max_attempts: 3,
            retry_base: Duration::from_millis(100),
            processed_ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Consumes the event stream once-globally and maintains grid state.
pub struct GridSynchronizer {
    store: GridStore,
    config: Arc<SyncConfig>,
    shutdown: broadcast::Sender<()>,
}

impl GridSynchronizer {
    pub fn new(store: GridStore, config: SyncConfig, shutdown: broadcast::Sender<()>) -> Self {
        Self {
            store,
            config: Arc::new(config),
            shutdown,
        }
    }

    /// Run the reader loop until shutdown (blocking).
    pub async fn run(self) -> Result<()> {
        self.store
            .create_group(&self.config.stream_key, &self.config.group)
            .await?;

        info!(
            "Synchronizer consuming '{}' as {}/{}",
            self.config.stream_key, self.config.group, self.config.consumer
        );

        let (tx, rx) = async_channel::bounded::<StreamEvent>(self.config.read_batch * 8);

        let mut workers = Vec::with_capacity(self.config.workers);
        for _ in 0..self.config.workers {
            let store = self.store.clone();
            let config = self.config.clone();
            let rx = rx.clone();
            workers.push(tokio::spawn(async move {
                while let Ok(event) = rx.recv().await {
                    handle_event(&store, &config, &event).await;
                }
            }));
        }
        drop(rx);

        let mut shutdown_rx = self.shutdown.subscribe();
        'reader: loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.recv() => {
                    info!("Synchronizer received shutdown signal");
                    break 'reader;
                }

                read = self.store.read_group(
                    &self.config.stream_key,
                    &self.config.group,
                    &self.config.consumer,
                    self.config.read_batch,
                    self.config.read_block,
                ) => {
                    match read {
                        Ok(events) => {
                            for event in events {
                                if tx.send(event).await.is_err() {
                                    warn!("Hand-off channel closed, stopping reader");
                                    break 'reader;
                                }
                            }
                        }
                        Err(err) => {
                            warn!("Stream read failed: {:?}", err);
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
            }
        }

        // Closing the channel lets the workers drain in-flight events and exit.
        drop(tx);
        for worker in workers {
            let _ = worker.await;
        }

        info!("Synchronizer stopped");
        Ok(())
    }
}

/// Process one stream message with bounded retries; ack on success,
/// leave unacknowledged for redelivery on exhaustion.
async fn handle_event(store: &GridStore, config: &SyncConfig, event: &StreamEvent) {
    for attempt in 1..=config.max_attempts {
        match apply_event(store, config, event).await {
            Ok(applied) => {
                if applied {
                    counter!("grid_events_applied_total").increment(1);
                } else {
                    debug!("Skipping already-processed message {}", event.id);
                    counter!("grid_events_duplicate_total").increment(1);
                }
                if let Err(err) = store.ack(&config.stream_key, &config.group, &event.id).await {
                    warn!("Failed to ack {}: {:?}", event.id, err);
                }
                return;
            }
            Err(err) => {
                warn!(
                    "Attempt {}/{} failed for {}: {}",
                    attempt, config.max_attempts, event.id, err
                );
                if attempt < config.max_attempts {
                    tokio::time::sleep(config.retry_base * attempt).await;
                }
            }
        }
    }

    counter!("grid_events_failed_total").increment(1);
    error!(
        "Giving up on {}; leaving unacknowledged for redelivery",
        event.id
    );
}

/// One full pass over a message. Returns false when the processed-ID set
/// already contains it.
async fn apply_event(
    store: &GridStore,
    config: &SyncConfig,
    event: &StreamEvent,
) -> Result<bool, SyncError> {
    if store.is_processed(&config.grid_key, &event.id).await? {
        return Ok(false);
    }

    let raw = event_payload(event)?;
    let ms = stream_id_millis(&event.id)?;
    let epoch = epoch_for_millis(ms);

    let cell = Cell::decode(raw);
    if cell.x >= config.grid_size || cell.y >= config.grid_size {
        return Err(SyncError::InvalidFormat(format!(
            "cell ({}, {}) outside {n}x{n} grid",
            cell.x,
            cell.y,
            n = config.grid_size
        )));
    }

    store
        .add_window_entry(&updates_key(&config.grid_key, epoch), ms, &raw)
        .await?;
    store.set_latest_epoch(&config.grid_key, epoch).await?;
    store
        .write_cell(
            &config.grid_key,
            cell_bit_offset(cell.x, cell.y, config.grid_size),
            cell.color,
        )
        .await?;
    store
        .publish(&config.bus_channel, &encode_bus_payload(ms, &raw))
        .await?;
    store
        .mark_processed(&config.grid_key, &event.id, config.processed_ttl)
        .await?;

    Ok(true)
}

/// Extract the 8-byte cell payload from a stream message.
fn event_payload(event: &StreamEvent) -> Result<[u8; 8], SyncError> {
    let values = event
        .values
        .as_deref()
        .ok_or_else(|| SyncError::InvalidFormat("missing values field".to_string()))?;
    if values.len() < 8 {
        return Err(SyncError::InvalidFormat(format!(
            "payload too short: {} bytes",
            values.len()
        )));
    }
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&values[..8]);
    Ok(raw)
}

/// Millisecond prefix of a server-assigned stream ID.
fn stream_id_millis(id: &str) -> Result<i64, SyncError> {
    id.split('-')
        .next()
        .and_then(|ms| ms.parse::<i64>().ok())
        .ok_or_else(|| SyncError::BadTimestamp(id.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::ANCHOR_MS;

    fn event(id: &str, values: Option<Vec<u8>>) -> StreamEvent {
        StreamEvent {
            id: id.to_string(),
            values,
        }
    }

    #[test]
    fn stream_id_millis_parses_prefix() {
        assert_eq!(stream_id_millis("1704067200123-0").unwrap(), 1_704_067_200_123);
        assert_eq!(stream_id_millis("5-12").unwrap(), 5);
    }

    #[test]
    fn stream_id_millis_rejects_garbage() {
        assert!(matches!(
            stream_id_millis("not-a-timestamp"),
            Err(SyncError::BadTimestamp(_))
        ));
        assert!(matches!(stream_id_millis(""), Err(SyncError::BadTimestamp(_))));
    }

    #[test]
    fn payload_requires_eight_bytes() {
        assert!(matches!(
            event_payload(&event("1-0", None)),
            Err(SyncError::InvalidFormat(_))
        ));
        assert!(matches!(
            event_payload(&event("1-0", Some(vec![1, 2, 3]))),
            Err(SyncError::InvalidFormat(_))
        ));
    }

    #[test]
    fn payload_takes_first_eight_bytes() {
        let cell = Cell {
            x: 3,
            y: 7,
            color: 9,
            timestamp_ms: ANCHOR_MS + 1000,
        };
        let raw = cell.encode();
        let got = event_payload(&event("1-0", Some(raw.to_vec()))).unwrap();
        assert_eq!(got, raw);
        assert_eq!(Cell::decode(got), cell);
    }

    #[test]
    fn window_epoch_comes_from_the_stream_id() {
        let ms = stream_id_millis("1704067260000-3").unwrap();
        assert_eq!(epoch_for_millis(ms), 1_704_067_260_000 / 60_000);
    }
}
