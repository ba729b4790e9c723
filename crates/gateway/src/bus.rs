//! Broadcast-bus subscriber: store pub/sub → fan-out engine.
//!
//! The synchronizer is the sole publisher; this task is the gateway's only
//! tie to the bus. Each payload carries the stream millis plus the raw
//! event: the event feeds the local updates cache under the stream's epoch
//! and is prepared once as an UPDATE frame for every worker.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use common::{decode_bus_payload, epoch_for_millis, update_frame};
use futures::StreamExt;
use grid_store::GridStore;
use metrics::counter;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::cache::UpdateCache;
use crate::engine::FanoutEngine;

/// Configuration for the bus subscriber.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Pub/sub channel the synchronizer publishes on.
    pub channel: String,
    /// Initial reconnect delay.
    pub reconnect_delay: Duration,
    /// Reconnect delay cap for the exponential backoff.
    pub max_reconnect_delay: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            channel: "grid:broadcast".to_string(),
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(30),
        }
    }
}

/// Run the subscriber until shutdown, reconnecting on connection loss.
pub async fn run(
    store: GridStore,
    engine: Arc<FanoutEngine>,
    cache: Arc<UpdateCache>,
    config: BusConfig,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut reconnect_delay = config.reconnect_delay;

    loop {
        match store.subscribe(&config.channel).await {
            Ok(mut pubsub) => {
                info!("Subscribed to bus channel '{}'", config.channel);
                reconnect_delay = config.reconnect_delay;

                let mut messages = pubsub.on_message();
                loop {
                    tokio::select! {
                        biased;

                        _ = shutdown.recv() => {
                            info!("Bus subscriber received shutdown signal");
                            return;
                        }

                        maybe = messages.next() => match maybe {
                            Some(msg) => handle_message(&engine, &cache, msg.get_payload_bytes()),
                            None => {
                                warn!("Bus subscription ended, reconnecting");
                                break;
                            }
                        }
                    }
                }
            }
            Err(err) => {
                warn!("Bus subscribe failed: {:?}", err);
            }
        }

        tokio::select! {
            _ = shutdown.recv() => return,
            _ = tokio::time::sleep(reconnect_delay) => {}
        }
        reconnect_delay = (reconnect_delay * 2).min(config.max_reconnect_delay);
    }
}

fn handle_message(engine: &FanoutEngine, cache: &UpdateCache, payload: &[u8]) {
    // The cache is bucketed by the stream-ID millis carried in the
    // payload, the same epoch source the store windows are keyed by.
    let Some((stream_ms, event)) = decode_bus_payload(payload) else {
        warn!("Dropping malformed bus payload of {} bytes", payload.len());
        counter!("gateway_bus_malformed_total").increment(1);
        return;
    };

    cache.insert(epoch_for_millis(stream_ms), Bytes::copy_from_slice(&event));
    engine.broadcast(update_frame(&event));
    counter!("gateway_bus_messages_total").increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::FanoutConfig;
    use common::{encode_bus_payload, Cell, ANCHOR_MS, UPDATE_TAG};

    #[tokio::test]
    async fn bus_message_feeds_cache_and_sessions() {
        let engine = FanoutEngine::new(FanoutConfig {
            workers: 1,
            batch_timeout: Duration::from_millis(10),
            ..FanoutConfig::default()
        });
        let cache = UpdateCache::new(5);
        let mut handle = engine.add().unwrap();
        handle.session.mark_ready();

        let cell = Cell {
            x: 3,
            y: 7,
            color: 9,
            timestamp_ms: ANCHOR_MS + 90_000,
        };
        let stream_ms = cell.timestamp_ms + 12;
        handle_message(&engine, &cache, &encode_bus_payload(stream_ms, &cell.encode()));

        assert_eq!(cache.get(epoch_for_millis(stream_ms)).unwrap().len(), 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let frame = handle.queue.try_recv().unwrap();
        assert_eq!(frame[0], UPDATE_TAG);
        assert_eq!(&frame[1..], &cell.encode());
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn cache_is_bucketed_by_the_stream_timestamp() {
        let engine = FanoutEngine::new(FanoutConfig {
            workers: 1,
            ..FanoutConfig::default()
        });
        let cache = UpdateCache::new(5);

        // Cell stamped just before a minute boundary, appended just after:
        // the entry must land in the stream's epoch, where the catch-up
        // lookup keyed by the store windows will find it.
        let cell = Cell {
            x: 1,
            y: 1,
            color: 2,
            timestamp_ms: ANCHOR_MS + 59_990,
        };
        let stream_ms = ANCHOR_MS + 60_010;
        handle_message(&engine, &cache, &encode_bus_payload(stream_ms, &cell.encode()));

        assert!(cache.get(epoch_for_millis(cell.timestamp_ms)).is_none());
        assert_eq!(cache.get(epoch_for_millis(stream_ms)).unwrap().len(), 1);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn short_payloads_are_dropped() {
        let engine = FanoutEngine::new(FanoutConfig {
            workers: 1,
            batch_timeout: Duration::from_millis(10),
            ..FanoutConfig::default()
        });
        let cache = UpdateCache::new(5);
        let mut handle = engine.add().unwrap();
        handle.session.mark_ready();

        handle_message(&engine, &cache, &[1, 2, 3]);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(handle.queue.try_recv().is_err());
        engine.shutdown().await;
    }
}
