//! Initial catch-up for a freshly connected session.
//!
//! The sequence is fixed: one STATE frame carrying the authoritative
//! snapshot, then the active epoch's window as UPDATE frames, then the
//! session goes live for broadcasts. Live frames never overtake the STATE
//! frame because the engine skips sessions that are not yet ready.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use common::{current_epoch, state_frame, update_frame, updates_key};
use grid_store::GridStore;
use metrics::counter;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::cache::UpdateCache;
use crate::session::Session;

/// Retry policy for the snapshot read.
#[derive(Debug, Clone)]
pub struct BootstrapConfig {
    pub snapshot_attempts: u32,
    pub snapshot_retry_delay: Duration,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            snapshot_attempts: 3,
            snapshot_retry_delay: Duration::from_millis(500),
        }
    }
}

/// Send the catch-up sequence to one session, then mark it live.
pub async fn run(
    session: Arc<Session>,
    store: GridStore,
    cache: Arc<UpdateCache>,
    grid_key: String,
    config: BootstrapConfig,
) {
    match read_snapshot(&store, &grid_key, &config).await {
        Some(snapshot) => {
            if !session.enqueue(state_frame(&snapshot)).await {
                return;
            }
            counter!("gateway_snapshots_sent_total").increment(1);

            for entry in window_entries(&store, &cache, &grid_key).await {
                if !session.enqueue(update_frame(&entry)).await {
                    return;
                }
            }
        }
        None => {
            debug!("No snapshot for session {}, skipping catch-up", session.id);
        }
    }

    session.mark_ready();
}

/// Read the snapshot with bounded retries. `None` covers both the clean
/// no-state signal and exhausted attempts; catch-up is skipped either way.
async fn read_snapshot(
    store: &GridStore,
    grid_key: &str,
    config: &BootstrapConfig,
) -> Option<Vec<u8>> {
    for attempt in 1..=config.snapshot_attempts {
        match store.read_snapshot(grid_key).await {
            Ok(Some(snapshot)) => return Some(snapshot),
            Ok(None) => return None,
            Err(err) => {
                warn!(
                    "Snapshot read attempt {}/{} failed: {:?}",
                    attempt, config.snapshot_attempts, err
                );
                if attempt < config.snapshot_attempts {
                    sleep(config.snapshot_retry_delay).await;
                }
            }
        }
    }
    None
}

/// Active epoch's raw events: the local cache first, the store second.
async fn window_entries(store: &GridStore, cache: &UpdateCache, grid_key: &str) -> Vec<Bytes> {
    let epoch = match store.latest_epoch(grid_key).await {
        Ok(Some(epoch)) => epoch,
        Ok(None) => current_epoch(),
        Err(err) => {
            warn!("Latest-epoch read failed: {:?}", err);
            current_epoch()
        }
    };

    if let Some(entries) = cache.get(epoch) {
        counter!("gateway_catchup_cache_hits_total").increment(1);
        return entries;
    }

    match store.window_entries(&updates_key(grid_key, epoch)).await {
        Ok(entries) => entries.into_iter().map(Bytes::from).collect(),
        Err(err) => {
            warn!("Updates window read failed: {:?}", err);
            Vec::new()
        }
    }
}
