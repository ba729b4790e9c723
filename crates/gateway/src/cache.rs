//! Per-process mirror of the store's updates windows.
//!
//! Every bus message lands here keyed by its epoch, so the catch-up for a
//! new session is served from memory and only falls back to the store when
//! this process has not seen the epoch.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::broadcast;
use tracing::debug;

/// Recent raw events bucketed by epoch.
pub struct UpdateCache {
    entries: RwLock<HashMap<i64, Vec<Bytes>>>,
    /// Epochs kept behind the current one.
    retention: i64,
}

impl UpdateCache {
    pub fn new(retention: i64) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            retention,
        }
    }

    pub fn insert(&self, epoch: i64, payload: Bytes) {
        self.entries
            .write()
            .unwrap()
            .entry(epoch)
            .or_default()
            .push(payload);
    }

    pub fn get(&self, epoch: i64) -> Option<Vec<Bytes>> {
        self.entries.read().unwrap().get(&epoch).cloned()
    }

    /// Drop epochs older than the retention window.
    pub fn sweep(&self, current_epoch: i64) {
        let threshold = current_epoch - self.retention;
        let mut entries = self.entries.write().unwrap();
        let before = entries.len();
        entries.retain(|epoch, _| *epoch >= threshold);
        let removed = before - entries.len();
        if removed > 0 {
            debug!("Update cache dropped {} expired epochs", removed);
        }
    }

    /// Periodic sweep until shutdown.
    pub async fn run_cleanup(
        &self,
        period: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.recv() => return,
                _ = ticker.tick() => self.sweep(common::current_epoch()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sweep_respects_retention() {
        let cache = UpdateCache::new(2);
        let current = 28_401_120;
        cache.insert(current - 1, Bytes::from_static(b"valid"));
        cache.insert(current - 3, Bytes::from_static(b"expired"));

        cache.sweep(current);

        assert!(cache.get(current - 1).is_some());
        assert!(cache.get(current - 3).is_none());
    }

    #[test]
    fn entries_accumulate_in_order() {
        let cache = UpdateCache::new(5);
        cache.insert(7, Bytes::from_static(b"a"));
        cache.insert(7, Bytes::from_static(b"b"));
        let entries = cache.get(7).unwrap();
        assert_eq!(entries, vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")]);
    }

    #[test]
    fn unknown_epoch_is_a_miss() {
        let cache = UpdateCache::new(5);
        assert!(cache.get(1).is_none());
    }
}
