//! Epoch bucketing for the updates window.
//!
//! Recent events are grouped by wall-clock minute so newly connected
//! clients can replay the active window.

use chrono::Utc;

/// Width of one epoch in milliseconds.
pub const EPOCH_MS: i64 = 60_000;

/// Epoch containing the given unix-millisecond instant.
pub fn epoch_for_millis(ms: i64) -> i64 {
    ms / EPOCH_MS
}

/// Epoch containing the current wall-clock time.
pub fn current_epoch() -> i64 {
    epoch_for_millis(Utc::now().timestamp_millis())
}

/// Store key of the updates window for one epoch.
pub fn updates_key(grid_key: &str, epoch: i64) -> String {
    format!("{grid_key}:updates:{epoch}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_is_minute_granular() {
        assert_eq!(epoch_for_millis(0), 0);
        assert_eq!(epoch_for_millis(59_999), 0);
        assert_eq!(epoch_for_millis(60_000), 1);
        assert_eq!(epoch_for_millis(1_704_067_200_123), 1_704_067_200_123 / 60_000);
    }

    #[test]
    fn updates_key_format() {
        assert_eq!(updates_key("grid", 28_401_120), "grid:updates:28401120");
    }
}
