//! Synchronizer error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Store or stream I/O failure; retried at the point of occurrence.
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Stream message without a usable 8-byte payload.
    #[error("malformed stream payload: {0}")]
    InvalidFormat(String),

    /// Stream ID whose millisecond prefix does not parse.
    #[error("unparseable stream id: {0}")]
    BadTimestamp(String),
}
