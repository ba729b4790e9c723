//! Grid service: stream consumer keeping the authoritative snapshot.

pub mod error;
pub mod sync;

pub use error::SyncError;
pub use sync::{GridSynchronizer, SyncConfig};
