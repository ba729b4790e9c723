//! Gateway: WebSocket fan-out for grid broadcasts.
//!
//! The pipeline on this side is bus subscriber → fan-out engine →
//! per-session write pumps. New sessions get the snapshot and the active
//! updates window before any live broadcast.
//!
//! ```text
//! store pub/sub channel
//!         ↓
//! bus subscriber (one task, feeds the local updates cache)
//!         ↓
//! FanoutEngine workers (disjoint session sets, batched delivery)
//!         ↓
//! session write queues → WebSocket clients
//! ```

pub mod bootstrap;
pub mod bus;
pub mod cache;
pub mod engine;
pub mod session;
pub mod ws_server;

pub use bootstrap::BootstrapConfig;
pub use bus::BusConfig;
pub use cache::UpdateCache;
pub use engine::{FanoutConfig, FanoutEngine, SessionHandle};
pub use session::{Session, SessionId};
pub use ws_server::{create_router, AppState};
