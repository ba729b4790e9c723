//! Shared wire formats and grid math for the pixel-grid services.

pub mod bus;
pub mod cell;
pub mod epoch;
pub mod frame;
pub mod grid;

pub use bus::{decode_bus_payload, encode_bus_payload, BUS_PAYLOAD_LEN};
pub use cell::{Cell, ANCHOR_MS};
pub use epoch::{current_epoch, epoch_for_millis, updates_key, EPOCH_MS};
pub use frame::{state_frame, update_frame, STATE_TAG, UPDATE_TAG};
pub use grid::{cell_bit_offset, read_nibble, snapshot_len, DEFAULT_GRID_SIZE};
