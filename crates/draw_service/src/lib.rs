//! Draw service: HTTP ingress turning draw requests into stream events.

pub mod api;

pub use api::{create_router, validate_draw, AppState, DrawRequest};
