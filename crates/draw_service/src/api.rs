//! HTTP ingress for cell updates.
//!
//! `POST /api/draw` validates the request, stamps a server-side millisecond
//! timestamp, encodes the cell and appends it to the event stream. The
//! service keeps no local state; the stream is the only side effect.

use std::sync::Arc;

use auth::{require_auth, AuthState, TokenKeys};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{get, post};
use axum::{middleware, Router};
use chrono::Utc;
use common::Cell;
use grid_store::GridStore;
use metrics::counter;
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tracing::error;

/// Shared application state.
pub struct AppState {
    pub store: GridStore,
    pub stream_key: String,
    pub grid_size: u16,
}

/// Create the ingress router.
pub fn create_router(
    state: Arc<AppState>,
    auth_state: Arc<AuthState>,
    keys: Arc<TokenKeys>,
) -> Router {
    let draw = Router::new()
        .route("/api/draw", post(draw_handler))
        .route_layer(middleware::from_fn_with_state(keys, require_auth))
        .with_state(state);

    Router::new()
        .merge(draw)
        .merge(auth::routes::router(auth_state))
        .route("/health", get(health_handler))
        .layer(CorsLayer::permissive())
}

// =============================================================================
// Request / Response Types
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct DrawRequest {
    pub x: i64,
    pub y: i64,
    pub color: i64,
}

#[derive(Serialize)]
struct StatusResponse {
    status: String,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

/// Range-check a draw request against the configured grid.
pub fn validate_draw(request: &DrawRequest, grid_size: u16) -> Result<(), String> {
    let n = i64::from(grid_size);
    if request.x < 0 || request.x >= n {
        return Err(format!("x out of range: {}", request.x));
    }
    if request.y < 0 || request.y >= n {
        return Err(format!("y out of range: {}", request.y));
    }
    if request.color < 0 || request.color >= 16 {
        return Err(format!("color out of range: {}", request.color));
    }
    Ok(())
}

// =============================================================================
// Handlers
// =============================================================================

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

async fn draw_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<DrawRequest>,
) -> Result<Json<StatusResponse>, (StatusCode, Json<ErrorResponse>)> {
    if let Err(reason) = validate_draw(&request, state.grid_size) {
        counter!("draw_requests_rejected_total").increment(1);
        return Err((StatusCode::BAD_REQUEST, Json(ErrorResponse { error: reason })));
    }

    let cell = Cell {
        x: request.x as u16,
        y: request.y as u16,
        color: request.color as u8,
        timestamp_ms: Utc::now().timestamp_millis(),
    };

    match state.store.append_event(&state.stream_key, &cell.encode()).await {
        Ok(()) => {
            counter!("draw_requests_total").increment(1);
            Ok(Json(StatusResponse {
                status: "ok".to_string(),
            }))
        }
        Err(err) => {
            error!("Failed to append draw event: {:?}", err);
            counter!("draw_stream_errors_total").increment(1);
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: "event stream unavailable".to_string(),
                }),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_in_range_requests() {
        let request = DrawRequest { x: 0, y: 99, color: 15 };
        assert!(validate_draw(&request, 100).is_ok());
    }

    #[test]
    fn rejects_out_of_range_coordinates() {
        assert!(validate_draw(&DrawRequest { x: 100, y: 0, color: 0 }, 100).is_err());
        assert!(validate_draw(&DrawRequest { x: 0, y: 100, color: 0 }, 100).is_err());
        assert!(validate_draw(&DrawRequest { x: -1, y: 0, color: 0 }, 100).is_err());
        assert!(validate_draw(&DrawRequest { x: 0, y: -1, color: 0 }, 100).is_err());
    }

    #[test]
    fn rejects_out_of_range_color() {
        assert!(validate_draw(&DrawRequest { x: 0, y: 0, color: 16 }, 100).is_err());
        assert!(validate_draw(&DrawRequest { x: 0, y: 0, color: -1 }, 100).is_err());
    }

    #[test]
    fn grid_size_bounds_are_configurable() {
        let request = DrawRequest { x: 150, y: 150, color: 1 };
        assert!(validate_draw(&request, 100).is_err());
        assert!(validate_draw(&request, 200).is_ok());
    }
}
