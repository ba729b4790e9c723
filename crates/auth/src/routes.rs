//! Sign-in HTTP surface.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::post;
use axum::Router;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::provider::ProviderRegistry;
use crate::token::TokenKeys;

/// Shared state for the sign-in route.
pub struct AuthState {
    pub keys: TokenKeys,
    pub providers: ProviderRegistry,
}

/// Router exposing `POST /api/auth/signin`.
pub fn router(state: Arc<AuthState>) -> Router {
    Router::new()
        .route("/api/auth/signin", post(signin_handler))
        .with_state(state)
}

#[derive(Deserialize)]
struct SignInRequest {
    provider: String,
    token: String,
}

#[derive(Serialize)]
struct SignInResponse {
    token: String,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

async fn signin_handler(
    State(state): State<Arc<AuthState>>,
    Json(request): Json<SignInRequest>,
) -> Result<Json<SignInResponse>, (StatusCode, Json<ErrorResponse>)> {
    let provider = state.providers.get(&request.provider).map_err(|_| {
        (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: "unknown provider".to_string(),
            }),
        )
    })?;

    let subject = match provider.verify(&request.token).await {
        Ok(subject) => subject,
        Err(err) => {
            warn!("Sign-in via {} failed: {err}", provider.name());
            return Err((
                StatusCode::UNAUTHORIZED,
                Json(ErrorResponse {
                    error: "invalid token".to_string(),
                }),
            ));
        }
    };

    let token = state.keys.sign(&subject, provider.name()).map_err(|err| {
        warn!("Token signing failed: {err}");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: "could not generate token".to_string(),
            }),
        )
    })?;

    info!("Issued session token via {}", provider.name());
    Ok(Json(SignInResponse { token }))
}
