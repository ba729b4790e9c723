//! Token extraction and the request guard.
//!
//! The session token arrives either as `Authorization: Bearer <jwt>` or as
//! a `?token=` query parameter; the WebSocket path can only use the latter.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Query, Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use tracing::debug;

use crate::error::{AuthError, Result};
use crate::token::TokenKeys;

/// Pull the session token out of the header or the query string.
pub fn token_from_parts(headers: &HeaderMap, query: &HashMap<String, String>) -> Result<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::to_string)
        .or_else(|| query.get("token").cloned())
        .ok_or(AuthError::MissingToken)
}

/// Middleware rejecting requests without a validly signed, unexpired token.
pub async fn require_auth(
    State(keys): State<Arc<TokenKeys>>,
    Query(query): Query<HashMap<String, String>>,
    request: Request,
    next: Next,
) -> std::result::Result<Response, StatusCode> {
    let checked = token_from_parts(request.headers(), &query)
        .and_then(|token| keys.validate(&token));

    match checked {
        Ok(_) => Ok(next.run(request).await),
        Err(err) => {
            debug!("Rejected request: {err}");
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_header_wins_over_query() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Bearer abc".parse().unwrap());
        let query = HashMap::from([("token".to_string(), "def".to_string())]);
        assert_eq!(token_from_parts(&headers, &query).unwrap(), "abc");
    }

    #[test]
    fn falls_back_to_query_parameter() {
        let headers = HeaderMap::new();
        let query = HashMap::from([("token".to_string(), "def".to_string())]);
        assert_eq!(token_from_parts(&headers, &query).unwrap(), "def");
    }

    #[test]
    fn missing_everywhere() {
        assert!(matches!(
            token_from_parts(&HeaderMap::new(), &HashMap::new()),
            Err(AuthError::MissingToken)
        ));
    }

    #[test]
    fn malformed_header_is_ignored() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Basic abc".parse().unwrap());
        assert!(matches!(
            token_from_parts(&headers, &HashMap::new()),
            Err(AuthError::MissingToken)
        ));
    }
}
