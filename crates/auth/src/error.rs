//! Auth error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    /// No token in the Authorization header or query string.
    #[error("missing token")]
    MissingToken,

    /// Signature or expiry check failed.
    #[error("invalid token: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    /// Sign-in named a provider that is not registered.
    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    /// The identity provider did not accept the foreign token.
    #[error("provider rejected token")]
    ProviderRejected,

    /// HTTP error talking to an identity provider.
    #[error("provider request failed: {0}")]
    Http(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, AuthError>;
