//! Session-token boundary: issuance, validation and request extraction.

pub mod error;
pub mod extract;
pub mod provider;
pub mod routes;
pub mod token;

pub use error::AuthError;
pub use extract::{require_auth, token_from_parts};
pub use provider::{GithubProvider, GoogleProvider, IdentityProvider, ProviderRegistry};
pub use routes::AuthState;
pub use token::{Claims, TokenKeys, TOKEN_TTL_SECS};
