//! Session token issuance and validation.
//!
//! HS256 JWTs with `{sub, iss, exp}` claims and a one-hour lifetime.
//! Validation checks signature and expiry only; there is no authorization
//! policy beyond a validly signed, unexpired token.

use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Session token lifetime in seconds.
pub const TOKEN_TTL_SECS: i64 = 3600;

/// Claims carried by a session token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Stable subject from the identity provider.
    pub sub: String,
    /// Name of the provider that vouched for the subject.
    pub iss: String,
    /// Unix-second expiry.
    pub exp: i64,
}

/// Signing and verification keys derived from the shared secret.
#[derive(Clone)]
pub struct TokenKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl TokenKeys {
    pub fn from_secret(secret: &[u8]) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
        }
    }

    /// Issue a session token for a verified subject.
    pub fn sign(&self, sub: &str, issuer: &str) -> Result<String> {
        let claims = Claims {
            sub: sub.to_string(),
            iss: issuer.to_string(),
            exp: Utc::now().timestamp() + TOKEN_TTL_SECS,
        };
        Ok(encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)?)
    }

    /// Check signature and expiry, returning the claims.
    pub fn validate(&self, token: &str) -> Result<Claims> {
        let validation = Validation::new(Algorithm::HS256);
        let data = decode::<Claims>(token, &self.decoding, &validation)?;
        Ok(data.claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_validate_round_trip() {
        let keys = TokenKeys::from_secret(b"test-secret");
        let token = keys.sign("user-42", "google").unwrap();
        let claims = keys.validate(&token).unwrap();
        assert_eq!(claims.sub, "user-42");
        assert_eq!(claims.iss, "google");
        assert!(claims.exp > Utc::now().timestamp());
    }

    #[test]
    fn rejects_expired_token() {
        let keys = TokenKeys::from_secret(b"test-secret");
        let claims = Claims {
            sub: "user-42".into(),
            iss: "google".into(),
            exp: Utc::now().timestamp() - 7200,
        };
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(b"test-secret"),
        )
        .unwrap();
        assert!(keys.validate(&token).is_err());
    }

    #[test]
    fn rejects_foreign_signature() {
        let token = TokenKeys::from_secret(b"other-secret")
            .sign("user-42", "google")
            .unwrap();
        let keys = TokenKeys::from_secret(b"test-secret");
        assert!(keys.validate(&token).is_err());
    }
}
