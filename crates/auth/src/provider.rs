//! Identity providers for sign-in.
//!
//! A provider trades a foreign token for a stable subject identifier.
//! Everything past that point is the session token's business.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::warn;

use crate::error::{AuthError, Result};

/// Verifies a foreign credential and yields a stable subject.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn verify(&self, token: &str) -> Result<String>;
}

/// Providers keyed by name, fixed at construction time.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<&'static str, Arc<dyn IdentityProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, provider: Arc<dyn IdentityProvider>) -> Self {
        self.providers.insert(provider.name(), provider);
        self
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn IdentityProvider>> {
        self.providers
            .get(name)
            .cloned()
            .ok_or_else(|| AuthError::UnknownProvider(name.to_string()))
    }
}

/// Google sign-in via ID-token introspection.
pub struct GoogleProvider {
    client: reqwest::Client,
    client_id: String,
}

#[derive(Deserialize)]
struct GoogleTokenInfo {
    aud: String,
    sub: String,
}

impl GoogleProvider {
    pub fn new(client_id: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            client_id,
        }
    }
}

#[async_trait]
impl IdentityProvider for GoogleProvider {
    fn name(&self) -> &'static str {
        "google"
    }

    async fn verify(&self, token: &str) -> Result<String> {
        let response = self
            .client
            .get("https://oauth2.googleapis.com/tokeninfo")
            .query(&[("id_token", token)])
            .send()
            .await?;

        if !response.status().is_success() {
            warn!("Google tokeninfo returned {}", response.status());
            return Err(AuthError::ProviderRejected);
        }

        let info: GoogleTokenInfo = response.json().await?;
        if info.aud != self.client_id {
            warn!("Google token audience mismatch");
            return Err(AuthError::ProviderRejected);
        }
        Ok(info.sub)
    }
}

/// GitHub sign-in via the user endpoint.
pub struct GithubProvider {
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct GithubUser {
    id: u64,
}

impl GithubProvider {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for GithubProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IdentityProvider for GithubProvider {
    fn name(&self) -> &'static str {
        "github"
    }

    async fn verify(&self, token: &str) -> Result<String> {
        let response = self
            .client
            .get("https://api.github.com/user")
            .bearer_auth(token)
            .header(reqwest::header::USER_AGENT, "pixelgrid")
            .send()
            .await?;

        if !response.status().is_success() {
            warn!("GitHub user endpoint returned {}", response.status());
            return Err(AuthError::ProviderRejected);
        }

        let user: GithubUser = response.json().await?;
        Ok(user.id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_lookup() {
        let registry = ProviderRegistry::new().register(Arc::new(GithubProvider::new()));
        assert!(registry.get("github").is_ok());
        assert!(matches!(
            registry.get("gitlab"),
            Err(AuthError::UnknownProvider(_))
        ));
    }
}
