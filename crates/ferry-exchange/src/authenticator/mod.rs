//! Token validators
//!
//! Each configured authenticator turns a bearer token into an [`Identity`] or
//! refuses it. The registry is built once from configuration and looked up
//! by `(kind, name)` for every request.

mod jwt;
mod webhook;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use ferry_common::{AuthenticatorKind, Identity};
use tracing::info;

#[cfg(test)]
use mockall::automock;

use crate::config::AuthenticatorConfig;
use crate::error::{Error, Result};

pub use jwt::JwtAuthenticator;
pub use webhook::WebhookAuthenticator;

/// Why a token was not turned into an identity
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// The backend looked at the token and refused it
    #[error("token rejected: {0}")]
    Rejected(String),

    /// The backend could not be reached or answered nonsense
    #[error("authenticator unavailable: {0}")]
    Unavailable(String),
}

/// Validates bearer tokens
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Resolve `token` to an identity
    async fn authenticate(&self, token: &str) -> std::result::Result<Identity, AuthError>;
}

/// Authenticators keyed by `(kind, name)`
#[derive(Default, Clone)]
pub struct AuthenticatorRegistry {
    entries: HashMap<(AuthenticatorKind, String), Arc<dyn Authenticator>>,
}

impl AuthenticatorRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Build every configured authenticator
    pub fn from_config(configs: &[AuthenticatorConfig]) -> Result<Self> {
        let mut registry = Self::new();
        for config in configs {
            let authenticator: Arc<dyn Authenticator> = match config {
                AuthenticatorConfig::Webhook(c) => Arc::new(WebhookAuthenticator::new(c)?),
                AuthenticatorConfig::Jwt(c) => Arc::new(JwtAuthenticator::new(c)?),
            };
            info!(kind = %config.kind(), name = %config.name(), "Registered authenticator");
            registry.register(config.kind(), config.name(), authenticator);
        }
        Ok(registry)
    }

    /// Add or replace an authenticator
    pub fn register(
        &mut self,
        kind: AuthenticatorKind,
        name: impl Into<String>,
        authenticator: Arc<dyn Authenticator>,
    ) {
        self.entries.insert((kind, name.into()), authenticator);
    }

    /// Look up an authenticator
    pub fn get(&self, kind: AuthenticatorKind, name: &str) -> Option<Arc<dyn Authenticator>> {
        self.entries.get(&(kind, name.to_string())).cloned()
    }
}

/// HTTP client trusting the default roots plus an optional base64 PEM bundle
pub(crate) fn http_client(ca_bundle_data: Option<&str>, timeout: Duration) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder().timeout(timeout);
    if let Some(data) = ca_bundle_data.filter(|d| !d.is_empty()) {
        let pem = STANDARD
            .decode(data.trim())
            .map_err(|e| Error::Config(format!("caBundleData is not valid base64: {}", e)))?;
        let certs = reqwest::Certificate::from_pem_bundle(&pem)
            .map_err(|e| Error::Config(format!("caBundleData is not a PEM bundle: {}", e)))?;
        if certs.is_empty() {
            return Err(Error::Config("caBundleData contains no certificates".into()));
        }
        for cert in certs {
            builder = builder.add_root_certificate(cert);
        }
    }
    builder
        .build()
        .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))
}
