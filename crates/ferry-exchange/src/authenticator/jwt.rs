//! Token validation against an OIDC issuer's signing keys

use std::time::Duration;

use async_trait::async_trait;
use ferry_common::{Identity, JwtError, JwtVerifier};
use serde_json::Value;
use tracing::debug;

use super::{http_client, AuthError, Authenticator};
use crate::config::{ClaimMapping, JwtAuthenticatorConfig};
use crate::error::Result;

const ISSUER_TIMEOUT: Duration = Duration::from_secs(10);

/// Verifies JWTs and maps their claims to an identity
pub struct JwtAuthenticator {
    verifier: JwtVerifier,
    audiences: Vec<String>,
    claims: ClaimMapping,
}

impl JwtAuthenticator {
    /// Create from configuration; keys are fetched on first use
    pub fn new(config: &JwtAuthenticatorConfig) -> Result<Self> {
        let http = http_client(config.ca_bundle_data.as_deref(), ISSUER_TIMEOUT)?;
        Ok(Self {
            verifier: JwtVerifier::new(http, config.issuer.clone())
                .with_refresh_interval(config.jwks_refresh_interval())
                .with_min_refresh_interval(config.jwks_min_refresh_interval()),
            audiences: vec![config.audience.clone()],
            claims: config.claims.clone(),
        })
    }
}

#[async_trait]
impl Authenticator for JwtAuthenticator {
    async fn authenticate(&self, token: &str) -> std::result::Result<Identity, AuthError> {
        let verified = self
            .verifier
            .verify(token, &self.audiences)
            .await
            .map_err(|e| {
                if e.is_unavailable() || matches!(e, JwtError::IssuerMismatch { .. }) {
                    AuthError::Unavailable(e.to_string())
                } else {
                    AuthError::Rejected(e.to_string())
                }
            })?;

        let username = verified
            .string_claim(&self.claims.username)
            .filter(|u| !u.is_empty())
            .ok_or_else(|| {
                AuthError::Rejected(format!("missing claim {:?}", self.claims.username))
            })?
            .to_string();

        if self.claims.username == "email"
            && verified.claims.get("email_verified") == Some(&Value::Bool(false))
        {
            return Err(AuthError::Rejected("email is not verified".into()));
        }

        let groups = verified.string_list_claim(&self.claims.groups);

        debug!(
            issuer = %self.verifier.issuer(),
            username = %username,
            groups = ?groups,
            "JWT authenticator validated token"
        );

        Ok(Identity::new(username, groups))
    }
}
