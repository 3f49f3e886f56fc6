//! Token validation via a TokenReview webhook
//!
//! POSTs `authentication.k8s.io/v1` `TokenReview` objects to a configured
//! endpoint and reads the identity from the returned status.

use std::time::Duration;

use async_trait::async_trait;
use ferry_common::Identity;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{http_client, AuthError, Authenticator};
use crate::config::WebhookAuthenticatorConfig;
use crate::error::Result;

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct TokenReview {
    pub api_version: String,
    pub kind: String,
    pub spec: TokenReviewSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TokenReviewStatus>,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct TokenReviewSpec {
    pub token: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct TokenReviewStatus {
    #[serde(default)]
    pub authenticated: Option<bool>,
    #[serde(default)]
    pub user: Option<UserInfo>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct UserInfo {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub groups: Option<Vec<String>>,
}

/// Delegates token validation to an HTTP webhook
pub struct WebhookAuthenticator {
    endpoint: String,
    http: reqwest::Client,
}

impl WebhookAuthenticator {
    /// Create from configuration
    pub fn new(config: &WebhookAuthenticatorConfig) -> Result<Self> {
        Ok(Self {
            endpoint: config.endpoint.clone(),
            http: http_client(config.ca_bundle_data.as_deref(), WEBHOOK_TIMEOUT)?,
        })
    }
}

#[async_trait]
impl Authenticator for WebhookAuthenticator {
    async fn authenticate(&self, token: &str) -> std::result::Result<Identity, AuthError> {
        let review = TokenReview {
            api_version: "authentication.k8s.io/v1".to_string(),
            kind: "TokenReview".to_string(),
            spec: TokenReviewSpec {
                token: token.to_string(),
            },
            status: None,
        };

        let response = self
            .http
            .post(&self.endpoint)
            .json(&review)
            .send()
            .await
            .map_err(|e| AuthError::Unavailable(format!("webhook request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(AuthError::Unavailable(format!(
                "webhook returned {}",
                response.status()
            )));
        }

        let review: TokenReview = response
            .json()
            .await
            .map_err(|e| AuthError::Unavailable(format!("invalid webhook response: {}", e)))?;

        let status = review
            .status
            .ok_or_else(|| AuthError::Unavailable("webhook returned no status".into()))?;

        identity_from_status(status)
    }
}

fn identity_from_status(status: TokenReviewStatus) -> std::result::Result<Identity, AuthError> {
    if !status.authenticated.unwrap_or(false) {
        let reason = status
            .error
            .unwrap_or_else(|| "token authentication failed".to_string());
        return Err(AuthError::Rejected(reason));
    }

    let user = status
        .user
        .ok_or_else(|| AuthError::Rejected("authenticated but no user info".into()))?;

    let username = user
        .username
        .filter(|u| !u.is_empty())
        .ok_or_else(|| AuthError::Rejected("authenticated but no username".into()))?;

    let groups = user.groups.unwrap_or_default();

    debug!(username = %username, groups = ?groups, "Webhook validated token");

    Ok(Identity::new(username, groups))
}
