//! Client for the exchange server's token credential endpoint

use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use ferry_common::{
    ApiGroups, AuthenticatorKind, AuthenticatorRef, TokenCredentialRequest, DEFAULT_API_GROUP_SUFFIX,
};
use serde::Deserialize;
use tracing::debug;
use url::Url;

use crate::credential::ExecCredential;

/// Overall bound on one exchange call
pub const DEFAULT_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(30);

/// Exchange failures
#[derive(Debug, thiserror::Error)]
pub enum ExchangeError {
    /// The client settings are unusable
    #[error("{0}")]
    Config(String),

    /// Connect, TLS, timeout, or unreadable response
    #[error("could not reach exchange endpoint: {0}")]
    Transport(String),

    /// The endpoint answered with a non-success HTTP status
    #[error("exchange endpoint returned HTTP {status}: {message}")]
    Protocol {
        /// HTTP status code
        status: u16,
        /// Message from the response body
        message: String,
    },

    /// The endpoint refused the token or returned no credential
    #[error("login failed: {0}")]
    Rejected(String),
}

/// Settings for [`ExchangeClient`]
#[derive(Debug, Clone, Default)]
pub struct ExchangeConfig {
    /// Base URL of the exchange server; must be https
    pub endpoint: String,
    /// Base64 PEM bundle to trust for the endpoint
    pub ca_bundle_data: Option<String>,
    /// `webhook` or `jwt`
    pub authenticator_type: String,
    /// Authenticator name configured on the server
    pub authenticator_name: String,
    /// API group suffix; empty means the default
    pub api_group_suffix: String,
}

/// Kubernetes-style error body the server returns for non-2xx answers
#[derive(Deserialize)]
struct StatusBody {
    #[serde(default)]
    message: String,
}

/// Exchanges identity tokens for cluster credentials
#[derive(Debug, Clone)]
pub struct ExchangeClient {
    http: reqwest::Client,
    url: Url,
    groups: ApiGroups,
    authenticator: AuthenticatorRef,
}

impl ExchangeClient {
    /// Validate `config` and build a client; makes no network calls
    pub fn new(config: &ExchangeConfig, timeout: Duration) -> Result<Self, ExchangeError> {
        if config.authenticator_name.is_empty() {
            return Err(ExchangeError::Config(
                "authenticator name must not be empty".into(),
            ));
        }
        let kind: AuthenticatorKind = config
            .authenticator_type
            .parse()
            .map_err(ExchangeError::Config)?;

        let suffix = if config.api_group_suffix.is_empty() {
            DEFAULT_API_GROUP_SUFFIX
        } else {
            config.api_group_suffix.as_str()
        };
        let groups = ApiGroups::parse(suffix).map_err(ExchangeError::Config)?;

        if config.endpoint.is_empty() {
            return Err(ExchangeError::Config("endpoint must not be empty".into()));
        }
        let mut base = Url::parse(&config.endpoint)
            .map_err(|e| ExchangeError::Config(format!("invalid endpoint: {}", e)))?;
        if base.scheme() != "https" {
            return Err(ExchangeError::Config(format!(
                "endpoint must be https, got {:?}",
                config.endpoint
            )));
        }
        // Url::join replaces the last path segment unless the base ends in '/'
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let url = base
            .join(groups.token_credential_request_path().trim_start_matches('/'))
            .map_err(|e| ExchangeError::Config(format!("invalid endpoint: {}", e)))?;

        let mut builder = reqwest::Client::builder().timeout(timeout);
        if let Some(data) = config.ca_bundle_data.as_deref().filter(|d| !d.is_empty()) {
            let pem = STANDARD
                .decode(data)
                .map_err(|e| ExchangeError::Config(format!("invalid CA bundle data: {}", e)))?;
            let certs = reqwest::Certificate::from_pem_bundle(&pem)
                .map_err(|e| ExchangeError::Config(format!("invalid CA bundle data: {}", e)))?;
            if certs.is_empty() {
                return Err(ExchangeError::Config(
                    "invalid CA bundle data: no certificates found".into(),
                ));
            }
            for cert in certs {
                builder = builder.add_root_certificate(cert);
            }
        }
        let http = builder
            .build()
            .map_err(|e| ExchangeError::Config(format!("failed to build HTTP client: {}", e)))?;

        let authenticator = AuthenticatorRef::new(&groups, kind, config.authenticator_name.clone());
        Ok(Self {
            http,
            url,
            groups,
            authenticator,
        })
    }

    /// Full URL requests are sent to
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Exchange `token` for a cluster credential; no retries
    pub async fn exchange_token(&self, token: &str) -> Result<ExecCredential, ExchangeError> {
        let request = TokenCredentialRequest::new(&self.groups, token, self.authenticator.clone());
        debug!(url = %self.url, authenticator = %self.authenticator.name, "Sending token credential request");

        let response = self
            .http
            .post(self.url.clone())
            .json(&request)
            .send()
            .await
            .map_err(|e| ExchangeError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<StatusBody>(&body)
                .map(|s| s.message)
                .ok()
                .filter(|m| !m.is_empty())
                .unwrap_or(body);
            return Err(ExchangeError::Protocol {
                status: status.as_u16(),
                message,
            });
        }

        let reply: TokenCredentialRequest = response
            .json()
            .await
            .map_err(|e| ExchangeError::Transport(format!("could not decode response: {}", e)))?;

        let reply_status = reply
            .status
            .ok_or_else(|| ExchangeError::Rejected("response has no status".into()))?;
        if let Some(message) = reply_status.message {
            return Err(ExchangeError::Rejected(message));
        }
        let credential = reply_status
            .credential
            .ok_or_else(|| ExchangeError::Rejected("unknown cause".into()))?;

        Ok(ExecCredential::new(credential.into()))
    }
}
