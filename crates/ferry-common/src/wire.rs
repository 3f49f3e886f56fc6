//! Wire objects for the token credential exchange endpoint
//!
//! The client POSTs a `TokenCredentialRequest` carrying the bearer token and a
//! reference to the authenticator that should validate it. The server answers
//! with the same object and a populated `status`: either a credential or a
//! failure message.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// API group suffix used when none is configured
pub const DEFAULT_API_GROUP_SUFFIX: &str = "ferry.dev";

/// Version of the login API group
pub const LOGIN_API_VERSION: &str = "v1alpha1";

/// Kind of the exchange request object
pub const TOKEN_CREDENTIAL_REQUEST_KIND: &str = "TokenCredentialRequest";

/// API group names derived from a configurable suffix
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiGroups {
    suffix: String,
}

impl ApiGroups {
    /// Create group names for the given suffix (e.g. `ferry.dev`)
    pub fn new(suffix: impl Into<String>) -> Self {
        Self {
            suffix: suffix.into(),
        }
    }

    /// Create group names after checking the suffix is a lowercase DNS subdomain
    pub fn parse(suffix: &str) -> Result<Self, String> {
        validate_suffix(suffix)?;
        Ok(Self::new(suffix))
    }

    /// The configured suffix
    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    /// Group serving `TokenCredentialRequest`, e.g. `login.ferry.dev`
    pub fn login_group(&self) -> String {
        format!("login.{}", self.suffix)
    }

    /// Group that authenticator references belong to, e.g. `authentication.ferry.dev`
    pub fn authentication_group(&self) -> String {
        format!("authentication.{}", self.suffix)
    }

    /// `apiVersion` value for exchange requests
    pub fn login_api_version(&self) -> String {
        format!("{}/{}", self.login_group(), LOGIN_API_VERSION)
    }

    /// HTTP path of the exchange endpoint
    pub fn token_credential_request_path(&self) -> String {
        format!(
            "/apis/{}/{}/tokencredentialrequests",
            self.login_group(),
            LOGIN_API_VERSION
        )
    }
}

impl Default for ApiGroups {
    fn default() -> Self {
        Self::new(DEFAULT_API_GROUP_SUFFIX)
    }
}

fn validate_suffix(suffix: &str) -> Result<(), String> {
    const MAX_LEN: usize = 253;

    let label_ok = |label: &str| {
        !label.is_empty()
            && label.len() <= 63
            && label
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
            && !label.starts_with('-')
            && !label.ends_with('-')
    };

    if suffix.is_empty() || suffix.len() > MAX_LEN || !suffix.split('.').all(label_ok) {
        return Err(format!(
            "invalid API group suffix {:?}: must be a lowercase DNS subdomain such as \"example.com\"",
            suffix
        ));
    }
    Ok(())
}

/// The two authenticator backends the exchange server can delegate to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthenticatorKind {
    /// Token is sent to an HTTP webhook as a TokenReview
    Webhook,
    /// Token is verified locally as a signed JWT
    Jwt,
}

impl AuthenticatorKind {
    /// Object kind used in authenticator references
    pub fn kind_name(&self) -> &'static str {
        match self {
            AuthenticatorKind::Webhook => "WebhookAuthenticator",
            AuthenticatorKind::Jwt => "JWTAuthenticator",
        }
    }

    /// Parse an object kind (`WebhookAuthenticator`, `JWTAuthenticator`)
    pub fn from_kind_name(kind: &str) -> Option<Self> {
        match kind {
            "WebhookAuthenticator" => Some(AuthenticatorKind::Webhook),
            "JWTAuthenticator" => Some(AuthenticatorKind::Jwt),
            _ => None,
        }
    }
}

impl fmt::Display for AuthenticatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthenticatorKind::Webhook => f.write_str("webhook"),
            AuthenticatorKind::Jwt => f.write_str("jwt"),
        }
    }
}

impl FromStr for AuthenticatorKind {
    type Err = String;

    /// Parse the short CLI form (`webhook`, `jwt`), case-insensitively
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "webhook" => Ok(AuthenticatorKind::Webhook),
            "jwt" => Ok(AuthenticatorKind::Jwt),
            other => Err(format!(
                "invalid authenticator type: {:?}, supported values are \"webhook\" and \"jwt\"",
                other
            )),
        }
    }
}

/// Exchange request object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenCredentialRequest {
    /// `login.<suffix>/v1alpha1`
    pub api_version: String,
    /// Always `TokenCredentialRequest`
    pub kind: String,
    /// What to exchange
    pub spec: TokenCredentialRequestSpec,
    /// Outcome, set by the server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TokenCredentialRequestStatus>,
}

impl TokenCredentialRequest {
    /// Build a request for `token`, to be validated by `authenticator`
    pub fn new(groups: &ApiGroups, token: impl Into<String>, authenticator: AuthenticatorRef) -> Self {
        Self {
            api_version: groups.login_api_version(),
            kind: TOKEN_CREDENTIAL_REQUEST_KIND.to_string(),
            spec: TokenCredentialRequestSpec {
                token: token.into(),
                authenticator,
            },
            status: None,
        }
    }
}

/// Exchange request input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenCredentialRequestSpec {
    /// Bearer identity token
    pub token: String,
    /// Authenticator that should validate the token
    pub authenticator: AuthenticatorRef,
}

/// Reference to a configured authenticator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticatorRef {
    /// `authentication.<suffix>`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_group: Option<String>,
    /// `WebhookAuthenticator` or `JWTAuthenticator`
    pub kind: String,
    /// Authenticator name
    pub name: String,
}

impl AuthenticatorRef {
    /// Build a reference in the given API groups
    pub fn new(groups: &ApiGroups, kind: AuthenticatorKind, name: impl Into<String>) -> Self {
        Self {
            api_group: Some(groups.authentication_group()),
            kind: kind.kind_name().to_string(),
            name: name.into(),
        }
    }
}

/// Exchange outcome
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenCredentialRequestStatus {
    /// Issued credential, on success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<ClusterCredential>,
    /// Failure message, on rejection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Cluster-scoped credential returned by a successful exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterCredential {
    /// When the credential stops working
    pub expiration_timestamp: DateTime<Utc>,
    /// Bearer token form
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// PEM client certificate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_certificate_data: Option<String>,
    /// PEM client private key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_key_data: Option<String>,
}
