//! Tokens obtained from the upstream identity provider

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// OAuth2 access token
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessToken {
    /// Opaque token value
    pub token: String,
    /// Token type, usually `Bearer`
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub token_type: String,
    /// When the token stops being accepted, if the provider said
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<DateTime<Utc>>,
}

/// OAuth2 refresh token
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct RefreshToken {
    /// Opaque token value
    pub token: String,
}

/// Verified OIDC ID token
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdToken {
    /// Raw JWT
    pub token: String,
    /// `exp` claim
    pub expiry: DateTime<Utc>,
    /// All claims, as verified
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub claims: Map<String, Value>,
}

/// Result of a login; a refresh produces a new value rather than mutating this one
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Token {
    /// Access token, used as the subject of audience exchanges
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<AccessToken>,
    /// Refresh token, if the provider issued one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<RefreshToken>,
    /// ID token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<IdToken>,
}

impl Token {
    /// True if the ID token is still valid for longer than `min_validity`
    pub fn id_token_valid_for(&self, min_validity: std::time::Duration, now: DateTime<Utc>) -> bool {
        let Ok(min_validity) = chrono::Duration::from_std(min_validity) else {
            return false;
        };
        self.id_token
            .as_ref()
            .is_some_and(|id| id.expiry - now > min_validity)
    }
}

// Token values stay out of logs

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("token_type", &self.token_type)
            .field("expiry", &self.expiry)
            .finish_non_exhaustive()
    }
}

impl fmt::Debug for RefreshToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefreshToken").finish_non_exhaustive()
    }
}

impl fmt::Debug for IdToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdToken")
            .field("expiry", &self.expiry)
            .field("sub", &self.claims.get("sub"))
            .finish_non_exhaustive()
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("access_token", &self.access_token)
            .field("refresh_token", &self.refresh_token)
            .field("id_token", &self.id_token)
            .finish()
    }
}
