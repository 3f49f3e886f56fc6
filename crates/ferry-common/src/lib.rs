//! Shared types for Ferry
//!
//! Used by both sides of the credential exchange:
//!
//! - [`Identity`]: the username/groups pair an authenticator resolves a token to
//! - [`wire`]: the `TokenCredentialRequest` objects sent to the exchange endpoint
//! - [`jwt`]: OIDC discovery and JWKS-backed JWT verification, used by the CLI to
//!   verify ID tokens and by the exchange server's JWT authenticator

#![deny(missing_docs)]

pub mod jwt;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod wire;

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

pub use jwt::{
    discover, JwtError, JwtVerifier, ProviderMetadata, VerifiedJwt, DEFAULT_JWKS_REFRESH_INTERVAL,
    DEFAULT_MIN_JWKS_REFRESH_INTERVAL,
};
pub use wire::{
    ApiGroups, AuthenticatorKind, AuthenticatorRef, ClusterCredential, TokenCredentialRequest,
    TokenCredentialRequestSpec, TokenCredentialRequestStatus, DEFAULT_API_GROUP_SUFFIX,
    LOGIN_API_VERSION, TOKEN_CREDENTIAL_REQUEST_KIND,
};

/// An authenticated identity: who the token belongs to and which groups they are in.
///
/// Lives for a single exchange request and is never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Username, becomes the certificate common name
    pub username: String,
    /// Group memberships, each becomes a certificate organization value
    #[serde(default)]
    pub groups: BTreeSet<String>,
}

impl Identity {
    /// Build an identity from a username and any iterable of group names
    pub fn new<I, S>(username: impl Into<String>, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            username: username.into(),
            groups: groups.into_iter().map(Into::into).collect(),
        }
    }
}
