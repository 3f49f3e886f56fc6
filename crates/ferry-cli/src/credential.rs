//! kubectl exec plugin output
//!
//! The CLI prints one `ExecCredential` to stdout; kubectl reads either the
//! bearer token or the client certificate pair from its status.
//!
//! ```yaml
//! users:
//! - name: ferry
//!   user:
//!     exec:
//!       apiVersion: client.authentication.k8s.io/v1beta1
//!       command: ferry
//!       args: [login, oidc, --issuer=https://idp.example.com, --enable-exchange, ...]
//! ```

use chrono::{DateTime, Utc};
use ferry_common::ClusterCredential;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::oidc::Token;

/// `apiVersion` of the exec credential
pub const EXEC_CREDENTIAL_API_VERSION: &str = "client.authentication.k8s.io/v1beta1";

/// Kind of the exec credential
pub const EXEC_CREDENTIAL_KIND: &str = "ExecCredential";

/// Environment variable kubectl uses to pass cluster information
pub const EXEC_INFO_ENV: &str = "KUBERNETES_EXEC_INFO";

/// ExecCredential response format for Kubernetes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecCredential {
    /// Always `ExecCredential`
    pub kind: String,
    /// Always `client.authentication.k8s.io/v1beta1`
    pub api_version: String,
    /// Unused by the plugin; kept so the output is a complete object
    #[serde(default)]
    pub spec: ExecCredentialSpec,
    /// The credential
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ExecCredentialStatus>,
}

/// Empty spec
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecCredentialSpec {}

/// Credential kubectl presents to the cluster
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecCredentialStatus {
    /// When kubectl should ask again
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration_timestamp: Option<DateTime<Utc>>,
    /// Bearer token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// PEM client certificate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_certificate_data: Option<String>,
    /// PEM client key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_key_data: Option<String>,
}

impl ExecCredential {
    /// Wrap a status
    pub fn new(status: ExecCredentialStatus) -> Self {
        Self {
            kind: EXEC_CREDENTIAL_KIND.to_string(),
            api_version: EXEC_CREDENTIAL_API_VERSION.to_string(),
            spec: ExecCredentialSpec::default(),
            status: Some(status),
        }
    }

    /// Present the ID token itself as a bearer token; `None` if there is no ID token
    pub fn from_id_token(token: &Token) -> Option<Self> {
        let id = token.id_token.as_ref()?;
        Some(Self::new(ExecCredentialStatus {
            expiration_timestamp: Some(id.expiry),
            token: Some(id.token.clone()),
            ..Default::default()
        }))
    }

    /// Expiration, if the credential has one
    pub fn expiration(&self) -> Option<DateTime<Utc>> {
        self.status.as_ref().and_then(|s| s.expiration_timestamp)
    }
}

impl From<ClusterCredential> for ExecCredentialStatus {
    fn from(credential: ClusterCredential) -> Self {
        Self {
            expiration_timestamp: Some(credential.expiration_timestamp),
            token: credential.token,
            client_certificate_data: credential.client_certificate_data,
            client_key_data: credential.client_key_data,
        }
    }
}

/// `spec.cluster` from `KUBERNETES_EXEC_INFO`, if kubectl provided it
pub fn cluster_info_from_env() -> Option<Value> {
    std::env::var(EXEC_INFO_ENV)
        .ok()
        .and_then(|raw| cluster_info(&raw))
}

/// Extract `spec.cluster` from an exec info document
pub fn cluster_info(raw: &str) -> Option<Value> {
    let info: Value = serde_json::from_str(raw).ok()?;
    info.get("spec")?.get("cluster").cloned()
}
