//! Exchange server configuration, loaded from a YAML file.
//!
//! ```yaml
//! listenAddr: 0.0.0.0:8443
//! apiGroupSuffix: ferry.dev
//! tls:
//!   dnsNames: [ferry-exchange.example.com]
//!   generatedCaFile: /var/run/ferry/serving-ca.pem
//! signer:
//!   caCertFile: /etc/ferry/signer/tls.crt
//!   caKeyFile: /etc/ferry/signer/tls.key
//! policyMaxTtlSeconds: 300
//! authenticators:
//!   - type: jwt
//!     name: corp
//!     issuer: https://idp.example.com
//!     audience: ferry
//!     jwksMinRefreshIntervalSeconds: 30
//!   - type: webhook
//!     name: legacy
//!     endpoint: https://authn.example.com/review
//! ```

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use ferry_common::{
    ApiGroups, AuthenticatorKind, DEFAULT_API_GROUP_SUFFIX, DEFAULT_JWKS_REFRESH_INTERVAL,
    DEFAULT_MIN_JWKS_REFRESH_INTERVAL,
};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};

const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8443";

/// Largest accepted `policyMaxTtlSeconds` (one week)
pub const MAX_POLICY_TTL_SECONDS: u64 = 7 * 24 * 3600;

/// Largest accepted `signer.generatedCaValidityDays` (ten years)
pub const MAX_GENERATED_CA_VALIDITY_DAYS: u64 = 3650;

/// Top-level server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// Address the HTTPS listener binds to
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    /// Suffix for the `login.` and `authentication.` API groups
    #[serde(default = "default_api_group_suffix")]
    pub api_group_suffix: String,
    /// Serving certificate
    #[serde(default)]
    pub tls: TlsConfig,
    /// Client certificate signer
    #[serde(default)]
    pub signer: SignerConfig,
    /// Upper bound on issued certificate lifetime
    #[serde(default = "default_policy_max_ttl_seconds")]
    pub policy_max_ttl_seconds: u64,
    /// Token validators, addressed by `(type, name)`
    #[serde(default)]
    pub authenticators: Vec<AuthenticatorConfig>,
}

fn default_listen_addr() -> SocketAddr {
    DEFAULT_LISTEN_ADDR
        .parse()
        .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 8443)))
}

fn default_api_group_suffix() -> String {
    DEFAULT_API_GROUP_SUFFIX.to_string()
}

fn default_policy_max_ttl_seconds() -> u64 {
    300
}

/// Serving certificate: PEM files, or generated at startup when both are absent
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsConfig {
    /// PEM certificate chain
    pub cert_file: Option<PathBuf>,
    /// PEM private key
    pub key_file: Option<PathBuf>,
    /// SANs for a generated serving certificate
    #[serde(default)]
    pub dns_names: Vec<String>,
    /// Where to write the CA of a generated serving certificate
    pub generated_ca_file: Option<PathBuf>,
}

/// Signing CA: PEM files watched for changes, or generated and rotated in-process
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignerConfig {
    /// PEM CA certificate
    pub ca_cert_file: Option<PathBuf>,
    /// PEM CA private key
    pub ca_key_file: Option<PathBuf>,
    /// How often the CA files are re-read
    #[serde(default = "default_reload_interval_seconds")]
    pub reload_interval_seconds: u64,
    /// Lifetime of a generated CA
    #[serde(default = "default_generated_ca_validity_days")]
    pub generated_ca_validity_days: u64,
    /// Where to write the current generated CA, so the cluster can trust it
    pub generated_ca_file: Option<PathBuf>,
}

impl Default for SignerConfig {
    fn default() -> Self {
        Self {
            ca_cert_file: None,
            ca_key_file: None,
            reload_interval_seconds: default_reload_interval_seconds(),
            generated_ca_validity_days: default_generated_ca_validity_days(),
            generated_ca_file: None,
        }
    }
}

fn default_reload_interval_seconds() -> u64 {
    60
}

fn default_generated_ca_validity_days() -> u64 {
    365
}

impl SignerConfig {
    /// Poll interval for CA files (and rotation checks for a generated CA)
    pub fn reload_interval(&self) -> Duration {
        Duration::from_secs(self.reload_interval_seconds)
    }

    /// Lifetime of a generated CA
    pub fn generated_ca_validity(&self) -> Duration {
        Duration::from_secs(self.generated_ca_validity_days * 24 * 3600)
    }

    /// Both CA files, if configured
    pub fn ca_files(&self) -> Option<(&Path, &Path)> {
        match (&self.ca_cert_file, &self.ca_key_file) {
            (Some(cert), Some(key)) => Some((cert.as_path(), key.as_path())),
            _ => None,
        }
    }
}

/// One configured authenticator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AuthenticatorConfig {
    /// Delegates to an HTTP TokenReview webhook
    Webhook(WebhookAuthenticatorConfig),
    /// Verifies JWTs from an OIDC issuer
    Jwt(JwtAuthenticatorConfig),
}

impl AuthenticatorConfig {
    /// Backend kind
    pub fn kind(&self) -> AuthenticatorKind {
        match self {
            AuthenticatorConfig::Webhook(_) => AuthenticatorKind::Webhook,
            AuthenticatorConfig::Jwt(_) => AuthenticatorKind::Jwt,
        }
    }

    /// Authenticator name
    pub fn name(&self) -> &str {
        match self {
            AuthenticatorConfig::Webhook(c) => &c.name,
            AuthenticatorConfig::Jwt(c) => &c.name,
        }
    }
}

/// Webhook authenticator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookAuthenticatorConfig {
    /// Authenticator name
    pub name: String,
    /// URL the TokenReview is POSTed to
    pub endpoint: String,
    /// Base64 PEM bundle to trust for the endpoint
    pub ca_bundle_data: Option<String>,
}

/// JWT authenticator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JwtAuthenticatorConfig {
    /// Authenticator name
    pub name: String,
    /// Expected `iss`, also the discovery base URL
    pub issuer: String,
    /// Expected `aud`
    pub audience: String,
    /// Claim mapping
    #[serde(default)]
    pub claims: ClaimMapping,
    /// Base64 PEM bundle to trust for the issuer
    pub ca_bundle_data: Option<String>,
    /// How often the issuer's key set is refetched
    #[serde(default = "default_jwks_refresh_interval_seconds")]
    pub jwks_refresh_interval_seconds: u64,
    /// Minimum spacing of refetches caused by tokens with unknown key ids
    #[serde(default = "default_jwks_min_refresh_interval_seconds")]
    pub jwks_min_refresh_interval_seconds: u64,
}

impl JwtAuthenticatorConfig {
    /// Periodic key set refresh interval
    pub fn jwks_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.jwks_refresh_interval_seconds)
    }

    /// Minimum spacing of forced key set refreshes
    pub fn jwks_min_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.jwks_min_refresh_interval_seconds)
    }
}

fn default_jwks_refresh_interval_seconds() -> u64 {
    DEFAULT_JWKS_REFRESH_INTERVAL.as_secs()
}

fn default_jwks_min_refresh_interval_seconds() -> u64 {
    DEFAULT_MIN_JWKS_REFRESH_INTERVAL.as_secs()
}

/// Which claims become the username and groups
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimMapping {
    /// Username claim
    #[serde(default = "default_username_claim")]
    pub username: String,
    /// Groups claim (string or array of strings)
    #[serde(default = "default_groups_claim")]
    pub groups: String,
}

impl Default for ClaimMapping {
    fn default() -> Self {
        Self {
            username: default_username_claim(),
            groups: default_groups_claim(),
        }
    }
}

fn default_username_claim() -> String {
    "username".to_string()
}

fn default_groups_claim() -> String {
    "groups".to_string()
}

impl ServerConfig {
    /// Read, parse and validate a config file
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {}", path.display(), e)))?;
        let config = Self::from_yaml(&data)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        Ok(config)
    }

    /// Parse and validate YAML
    pub fn from_yaml(data: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(data)
            .map_err(|e| Error::Config(format!("invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Upper bound on issued certificate lifetime
    pub fn policy_max_ttl(&self) -> Duration {
        Duration::from_secs(self.policy_max_ttl_seconds)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        ApiGroups::parse(&self.api_group_suffix).map_err(Error::Config)?;
        if self.policy_max_ttl_seconds == 0 {
            return Err(Error::Config("policyMaxTtlSeconds must be positive".into()));
        }
        if self.policy_max_ttl_seconds > MAX_POLICY_TTL_SECONDS {
            return Err(Error::Config(format!(
                "policyMaxTtlSeconds must be at most {}",
                MAX_POLICY_TTL_SECONDS
            )));
        }
        if self.tls.cert_file.is_some() != self.tls.key_file.is_some() {
            return Err(Error::Config(
                "tls.certFile and tls.keyFile must be set together".into(),
            ));
        }
        if self.signer.ca_cert_file.is_some() != self.signer.ca_key_file.is_some() {
            return Err(Error::Config(
                "signer.caCertFile and signer.caKeyFile must be set together".into(),
            ));
        }
        if self.signer.generated_ca_validity_days == 0
            || self.signer.generated_ca_validity_days > MAX_GENERATED_CA_VALIDITY_DAYS
        {
            return Err(Error::Config(format!(
                "signer.generatedCaValidityDays must be between 1 and {}",
                MAX_GENERATED_CA_VALIDITY_DAYS
            )));
        }
        if self.signer.reload_interval_seconds == 0 {
            return Err(Error::Config(
                "signer.reloadIntervalSeconds must be positive".into(),
            ));
        }
        if self.authenticators.is_empty() {
            warn!("No authenticators configured; every exchange will fail authentication");
        }

        let mut seen = HashSet::new();
        for authenticator in &self.authenticators {
            let name = authenticator.name();
            if name.is_empty() {
                return Err(Error::Config("authenticator name must not be empty".into()));
            }
            if !seen.insert((authenticator.kind(), name.to_string())) {
                return Err(Error::Config(format!(
                    "duplicate {} authenticator {:?}",
                    authenticator.kind(),
                    name
                )));
            }
            match authenticator {
                AuthenticatorConfig::Webhook(c) => validate_url(&c.endpoint, name)?,
                AuthenticatorConfig::Jwt(c) => {
                    validate_url(&c.issuer, name)?;
                    if c.audience.is_empty() {
                        return Err(Error::Config(format!(
                            "jwt authenticator {:?} needs an audience",
                            name
                        )));
                    }
                    if c.jwks_refresh_interval_seconds == 0 {
                        return Err(Error::Config(format!(
                            "jwt authenticator {:?}: jwksRefreshIntervalSeconds must be positive",
                            name
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

fn validate_url(raw: &str, name: &str) -> Result<()> {
    let url = url::Url::parse(raw)
        .map_err(|e| Error::Config(format!("authenticator {:?}: invalid URL {:?}: {}", name, raw, e)))?;
    match url.scheme() {
        "https" => Ok(()),
        "http" => {
            warn!(authenticator = %name, url = %raw, "Authenticator uses plain HTTP");
            Ok(())
        }
        other => Err(Error::Config(format!(
            "authenticator {:?}: unsupported URL scheme {:?}",
            name, other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
listenAddr: 127.0.0.1:9443
apiGroupSuffix: example.io
signer:
  caCertFile: /tmp/ca.crt
  caKeyFile: /tmp/ca.key
  reloadIntervalSeconds: 5
policyMaxTtlSeconds: 120
authenticators:
  - type: jwt
    name: corp
    issuer: https://idp.example.com
    audience: ferry
    claims:
      username: email
  - type: webhook
    name: legacy
    endpoint: https://authn.example.com/review
"#;

    #[test]
    fn parses_full_config() {
        let config = ServerConfig::from_yaml(FULL).unwrap();
        assert_eq!(config.listen_addr.port(), 9443);
        assert_eq!(config.api_group_suffix, "example.io");
        assert_eq!(config.policy_max_ttl(), Duration::from_secs(120));
        assert_eq!(config.signer.reload_interval(), Duration::from_secs(5));
        assert!(config.signer.ca_files().is_some());
        assert_eq!(config.authenticators.len(), 2);

        match &config.authenticators[0] {
            AuthenticatorConfig::Jwt(jwt) => {
                assert_eq!(jwt.claims.username, "email");
                assert_eq!(jwt.claims.groups, "groups");
                assert_eq!(jwt.jwks_refresh_interval(), Duration::from_secs(3600));
                assert_eq!(jwt.jwks_min_refresh_interval(), Duration::from_secs(30));
            }
            other => panic!("unexpected authenticator {:?}", other),
        }
        assert_eq!(config.authenticators[1].kind(), AuthenticatorKind::Webhook);
    }

    #[test]
    fn defaults_apply() {
        let config = ServerConfig::from_yaml("authenticators: []").unwrap();
        assert_eq!(config.listen_addr.port(), 8443);
        assert_eq!(config.api_group_suffix, "ferry.dev");
        assert_eq!(config.policy_max_ttl_seconds, 300);
        assert!(config.signer.ca_files().is_none());
        assert_eq!(config.signer.generated_ca_validity_days, 365);
    }

    #[test]
    fn rejects_half_configured_signer() {
        let err = ServerConfig::from_yaml("signer:\n  caCertFile: /tmp/ca.crt\n").unwrap_err();
        assert!(err.to_string().contains("caKeyFile"));
    }

    #[test]
    fn rejects_out_of_range_lifetimes() {
        let err = ServerConfig::from_yaml("policyMaxTtlSeconds: 0").unwrap_err();
        assert!(err.to_string().contains("positive"));

        let err = ServerConfig::from_yaml("policyMaxTtlSeconds: 9000000000000").unwrap_err();
        assert!(err.to_string().contains("policyMaxTtlSeconds must be at most"));

        let yaml = format!("policyMaxTtlSeconds: {}", MAX_POLICY_TTL_SECONDS);
        assert!(ServerConfig::from_yaml(&yaml).is_ok());

        let err = ServerConfig::from_yaml("signer:\n  generatedCaValidityDays: 400000000000000\n")
            .unwrap_err();
        assert!(err.to_string().contains("generatedCaValidityDays"));
    }

    #[test]
    fn rejects_duplicate_authenticators() {
        let yaml = r#"
authenticators:
  - {type: webhook, name: a, endpoint: "https://one"}
  - {type: webhook, name: a, endpoint: "https://two"}
"#;
        let err = ServerConfig::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn same_name_different_kind_is_allowed() {
        let yaml = r#"
authenticators:
  - {type: webhook, name: a, endpoint: "https://one"}
  - {type: jwt, name: a, issuer: "https://two", audience: x}
"#;
        assert!(ServerConfig::from_yaml(yaml).is_ok());
    }

    #[test]
    fn rejects_unknown_authenticator_type() {
        let yaml = "authenticators:\n  - {type: ldap, name: a}\n";
        assert!(ServerConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn rejects_bad_urls() {
        let yaml = "authenticators:\n  - {type: webhook, name: a, endpoint: \"ftp://x\"}\n";
        assert!(ServerConfig::from_yaml(yaml).is_err());
        let yaml = "authenticators:\n  - {type: jwt, name: a, issuer: \"not a url\", audience: x}\n";
        assert!(ServerConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, FULL).unwrap();
        assert!(ServerConfig::load(&path).is_ok());

        let missing = dir.path().join("missing.yaml");
        assert!(matches!(ServerConfig::load(&missing), Err(Error::Config(_))));
    }
}
