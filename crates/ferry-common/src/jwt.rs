//! OIDC discovery and JWT verification
//!
//! [`JwtVerifier`] keeps the issuer's signing keys in a cache that is refreshed
//! on an interval, and once more on demand when a token names a key id the
//! cache does not know. On-demand refreshes are spaced at least
//! [`DEFAULT_MIN_JWKS_REFRESH_INTERVAL`] apart, so tokens with made-up key ids
//! cannot drive traffic to the issuer. Only asymmetric keys (RSA, EC
//! P-256/P-384) from the issuer's JWKS are accepted.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, decode_header, DecodingKey, Validation};
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Default JWKS refresh interval
pub const DEFAULT_JWKS_REFRESH_INTERVAL: Duration = Duration::from_secs(3600);

/// Default minimum time between two refreshes triggered by an unknown key id
pub const DEFAULT_MIN_JWKS_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

/// Errors from discovery and token verification
#[derive(Debug, thiserror::Error)]
pub enum JwtError {
    /// Discovery document could not be fetched or parsed
    #[error("OIDC discovery failed: {0}")]
    Discovery(String),

    /// Discovery document names a different issuer
    #[error("issuer mismatch: expected {expected}, got {actual}")]
    IssuerMismatch {
        /// Issuer we asked for
        expected: String,
        /// Issuer the document claims
        actual: String,
    },

    /// Key set could not be fetched or contained no usable keys
    #[error("JWKS unavailable: {0}")]
    Jwks(String),

    /// Token could not be parsed
    #[error("malformed token: {0}")]
    Malformed(String),

    /// No key in the key set matches the token's key id
    #[error("no matching signing key for kid {0:?}")]
    UnknownKey(Option<String>),

    /// Token has expired
    #[error("token has expired")]
    Expired,

    /// Signature, issuer, audience or algorithm check failed
    #[error("token is invalid: {0}")]
    Invalid(String),
}

impl JwtError {
    /// True if the failure is on the issuer side rather than the token's
    pub fn is_unavailable(&self) -> bool {
        matches!(self, JwtError::Discovery(_) | JwtError::Jwks(_))
    }
}

/// Subset of the OIDC provider metadata document we use
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProviderMetadata {
    /// Issuer identifier, must equal the URL discovery was performed against
    pub issuer: String,
    /// Where the signing keys live
    pub jwks_uri: String,
    /// Browser authorization endpoint
    #[serde(default)]
    pub authorization_endpoint: Option<String>,
    /// Code/refresh/password/token-exchange endpoint
    #[serde(default)]
    pub token_endpoint: Option<String>,
}

/// Fetch `<issuer>/.well-known/openid-configuration` and check its issuer
pub async fn discover(http: &reqwest::Client, issuer: &str) -> Result<ProviderMetadata, JwtError> {
    let url = format!(
        "{}/.well-known/openid-configuration",
        issuer.trim_end_matches('/')
    );
    debug!(url = %url, "Fetching OIDC discovery document");

    let response = http
        .get(&url)
        .send()
        .await
        .map_err(|e| JwtError::Discovery(format!("failed to fetch {}: {}", url, e)))?;

    if !response.status().is_success() {
        return Err(JwtError::Discovery(format!(
            "{} returned {}",
            url,
            response.status()
        )));
    }

    let metadata: ProviderMetadata = response
        .json()
        .await
        .map_err(|e| JwtError::Discovery(format!("invalid discovery document: {}", e)))?;

    if metadata.issuer != issuer {
        return Err(JwtError::IssuerMismatch {
            expected: issuer.to_string(),
            actual: metadata.issuer,
        });
    }

    Ok(metadata)
}

/// A token that passed verification
#[derive(Debug, Clone)]
pub struct VerifiedJwt {
    /// All claims in the payload
    pub claims: Map<String, Value>,
    /// `exp` claim
    pub expiry: DateTime<Utc>,
}

impl VerifiedJwt {
    /// String claim by name
    pub fn string_claim(&self, name: &str) -> Option<&str> {
        self.claims.get(name).and_then(Value::as_str)
    }

    /// Claim that may be a single string or an array of strings
    pub fn string_list_claim(&self, name: &str) -> Vec<String> {
        match self.claims.get(name) {
            Some(Value::String(s)) => vec![s.clone()],
            Some(Value::Array(values)) => values
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
            _ => Vec::new(),
        }
    }
}

struct JwksCache {
    keys: HashMap<String, DecodingKey>,
    last_refresh: Instant,
}

#[derive(Debug, Deserialize)]
struct JwksDocument {
    keys: Vec<JwkKey>,
}

#[derive(Debug, Deserialize)]
struct JwkKey {
    kty: String,
    kid: Option<String>,
    #[serde(rename = "use")]
    key_use: Option<String>,
    n: Option<String>,
    e: Option<String>,
    crv: Option<String>,
    x: Option<String>,
    y: Option<String>,
}

/// Verifies JWTs issued by one issuer
pub struct JwtVerifier {
    issuer: String,
    jwks_uri: RwLock<Option<String>>,
    http: reqwest::Client,
    refresh_interval: Duration,
    min_refresh_interval: Duration,
    cache: RwLock<Option<JwksCache>>,
}

impl JwtVerifier {
    /// Create a verifier; the key set location is discovered on first use
    pub fn new(http: reqwest::Client, issuer: impl Into<String>) -> Self {
        Self {
            issuer: issuer.into(),
            jwks_uri: RwLock::new(None),
            http,
            refresh_interval: DEFAULT_JWKS_REFRESH_INTERVAL,
            min_refresh_interval: DEFAULT_MIN_JWKS_REFRESH_INTERVAL,
            cache: RwLock::new(None),
        }
    }

    /// Create a verifier from already-fetched provider metadata
    pub fn from_metadata(http: reqwest::Client, metadata: &ProviderMetadata) -> Self {
        Self {
            issuer: metadata.issuer.clone(),
            jwks_uri: RwLock::new(Some(metadata.jwks_uri.clone())),
            http,
            refresh_interval: DEFAULT_JWKS_REFRESH_INTERVAL,
            min_refresh_interval: DEFAULT_MIN_JWKS_REFRESH_INTERVAL,
            cache: RwLock::new(None),
        }
    }

    /// Override the periodic key refresh interval
    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    /// Override the minimum spacing of refreshes forced by unknown key ids
    pub fn with_min_refresh_interval(mut self, interval: Duration) -> Self {
        self.min_refresh_interval = interval;
        self
    }

    /// Issuer this verifier accepts
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Verify signature, issuer, expiry and (when non-empty) audience
    pub async fn verify(&self, token: &str, audiences: &[String]) -> Result<VerifiedJwt, JwtError> {
        let header = decode_header(token).map_err(|e| JwtError::Malformed(e.to_string()))?;
        let kid = header.kid;

        let key = match self.cached_key(kid.as_deref(), false).await? {
            Some(key) => key,
            None => {
                debug!(kid = ?kid, "Unknown key id, refreshing JWKS");
                self.cached_key(kid.as_deref(), true)
                    .await?
                    .ok_or_else(|| JwtError::UnknownKey(kid.clone()))?
            }
        };

        let mut validation = Validation::new(header.alg);
        validation.set_issuer(&[&self.issuer]);
        if audiences.is_empty() {
            validation.validate_aud = false;
        } else {
            validation.set_audience(audiences);
        }
        validation.validate_exp = true;

        let data = decode::<Map<String, Value>>(token, &key, &validation).map_err(|e| {
            match e.kind() {
                ErrorKind::ExpiredSignature => JwtError::Expired,
                _ => JwtError::Invalid(e.to_string()),
            }
        })?;

        let exp = data
            .claims
            .get("exp")
            .and_then(Value::as_i64)
            .ok_or_else(|| JwtError::Invalid("missing exp claim".into()))?;
        let expiry = Utc
            .timestamp_opt(exp, 0)
            .single()
            .ok_or_else(|| JwtError::Invalid(format!("exp out of range: {}", exp)))?;

        Ok(VerifiedJwt {
            claims: data.claims,
            expiry,
        })
    }

    /// Look up a key, refreshing the key set when stale or when `force` is set
    ///
    /// A forced refresh is skipped while the key set is younger than the
    /// minimum refresh interval.
    async fn cached_key(&self, kid: Option<&str>, force: bool) -> Result<Option<DecodingKey>, JwtError> {
        let age = self
            .cache
            .read()
            .await
            .as_ref()
            .map(|c| c.last_refresh.elapsed());
        let refresh = match age {
            None => true,
            Some(age) if age > self.refresh_interval => true,
            Some(age) if force && age >= self.min_refresh_interval => true,
            Some(_) if force => {
                debug!(kid = ?kid, "Key set refreshed recently, not refetching");
                return Ok(None);
            }
            Some(_) => false,
        };

        if refresh {
            self.refresh_jwks().await?;
        }

        let cache = self.cache.read().await;
        let Some(cache) = cache.as_ref() else {
            return Err(JwtError::Jwks("key cache empty after refresh".into()));
        };

        Ok(match kid {
            Some(kid) => cache.keys.get(kid).cloned(),
            None if cache.keys.len() == 1 => cache.keys.values().next().cloned(),
            None => None,
        })
    }

    async fn jwks_uri(&self) -> Result<String, JwtError> {
        if let Some(uri) = self.jwks_uri.read().await.clone() {
            return Ok(uri);
        }
        let metadata = discover(&self.http, &self.issuer).await?;
        *self.jwks_uri.write().await = Some(metadata.jwks_uri.clone());
        Ok(metadata.jwks_uri)
    }

    async fn refresh_jwks(&self) -> Result<(), JwtError> {
        let uri = self.jwks_uri().await?;
        debug!(url = %uri, "Fetching JWKS");

        let response = self
            .http
            .get(&uri)
            .send()
            .await
            .map_err(|e| JwtError::Jwks(format!("failed to fetch {}: {}", uri, e)))?;
        if !response.status().is_success() {
            return Err(JwtError::Jwks(format!("{} returned {}", uri, response.status())));
        }
        let jwks: JwksDocument = response
            .json()
            .await
            .map_err(|e| JwtError::Jwks(format!("invalid JWKS response: {}", e)))?;

        let mut keys = HashMap::new();
        for jwk in jwks.keys {
            if jwk.key_use.as_deref().is_some_and(|u| u != "sig") {
                continue;
            }
            if let Some(key) = jwk_to_decoding_key(&jwk)? {
                let kid = jwk.kid.unwrap_or_else(|| "default".to_string());
                keys.insert(kid, key);
            }
        }

        if keys.is_empty() {
            return Err(JwtError::Jwks("no usable keys found".into()));
        }

        info!(issuer = %self.issuer, key_count = keys.len(), "Refreshed JWKS cache");

        *self.cache.write().await = Some(JwksCache {
            keys,
            last_refresh: Instant::now(),
        });
        Ok(())
    }
}

fn jwk_to_decoding_key(jwk: &JwkKey) -> Result<Option<DecodingKey>, JwtError> {
    let field = |value: &Option<String>, name: &str| {
        value
            .clone()
            .ok_or_else(|| JwtError::Jwks(format!("{} key missing '{}'", jwk.kty, name)))
    };

    match jwk.kty.as_str() {
        "RSA" => {
            let n = field(&jwk.n, "n")?;
            let e = field(&jwk.e, "e")?;
            DecodingKey::from_rsa_components(&n, &e)
                .map(Some)
                .map_err(|e| JwtError::Jwks(format!("invalid RSA key: {}", e)))
        }
        "EC" => {
            let crv = field(&jwk.crv, "crv")?;
            let x = field(&jwk.x, "x")?;
            let y = field(&jwk.y, "y")?;
            match crv.as_str() {
                "P-256" | "P-384" => DecodingKey::from_ec_components(&x, &y)
                    .map(Some)
                    .map_err(|e| JwtError::Jwks(format!("invalid EC {} key: {}", crv, e))),
                _ => {
                    warn!(crv = %crv, "Unsupported EC curve");
                    Ok(None)
                }
            }
        }
        kty => {
            warn!(kty = %kty, "Unsupported key type");
            Ok(None)
        }
    }
}
