//! Cache of cluster credentials keyed by invocation
//!
//! kubectl runs the exec plugin before every request. Caching the resulting
//! credential until it expires avoids repeating the login and exchange each
//! time. Entries are keyed by a fingerprint of whatever the caller considers
//! the identity of the request (the full argument list and the target cluster).

use std::path::PathBuf;

use aws_lc_rs::digest::{digest, SHA256};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::cache::{CacheError, CacheFile, ErrorReporter};
use crate::credential::{ExecCredential, ExecCredentialStatus};

const CREDENTIAL_CACHE_KIND: &str = "CredentialCache";

/// One cached credential
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    /// SHA-256 hex fingerprint of the cache key
    pub key: String,
    /// First stored
    pub creation_timestamp: DateTime<Utc>,
    /// Last returned or written
    pub last_used_timestamp: DateTime<Utc>,
    /// The credential
    pub credential: ExecCredentialStatus,
}

impl CacheEntry {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.credential
            .expiration_timestamp
            .is_some_and(|expiry| expiry > now)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CredentialBody {
    #[serde(default)]
    credentials: Vec<CacheEntry>,
}

/// File-backed credential cache
pub struct CredentialCache {
    file: CacheFile<CredentialBody>,
}

impl CredentialCache {
    /// Cache at `path`; errors are logged at debug level
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            file: CacheFile::new(path, CREDENTIAL_CACHE_KIND),
        }
    }

    /// Send errors somewhere else
    pub fn with_error_reporter(mut self, reporter: ErrorReporter) -> Self {
        self.file.set_reporter(reporter);
        self
    }

    /// Stop waiting for the file lock once `cancel` fires
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.file.set_cancellation(cancel);
        self
    }

    /// Unexpired credential stored under `key`
    ///
    /// An expired entry is treated as absent but left in the file; the next
    /// [`put`](Self::put) for the same key replaces it.
    pub fn get<K: Serialize>(&self, key: &K) -> Option<ExecCredential> {
        let fingerprint = self.fingerprint(key)?;
        let now = Utc::now();

        let status = self
            .file
            .update(|body| {
                body.credentials
                    .iter_mut()
                    .find(|entry| entry.key == fingerprint && entry.is_live(now))
                    .map(|entry| {
                        entry.last_used_timestamp = now;
                        entry.credential.clone()
                    })
            })
            .flatten();

        debug!(hit = status.is_some(), "Credential cache lookup");
        status.map(ExecCredential::new)
    }

    /// Store `credential` under `key`, replacing any previous entry
    ///
    /// Credentials without an expiration are never cached.
    pub fn put<K: Serialize>(&self, key: &K, credential: &ExecCredential) {
        let Some(status) = credential
            .status
            .as_ref()
            .filter(|s| s.expiration_timestamp.is_some())
        else {
            debug!("Credential has no expiration, not caching");
            return;
        };
        let Some(fingerprint) = self.fingerprint(key) else {
            return;
        };
        let now = Utc::now();

        self.file.update(|body| {
            body.credentials.retain(|entry| entry.key != fingerprint);
            body.credentials.push(CacheEntry {
                key: fingerprint,
                creation_timestamp: now,
                last_used_timestamp: now,
                credential: status.clone(),
            });
        });
    }

    fn fingerprint<K: Serialize>(&self, key: &K) -> Option<String> {
        match fingerprint(key) {
            Ok(fp) => Some(fp),
            Err(e) => {
                self.file.report(&e);
                None
            }
        }
    }
}

/// SHA-256 over the JSON encoding of `key`, hex encoded
fn fingerprint<K: Serialize>(key: &K) -> Result<String, CacheError> {
    let json = serde_json::to_vec(key).map_err(|e| CacheError::Encode(e.to_string()))?;
    Ok(digest(&SHA256, &json)
        .as_ref()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect())
}
