//! Persistent store of upstream login sessions
//!
//! One entry per [`SessionKey`]; an entry holds the most recent [`Token`] for
//! that issuer/client/scope combination so later invocations can reuse the ID
//! token or refresh it without a browser round-trip. Entries never expire on
//! their own; a stale token simply fails to refresh and is replaced.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::cache::{CacheFile, ErrorReporter};
use crate::oidc::Token;

const SESSION_CACHE_KIND: &str = "SessionCache";

/// Identifies one login session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionKey {
    /// Upstream issuer URL
    pub issuer: String,
    /// OAuth2 client ID
    pub client_id: String,
    /// Requested scopes, sorted
    pub scopes: Vec<String>,
    /// Callback URI as configured (`http://127.0.0.1:<port>/callback`)
    pub redirect_uri: String,
    /// Upstream identity provider name, if one was selected
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub upstream_provider_name: String,
    /// Upstream identity provider type, if one was selected
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub upstream_provider_type: String,
}

impl SessionKey {
    /// Build a key; scope order does not matter
    pub fn new<I, S>(
        issuer: impl Into<String>,
        client_id: impl Into<String>,
        scopes: I,
        redirect_uri: impl Into<String>,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut scopes: Vec<String> = scopes.into_iter().map(Into::into).collect();
        scopes.sort();
        scopes.dedup();
        Self {
            issuer: issuer.into(),
            client_id: client_id.into(),
            scopes,
            redirect_uri: redirect_uri.into(),
            upstream_provider_name: String::new(),
            upstream_provider_type: String::new(),
        }
    }

    /// Scope the key to an upstream identity provider
    pub fn with_upstream(mut self, name: impl Into<String>, provider_type: impl Into<String>) -> Self {
        self.upstream_provider_name = name.into();
        self.upstream_provider_type = provider_type.into();
        self
    }
}

/// One cached session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEntry {
    /// Which session this is
    pub key: SessionKey,
    /// First stored
    pub creation_timestamp: DateTime<Utc>,
    /// Last read or written
    pub last_used_timestamp: DateTime<Utc>,
    /// Latest token
    pub tokens: Token,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SessionBody {
    #[serde(default)]
    sessions: Vec<SessionEntry>,
}

/// Where the login handler keeps tokens between invocations
#[cfg_attr(test, automock)]
pub trait SessionCache: Send + Sync {
    /// Token stored for `key`, if any
    fn get_token(&self, key: &SessionKey) -> Option<Token>;

    /// Replace the token stored for `key`
    fn put_token(&self, key: &SessionKey, token: Token);
}

/// [`SessionCache`] backed by a YAML file
pub struct FileSessionCache {
    file: CacheFile<SessionBody>,
}

impl FileSessionCache {
    /// Cache at `path`; errors are logged at debug level
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            file: CacheFile::new(path, SESSION_CACHE_KIND),
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
}

impl SessionCache for FileSessionCache {
    fn get_token(&self, key: &SessionKey) -> Option<Token> {
        let now = Utc::now();
        let found = self
            .file
            .update(|body| {
                body.sessions.iter_mut().find(|s| s.key == *key).map(|entry| {
                    entry.last_used_timestamp = now;
                    entry.tokens.clone()
                })
            })
            .flatten();
        debug!(issuer = %key.issuer, hit = found.is_some(), "Session cache lookup");
        found
    }

    fn put_token(&self, key: &SessionKey, token: Token) {
        let now = Utc::now();
        self.file.update(|body| {
            match body.sessions.iter_mut().find(|s| s.key == *key) {
                Some(entry) => {
                    entry.tokens = token;
                    entry.last_used_timestamp = now;
                }
                None => body.sessions.push(SessionEntry {
                    key: key.clone(),
                    creation_timestamp: now,
                    last_used_timestamp: now,
                    tokens: token,
                }),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheError;
    use crate::oidc::{IdToken, RefreshToken};
    use serde_json::Map;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn key() -> SessionKey {
        SessionKey::new(
            "https://idp.example.com",
            "ferry-cli",
            ["openid", "offline_access"],
            "http://127.0.0.1:0/callback",
        )
    }

    fn token(id: &str) -> Token {
        Token {
            access_token: None,
            refresh_token: Some(RefreshToken {
                token: format!("refresh-{id}"),
            }),
            id_token: Some(IdToken {
                token: id.to_string(),
                expiry: Utc::now() + chrono::Duration::hours(1),
                claims: Map::new(),
            }),
        }
    }

    #[test]
    fn scopes_are_order_insensitive() {
        let a = SessionKey::new("i", "c", ["b", "a"], "r");
        let b = SessionKey::new("i", "c", ["a", "b", "a"], "r");
        assert_eq!(a, b);
        assert_ne!(a, a.clone().with_upstream("corp-ldap", "ldap"));
    }

    #[test]
    fn round_trip_across_handles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.yaml");
        let stored = token("first");

        FileSessionCache::new(&path).put_token(&key(), stored.clone());
        assert_eq!(FileSessionCache::new(&path).get_token(&key()), Some(stored));

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("apiVersion: config.ferry.dev/v1alpha1"));
        assert!(text.contains("kind: SessionCache"));
    }

    #[test]
    fn put_replaces_whole_record() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileSessionCache::new(dir.path().join("sessions.yaml"));

        cache.put_token(&key(), token("first"));
        let replacement = token("second");
        cache.put_token(&key(), replacement.clone());

        assert_eq!(cache.get_token(&key()), Some(replacement));
        let other = key().with_upstream("corp", "oidc");
        assert_eq!(cache.get_token(&other), None);
    }

    #[test]
    fn get_bumps_last_used() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.yaml");
        let cache = FileSessionCache::new(&path);
        cache.put_token(&key(), token("first"));

        let read_entry = || {
            let text = std::fs::read_to_string(&path).unwrap();
            let value: serde_yaml::Value = serde_yaml::from_str(&text).unwrap();
            let entry = &value["sessions"][0];
            (
                entry["creationTimestamp"].as_str().unwrap().to_string(),
                entry["lastUsedTimestamp"].as_str().unwrap().to_string(),
            )
        };
        let (created, used_before) = read_entry();

        std::thread::sleep(std::time::Duration::from_millis(20));
        cache.get_token(&key());
        let (created_after, used_after) = read_entry();

        assert_eq!(created, created_after);
        assert_ne!(used_before, used_after);
    }

    #[test]
    fn unwritable_location_degrades_to_miss() {
        let dir = tempfile::tempdir().unwrap();
        // A regular file where the cache directory should be
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "").unwrap();

        let reported = Arc::new(AtomicUsize::new(0));
        let counter = reported.clone();
        let cache = FileSessionCache::new(blocker.join("sessions.yaml")).with_error_reporter(
            Arc::new(move |_: &CacheError| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        cache.put_token(&key(), token("first"));
        assert_eq!(cache.get_token(&key()), None);
        assert_eq!(reported.load(Ordering::SeqCst), 2);
    }
}
