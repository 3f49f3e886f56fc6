//! File-backed YAML stores shared by the session and credential caches
//!
//! Every operation is a transaction: take an advisory exclusive lock on
//! `<path>.lock`, read the document, apply the change, write it back through a
//! temporary file that is renamed over the original, then release the lock.
//! Concurrent CLI processes therefore see whole documents and the last writer
//! wins.
//!
//! Failures never abort a login. They are handed to an [`ErrorReporter`] and
//! the operation degrades to a cache miss or a no-op.
//!
//! Operations block while waiting for the lock. Async callers run them on the
//! blocking pool; a cache given a [`CancellationToken`] stops waiting for the
//! lock once the token fires.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// `apiVersion` written into every cache document
pub const CACHE_API_VERSION: &str = "config.ferry.dev/v1alpha1";

/// How long to wait for another process to release the lock
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Cache failures; reported, never returned to the login flow
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// The cache directory could not be created
    #[error("could not create cache directory {path}: {source}")]
    CreateDir {
        /// Directory
        path: PathBuf,
        /// Cause
        source: std::io::Error,
    },

    /// Another process held the lock for too long
    #[error("timed out after {timeout:?} waiting for lock on {path}")]
    LockTimeout {
        /// Lock file
        path: PathBuf,
        /// How long we waited
        timeout: Duration,
    },

    /// The operation was cancelled while waiting for the lock
    #[error("cancelled while waiting for lock on {0}")]
    Cancelled(PathBuf),

    /// The lock file could not be opened or locked
    #[error("could not lock {path}: {source}")]
    Lock {
        /// Lock file
        path: PathBuf,
        /// Cause
        source: std::io::Error,
    },

    /// The cache file exists but could not be read
    #[error("could not read {path}: {source}")]
    Read {
        /// Cache file
        path: PathBuf,
        /// Cause
        source: std::io::Error,
    },

    /// The cache file is not valid YAML for this cache
    #[error("invalid cache file {path}: {reason}")]
    Corrupt {
        /// Cache file
        path: PathBuf,
        /// Parse failure or header mismatch
        reason: String,
    },

    /// The updated document could not be written
    #[error("could not write {path}: {source}")]
    Write {
        /// Cache file
        path: PathBuf,
        /// Cause
        source: std::io::Error,
    },

    /// The document or a key could not be encoded
    #[error("could not encode cache data: {0}")]
    Encode(String),
}

/// Receives cache failures
pub type ErrorReporter = Arc<dyn Fn(&CacheError) + Send + Sync>;

/// Reporter that logs at debug level
pub fn debug_reporter() -> ErrorReporter {
    Arc::new(|e: &CacheError| debug!(error = %e, "Cache operation failed"))
}

/// Reporter that logs at warn level
pub fn warn_reporter() -> ErrorReporter {
    Arc::new(|e: &CacheError| warn!(error = %e, "Cache operation failed"))
}

/// On-disk layout: a versioned header plus the cache-specific body
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Document<B> {
    api_version: String,
    kind: String,
    #[serde(flatten)]
    body: B,
}

/// A YAML file holding one `B` under a `kind` header
pub(crate) struct CacheFile<B> {
    path: PathBuf,
    kind: &'static str,
    lock_timeout: Duration,
    cancel: CancellationToken,
    reporter: ErrorReporter,
    _body: PhantomData<fn() -> B>,
}

impl<B> CacheFile<B>
where
    B: Default + Serialize + DeserializeOwned,
{
    pub(crate) fn new(path: impl Into<PathBuf>, kind: &'static str) -> Self {
        Self {
            path: path.into(),
            kind,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            cancel: CancellationToken::new(),
            reporter: debug_reporter(),
            _body: PhantomData,
        }
    }

    pub(crate) fn set_reporter(&mut self, reporter: ErrorReporter) {
        self.reporter = reporter;
    }

    pub(crate) fn set_cancellation(&mut self, cancel: CancellationToken) {
        self.cancel = cancel;
    }

    #[cfg(test)]
    pub(crate) fn set_lock_timeout(&mut self, timeout: Duration) {
        self.lock_timeout = timeout;
    }

    pub(crate) fn report(&self, error: &CacheError) {
        (self.reporter)(error);
    }

    /// Lock, read, apply `f`, write back, unlock
    ///
    /// Returns `None` if any step failed; the failure has been reported.
    pub(crate) fn update<R>(&self, f: impl FnOnce(&mut B) -> R) -> Option<R> {
        match self.try_update(f) {
            Ok(result) => Some(result),
            Err(e) => {
                self.report(&e);
                None
            }
        }
    }

    fn try_update<R>(&self, f: impl FnOnce(&mut B) -> R) -> Result<R, CacheError> {
        self.ensure_dir()?;
        let _lock = self.lock()?;

        let mut body = self.load()?;
        let result = f(&mut body);
        self.store(body)?;
        Ok(result)
    }

    fn ensure_dir(&self) -> Result<(), CacheError> {
        match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => {
                std::fs::create_dir_all(dir).map_err(|source| CacheError::CreateDir {
                    path: dir.to_path_buf(),
                    source,
                })
            }
            _ => Ok(()),
        }
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".lock");
        PathBuf::from(name)
    }

    fn lock(&self) -> Result<FileLock, CacheError> {
        let path = self.lock_path();
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|source| CacheError::Lock {
                path: path.clone(),
                source,
            })?;

        let deadline = Instant::now() + self.lock_timeout;
        loop {
            match fs2::FileExt::try_lock_exclusive(&file) {
                Ok(()) => return Ok(FileLock { file }),
                Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                    if self.cancel.is_cancelled() {
                        return Err(CacheError::Cancelled(path));
                    }
                    if Instant::now() >= deadline {
                        return Err(CacheError::LockTimeout {
                            path,
                            timeout: self.lock_timeout,
                        });
                    }
                    std::thread::sleep(LOCK_RETRY_INTERVAL);
                }
                Err(source) => return Err(CacheError::Lock { path, source }),
            }
        }
    }

    /// Read the current body; a missing file is empty, a corrupt one is
    /// reported and replaced
    fn load(&self) -> Result<B, CacheError> {
        let data = match std::fs::read_to_string(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(B::default()),
            Err(source) => {
                return Err(CacheError::Read {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        if data.trim().is_empty() {
            return Ok(B::default());
        }

        match serde_yaml::from_str::<Document<B>>(&data) {
            Ok(doc) if doc.api_version == CACHE_API_VERSION && doc.kind == self.kind => Ok(doc.body),
            Ok(doc) => {
                self.report(&CacheError::Corrupt {
                    path: self.path.clone(),
                    reason: format!(
                        "unexpected header {}/{}, starting empty",
                        doc.api_version, doc.kind
                    ),
                });
                Ok(B::default())
            }
            Err(e) => {
                self.report(&CacheError::Corrupt {
                    path: self.path.clone(),
                    reason: format!("{}, starting empty", e),
                });
                Ok(B::default())
            }
        }
    }

    fn store(&self, body: B) -> Result<(), CacheError> {
        let doc = Document {
            api_version: CACHE_API_VERSION.to_string(),
            kind: self.kind.to_string(),
            body,
        };
        let data = serde_yaml::to_string(&doc).map_err(|e| CacheError::Encode(e.to_string()))?;

        let write_err = |source| CacheError::Write {
            path: self.path.clone(),
            source,
        };
        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };

        // Temp file is created 0600 and renamed into place
        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(write_err)?;
        tmp.write_all(data.as_bytes()).map_err(write_err)?;
        tmp.as_file().sync_all().map_err(write_err)?;
        tmp.persist(&self.path).map_err(|e| write_err(e.error))?;
        Ok(())
    }
}

/// Held for the duration of a transaction
struct FileLock {
    file: File,
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}
