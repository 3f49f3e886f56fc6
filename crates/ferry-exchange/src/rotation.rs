//! Keeps the signing CA current
//!
//! Two sources are supported:
//!
//! - **Files**: the CA certificate and key are re-read every interval and
//!   installed when their content changes. A bad pair is logged and the
//!   previous CA stays in service. Until a valid pair appears the issuer has
//!   no CA and exchanges answer 503.
//! - **Generated**: a CA is created at startup and replaced once 80% of its
//!   lifetime has passed. The current CA is optionally written to disk so the
//!   cluster can be configured to trust it.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use ferry_pki::{CaMaterial, CertificateAuthority, CertificateInfo, DynamicCertIssuer};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};

const GENERATED_CA_COMMON_NAME: &str = "ferry-signer-ca";

/// Watches a CA certificate/key pair on disk
pub struct CaFileWatcher {
    cert_path: PathBuf,
    key_path: PathBuf,
    issuer: Arc<DynamicCertIssuer>,
    last_seen: Option<(String, String)>,
}

impl CaFileWatcher {
    /// Create a watcher that installs into `issuer`
    pub fn new(cert_path: &Path, key_path: &Path, issuer: Arc<DynamicCertIssuer>) -> Self {
        Self {
            cert_path: cert_path.to_path_buf(),
            key_path: key_path.to_path_buf(),
            issuer,
            last_seen: None,
        }
    }

    /// Re-read the files; returns true if a new CA was installed
    pub async fn reload(&mut self) -> Result<bool> {
        let cert = tokio::fs::read_to_string(&self.cert_path).await.map_err(|e| {
            Error::Config(format!("failed to read {}: {}", self.cert_path.display(), e))
        })?;
        let key = tokio::fs::read_to_string(&self.key_path).await.map_err(|e| {
            Error::Config(format!("failed to read {}: {}", self.key_path.display(), e))
        })?;

        if self
            .last_seen
            .as_ref()
            .is_some_and(|(c, k)| *c == cert && *k == key)
        {
            return Ok(false);
        }

        // Recorded before validation: a bad pair is reported once, not every poll
        self.last_seen = Some((cert.clone(), key.clone()));

        let material = CaMaterial::from_pem(&cert, &key)
            .map_err(|e| Error::Config(format!("invalid signing CA: {}", e)))?;
        self.issuer.set_ca(material);
        Ok(true)
    }

    /// Poll until cancelled
    pub async fn run(mut self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("CA file watcher stopped");
                    return;
                }
                _ = ticker.tick() => {
                    match self.reload().await {
                        Ok(true) => info!(cert = %self.cert_path.display(), "Reloaded signing CA"),
                        Ok(false) => {}
                        Err(e) => warn!(error = %e, "Signing CA reload failed, keeping current CA"),
                    }
                }
            }
        }
    }
}

/// Generates the signing CA and replaces it before it expires
pub struct GeneratedCaRotator {
    issuer: Arc<DynamicCertIssuer>,
    validity: Duration,
    out_file: Option<PathBuf>,
}

impl GeneratedCaRotator {
    /// Create a rotator that installs into `issuer`
    pub fn new(issuer: Arc<DynamicCertIssuer>, validity: Duration, out_file: Option<PathBuf>) -> Self {
        Self {
            issuer,
            validity,
            out_file,
        }
    }

    /// Generate and install a CA if none is loaded or the current one is due
    ///
    /// Returns true if a new CA was installed.
    pub async fn rotate_if_needed(&self) -> Result<bool> {
        let due = match self.issuer.current() {
            None => true,
            Some(current) => CertificateInfo::from_pem(current.cert_pem())
                .map(|info| info.needs_rotation())
                .unwrap_or(true),
        };
        if !due {
            return Ok(false);
        }

        let ca = CertificateAuthority::new(GENERATED_CA_COMMON_NAME, self.validity)?;
        let material = ca.to_material()?;

        if let Some(path) = &self.out_file {
            write_atomically(path, ca.ca_cert_pem()).await?;
        }

        self.issuer.set_ca(material);
        Ok(true)
    }

    /// Check periodically until cancelled
    pub async fn run(self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("CA rotator stopped");
                    return;
                }
                _ = ticker.tick() => {
                    match self.rotate_if_needed().await {
                        Ok(true) => info!("Rotated generated signing CA"),
                        Ok(false) => {}
                        Err(e) => error!(error = %e, "Signing CA rotation failed"),
                    }
                }
            }
        }
    }
}

async fn write_atomically(path: &Path, contents: &str) -> Result<()> {
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, contents)
        .await
        .map_err(|e| Error::Internal(format!("failed to write {}: {}", tmp.display(), e)))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| Error::Internal(format!("failed to rename to {}: {}", path.display(), e)))
}
