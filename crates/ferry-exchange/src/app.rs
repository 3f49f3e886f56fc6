//! Wires configuration into a running server

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use ferry_common::ApiGroups;
use ferry_pki::{CertificateAuthority, DynamicCertIssuer};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::authenticator::AuthenticatorRegistry;
use crate::config::{ServerConfig, TlsConfig};
use crate::error::{Error, Result};
use crate::rotation::{CaFileWatcher, GeneratedCaRotator};
use crate::server::{start_server, AppState, ServingConfig};
use crate::service::ExchangeService;

const SERVING_CA_VALIDITY: Duration = Duration::from_secs(10 * 365 * 24 * 3600);
const SERVING_CERT_VALIDITY: Duration = Duration::from_secs(365 * 24 * 3600);

/// Run the exchange server until `shutdown` is cancelled
pub async fn run(config: ServerConfig, shutdown: CancellationToken) -> Result<()> {
    let issuer = Arc::new(DynamicCertIssuer::new(config.policy_max_ttl()));
    start_signer(&config, issuer.clone(), shutdown.clone()).await?;

    let registry = AuthenticatorRegistry::from_config(&config.authenticators)?;
    let service = ExchangeService::new(
        registry,
        issuer,
        ApiGroups::new(config.api_group_suffix.clone()),
    );

    let (cert_pem, key_pem) = serving_certificate(&config.tls).await?;
    let serving = ServingConfig {
        addr: config.listen_addr,
        cert_pem,
        key_pem,
    };

    start_server(
        serving,
        AppState {
            service: Arc::new(service),
        },
        shutdown,
    )
    .await
}

async fn start_signer(
    config: &ServerConfig,
    issuer: Arc<DynamicCertIssuer>,
    shutdown: CancellationToken,
) -> Result<()> {
    let interval = config.signer.reload_interval();

    match config.signer.ca_files() {
        Some((cert, key)) => {
            let mut watcher = CaFileWatcher::new(cert, key, issuer);
            if let Err(e) = watcher.reload().await {
                warn!(error = %e, "Signing CA not available yet, exchanges will fail until it is");
            }
            tokio::spawn(watcher.run(interval, shutdown));
        }
        None => {
            let rotator = GeneratedCaRotator::new(
                issuer,
                config.signer.generated_ca_validity(),
                config.signer.generated_ca_file.clone(),
            );
            rotator.rotate_if_needed().await?;
            info!("Using generated signing CA");
            tokio::spawn(rotator.run(interval, shutdown));
        }
    }
    Ok(())
}

async fn serving_certificate(tls: &TlsConfig) -> Result<(String, String)> {
    if let (Some(cert_file), Some(key_file)) = (&tls.cert_file, &tls.key_file) {
        let cert = tokio::fs::read_to_string(cert_file).await.map_err(|e| {
            Error::Config(format!("failed to read {}: {}", cert_file.display(), e))
        })?;
        let key = tokio::fs::read_to_string(key_file).await.map_err(|e| {
            Error::Config(format!("failed to read {}: {}", key_file.display(), e))
        })?;
        return Ok((cert, key));
    }

    let names: Vec<&str> = if tls.dns_names.is_empty() {
        vec!["localhost", "127.0.0.1"]
    } else {
        tls.dns_names.iter().map(String::as_str).collect()
    };

    let ca = CertificateAuthority::new("ferry-serving-ca", SERVING_CA_VALIDITY)?;
    let (cert, key) = ca.generate_server_cert(&names, SERVING_CERT_VALIDITY)?;

    if let Some(path) = &tls.generated_ca_file {
        tokio::fs::write(path, ca.ca_cert_pem())
            .await
            .map_err(|e| Error::Config(format!("failed to write {}: {}", path.display(), e)))?;
    }
    info!(
        dns_names = ?names,
        ca_bundle_data = %STANDARD.encode(ca.ca_cert_pem()),
        "Generated serving certificate"
    );

    Ok((cert, key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn generated_serving_cert_writes_ca() {
        let dir = tempfile::tempdir().unwrap();
        let ca_file = dir.path().join("serving-ca.pem");
        let tls = TlsConfig {
            dns_names: vec!["exchange.test".into()],
            generated_ca_file: Some(ca_file.clone()),
            ..Default::default()
        };

        let (cert, key) = serving_certificate(&tls).await.unwrap();
        assert!(cert.contains("BEGIN CERTIFICATE"));
        assert!(key.contains("PRIVATE KEY"));
        assert!(std::fs::read_to_string(ca_file)
            .unwrap()
            .contains("BEGIN CERTIFICATE"));
    }

    #[tokio::test]
    async fn file_serving_cert_is_read() {
        let dir = tempfile::tempdir().unwrap();
        let cert_file = dir.path().join("tls.crt");
        let key_file = dir.path().join("tls.key");
        std::fs::write(&cert_file, "cert").unwrap();
        std::fs::write(&key_file, "key").unwrap();

        let tls = TlsConfig {
            cert_file: Some(cert_file),
            key_file: Some(key_file),
            ..Default::default()
        };
        let (cert, key) = serving_certificate(&tls).await.unwrap();
        assert_eq!((cert.as_str(), key.as_str()), ("cert", "key"));
    }

    #[tokio::test]
    async fn generated_signer_is_loaded_at_start() {
        let config = ServerConfig::from_yaml("authenticators: []").unwrap();
        let issuer = Arc::new(DynamicCertIssuer::new(config.policy_max_ttl()));
        let shutdown = CancellationToken::new();

        start_signer(&config, issuer.clone(), shutdown.clone())
            .await
            .unwrap();
        assert!(issuer.current().is_some());
        shutdown.cancel();
    }
}
