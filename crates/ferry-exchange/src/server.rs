//! HTTPS endpoint for token credential requests

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use ferry_common::{TokenCredentialRequest, TokenCredentialRequestStatus};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::{Error, Result};
use crate::service::{cluster_credential, ExchangeService};

/// Message returned for every authentication failure
pub const AUTHENTICATION_FAILED: &str = "authentication failed";

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Listener settings
#[derive(Clone)]
pub struct ServingConfig {
    /// Address to bind the server
    pub addr: SocketAddr,
    /// TLS certificate PEM
    pub cert_pem: String,
    /// TLS private key PEM
    pub key_pem: String,
}

/// Shared state for handlers
#[derive(Clone)]
pub struct AppState {
    /// Validate-and-issue logic
    pub service: Arc<ExchangeService>,
}

/// Build the router; also used directly by tests
pub fn router(state: AppState) -> Router {
    let path = state.service.api_groups().token_credential_request_path();
    Router::new()
        .route(&path, post(token_credential_request_handler))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(state)
}

async fn token_credential_request_handler(
    State(state): State<AppState>,
    payload: std::result::Result<Json<TokenCredentialRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<TokenCredentialRequest>)> {
    let Json(mut request) = payload.map_err(|e| Error::BadRequest(e.body_text()))?;

    let status = match state.service.handle(&request).await {
        Ok(issued) => TokenCredentialRequestStatus {
            credential: Some(cluster_credential(issued)),
            message: None,
        },
        Err(Error::Unauthenticated) => TokenCredentialRequestStatus {
            credential: None,
            message: Some(AUTHENTICATION_FAILED.to_string()),
        },
        Err(e @ Error::CaUnavailable(_)) => {
            warn!(error = %e, "Cannot issue credential");
            return Err(e);
        }
        Err(e @ Error::BadRequest(_)) => return Err(e),
        Err(e) => {
            error!(error = %e, "Credential issuance failed");
            return Err(e);
        }
    };

    request.spec.token.clear();
    request.status = Some(status);
    Ok((StatusCode::CREATED, Json(request)))
}

/// Serve HTTPS until `shutdown` is cancelled
pub async fn start_server(
    config: ServingConfig,
    state: AppState,
    shutdown: CancellationToken,
) -> Result<()> {
    let tls_config =
        RustlsConfig::from_pem(config.cert_pem.into_bytes(), config.key_pem.into_bytes())
            .await
            .map_err(|e| Error::Config(format!("TLS config error: {}", e)))?;

    let handle = Handle::new();
    let shutdown_handle = handle.clone();
    tokio::spawn(async move {
        shutdown.cancelled().await;
        info!("Shutting down exchange server");
        shutdown_handle.graceful_shutdown(Some(SHUTDOWN_GRACE));
    });

    info!(addr = %config.addr, "Starting exchange server");

    axum_server::bind_rustls(config.addr, tls_config)
        .handle(handle)
        .serve(router(state).into_make_service())
        .await
        .map_err(|e| Error::Internal(format!("Server error: {}", e)))?;

    Ok(())
}
