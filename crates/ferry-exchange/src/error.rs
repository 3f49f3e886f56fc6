//! Error types for the exchange server

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use ferry_pki::PkiError;

/// Result type for exchange server operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for exchange server operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Request could not be parsed or is missing required fields
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Token was not accepted by the selected authenticator
    #[error("authentication failed")]
    Unauthenticated,

    /// Signing CA is not loaded or has expired
    #[error("signing CA unavailable: {0}")]
    CaUnavailable(String),

    /// Certificate could not be constructed
    #[error("certificate issuance failed: {0}")]
    Issuance(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Internal server error
    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Error::BadRequest(_) => StatusCode::BAD_REQUEST,
            Error::Unauthenticated => StatusCode::UNAUTHORIZED,
            Error::CaUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Issuance(_) | Error::Config(_) | Error::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        // K8s-style Status response
        let body = serde_json::json!({
            "kind": "Status",
            "apiVersion": "v1",
            "status": "Failure",
            "message": self.to_string(),
            "code": status.as_u16()
        });

        (status, axum::Json(body)).into_response()
    }
}

impl From<PkiError> for Error {
    fn from(e: PkiError) -> Self {
        match e {
            PkiError::CaNotLoaded | PkiError::CaExpired(_) => Error::CaUnavailable(e.to_string()),
            other => Error::Issuance(other.to_string()),
        }
    }
}
