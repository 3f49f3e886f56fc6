//! PKI errors

use thiserror::Error;

/// PKI errors
#[derive(Debug, Error)]
pub enum PkiError {
    /// No signing CA has been loaded yet
    #[error("signing CA not loaded")]
    CaNotLoaded,

    /// The loaded signing CA is past its notAfter
    #[error("signing CA expired at {0}")]
    CaExpired(chrono::DateTime<chrono::Utc>),

    /// Certificate PEM/DER could not be parsed or is unsuitable
    #[error("certificate parsing error: {0}")]
    ParseError(String),

    /// Key generation failed
    #[error("key generation failed: {0}")]
    KeyGenerationFailed(String),

    /// Certificate construction or signing failed
    #[error("certificate generation failed: {0}")]
    CertificateGenerationFailed(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<openssl::error::ErrorStack> for PkiError {
    fn from(e: openssl::error::ErrorStack) -> Self {
        PkiError::CertificateGenerationFailed(e.to_string())
    }
}

/// Result type for PKI operations
pub type Result<T> = std::result::Result<T, PkiError>;
