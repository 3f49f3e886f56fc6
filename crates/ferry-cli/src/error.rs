//! Error types for the CLI

use crate::exchange::ExchangeError;
use crate::oidc::LoginError;

/// CLI Result type
pub type Result<T> = std::result::Result<T, Error>;

/// CLI errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Bad flag values, detected before any network call
    #[error("{message}")]
    Validation {
        /// What was wrong
        message: String,
    },

    /// The upstream login did not produce a token
    #[error("could not complete login: {0}")]
    Login(#[from] LoginError),

    /// The token could not be exchanged for a cluster credential
    #[error("could not complete credential exchange: {0}")]
    Exchange(#[from] ExchangeError),

    /// Local I/O failure
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Output encoding failure
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Shorthand for [`Error::Validation`]
    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation {
            message: message.into(),
        }
    }
}
