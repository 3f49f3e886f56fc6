//! Ferry exchange server
//!
//! Accepts `TokenCredentialRequest`s, validates the enclosed identity token
//! with the named authenticator, and answers with a short-lived client
//! certificate signed by the current signing CA.
//!
//! - [`authenticator`]: the [`Authenticator`] trait and its webhook/JWT backends
//! - [`service`]: validate-then-issue logic ([`ExchangeService`])
//! - [`server`]: axum router and HTTPS listener
//! - [`rotation`]: signing CA reload and rotation
//! - [`config`]: YAML configuration

#![deny(missing_docs)]

pub mod app;
pub mod authenticator;
pub mod config;
pub mod error;
pub mod rotation;
pub mod server;
pub mod service;

pub use authenticator::{AuthError, Authenticator, AuthenticatorRegistry};
pub use config::ServerConfig;
pub use error::{Error, Result};
pub use server::{router, AppState};
pub use service::{cluster_credential, ExchangeService, CLIENT_CERT_TTL};
