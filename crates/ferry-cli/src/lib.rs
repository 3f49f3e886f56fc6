//! Ferry CLI library
//!
//! `ferry login oidc` is a kubectl exec credential plugin: it logs in to an
//! upstream OIDC (or LDAP-backed) issuer, optionally trades the ID token for a
//! short-lived client certificate at a Ferry exchange server, and prints the
//! result as an `ExecCredential`.

pub mod cache;
pub mod commands;
pub mod config;
pub mod credcache;
pub mod credential;
pub mod error;
pub mod exchange;
pub mod oidc;
pub mod session;

pub use error::{Error, Result};

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

/// Ferry - credential federation for Kubernetes clusters
#[derive(Parser, Debug)]
#[command(name = "ferry")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Log in and print a cluster credential for kubectl
    Login(commands::login::LoginArgs),
}

impl Cli {
    /// Run the CLI command until it finishes or `cancel` fires
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        match self.command {
            Commands::Login(args) => commands::login::run(args, cancel).await,
        }
    }
}
