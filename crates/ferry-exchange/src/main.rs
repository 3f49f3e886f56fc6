//! Ferry exchange server binary

use std::path::PathBuf;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use ferry_exchange::ServerConfig;

/// Exchanges identity tokens for short-lived cluster client certificates
#[derive(Parser, Debug)]
#[command(name = "ferry-exchange", version, about, long_about = None)]
struct Cli {
    /// Path to the YAML server configuration
    #[arg(short = 'c', long = "config", env = "FERRY_EXCHANGE_CONFIG")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("failed to install aws-lc-rs crypto provider: {:?}", e);
        std::process::exit(1);
    }

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = ServerConfig::load(&cli.config)?;

    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received interrupt");
            on_signal.cancel();
        }
    });

    ferry_exchange::app::run(config, shutdown).await?;
    Ok(())
}
