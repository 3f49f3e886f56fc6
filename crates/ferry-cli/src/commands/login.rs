//! `ferry login oidc`: kubectl exec credential plugin
//!
//! Logs in to the upstream issuer (reusing the session cache where possible),
//! optionally exchanges the ID token for a cluster credential, and prints an
//! `ExecCredential` on stdout.
//!
//! # Usage
//!
//! ```bash
//! # ID token as the bearer credential
//! ferry login oidc --issuer https://idp.example.com
//!
//! # Exchange for a short-lived client certificate
//! ferry login oidc --issuer https://idp.example.com \
//!     --enable-exchange \
//!     --exchange-endpoint https://exchange.example.com \
//!     --exchange-authenticator-type jwt \
//!     --exchange-authenticator-name corp-idp \
//!     --exchange-ca-bundle-data "$(base64 -w0 < exchange-ca.pem)"
//! ```

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use clap::{Args, Subcommand};
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::cache::{debug_reporter, warn_reporter};
use crate::config;
use crate::credcache::CredentialCache;
use crate::credential::{cluster_info_from_env, ExecCredential};
use crate::exchange::{ExchangeClient, ExchangeConfig, DEFAULT_EXCHANGE_TIMEOUT};
use crate::oidc::{
    browser_presenter, print_presenter, run_blocking, CredentialSource, LoginConfig, LoginError,
    LoginHandler, Presenter, PromptCredentials, UpstreamProviderType, DEFAULT_CALLBACK_TIMEOUT,
    DEFAULT_HTTP_TIMEOUT,
};
use crate::session::FileSessionCache;
use crate::{Error, Result};

/// Log in and print a cluster credential
#[derive(Args, Debug)]
pub struct LoginArgs {
    #[command(subcommand)]
    pub command: LoginCommand,
}

/// Login methods
#[derive(Subcommand, Debug)]
pub enum LoginCommand {
    /// Log in with an OpenID Connect provider
    Oidc(OidcLoginArgs),
}

/// Flags for `ferry login oidc`
#[derive(Args, Debug, Clone)]
pub struct OidcLoginArgs {
    /// OpenID Connect issuer URL
    #[arg(long, env = "FERRY_ISSUER")]
    pub issuer: String,

    /// OpenID Connect client ID
    #[arg(long, env = "FERRY_CLIENT_ID", default_value = "ferry-cli")]
    pub client_id: String,

    /// TCP port for the localhost callback listener (0 picks a free port)
    #[arg(long, env = "FERRY_LISTEN_PORT", default_value_t = 0)]
    pub listen_port: u16,

    /// OIDC scopes to request during login
    #[arg(
        long,
        env = "FERRY_SCOPES",
        value_delimiter = ',',
        default_value = "offline_access,openid,ferry:request-audience"
    )]
    pub scopes: Vec<String>,

    /// Print the login URL instead of opening a browser
    #[arg(long, env = "FERRY_SKIP_BROWSER")]
    pub skip_browser: bool,

    /// Path to the session cache file
    #[arg(long, env = "FERRY_SESSION_CACHE", default_value_t = config::default_session_cache_path())]
    pub session_cache: String,

    /// Path to a PEM file of CAs to trust for the issuer (repeatable)
    #[arg(long = "ca-bundle", env = "FERRY_CA_BUNDLE", value_delimiter = ',')]
    pub ca_bundles: Vec<PathBuf>,

    /// Base64 PEM CA bundle to trust for the issuer (repeatable)
    #[arg(long = "ca-bundle-data", env = "FERRY_CA_BUNDLE_DATA", value_delimiter = ',')]
    pub ca_bundle_data: Vec<String>,

    /// Print session cache errors as warnings
    #[arg(long, env = "FERRY_DEBUG_SESSION_CACHE", hide = true)]
    pub debug_session_cache: bool,

    /// Exchange the ID token for one with this audience
    #[arg(long, env = "FERRY_REQUEST_AUDIENCE")]
    pub request_audience: Option<String>,

    /// Exchange the ID token for a cluster credential
    #[arg(long, env = "FERRY_ENABLE_EXCHANGE")]
    pub enable_exchange: bool,

    /// Exchange authenticator type (webhook or jwt)
    #[arg(long, env = "FERRY_EXCHANGE_AUTHENTICATOR_TYPE", default_value = "")]
    pub exchange_authenticator_type: String,

    /// Exchange authenticator name
    #[arg(long, env = "FERRY_EXCHANGE_AUTHENTICATOR_NAME", default_value = "")]
    pub exchange_authenticator_name: String,

    /// Exchange server base URL
    #[arg(long, env = "FERRY_EXCHANGE_ENDPOINT", default_value = "")]
    pub exchange_endpoint: String,

    /// Base64 PEM CA bundle to trust for the exchange server
    #[arg(long, env = "FERRY_EXCHANGE_CA_BUNDLE_DATA")]
    pub exchange_ca_bundle_data: Option<String>,

    /// API group suffix of the exchange server
    #[arg(long, env = "FERRY_EXCHANGE_API_GROUP_SUFFIX", default_value = "ferry.dev")]
    pub exchange_api_group_suffix: String,

    /// Path to the cluster credential cache file ("" disables it)
    #[arg(long, env = "FERRY_CREDENTIAL_CACHE", default_value_t = config::default_credential_cache_path())]
    pub credential_cache: String,

    /// Upstream identity provider to log in with
    #[arg(long, env = "FERRY_UPSTREAM_IDENTITY_PROVIDER_NAME")]
    pub upstream_identity_provider_name: Option<String>,

    /// Upstream identity provider type (oidc, ldap, activedirectory)
    #[arg(long, env = "FERRY_UPSTREAM_IDENTITY_PROVIDER_TYPE", default_value = "oidc")]
    pub upstream_identity_provider_type: String,
}

/// Parts of a login that do not come from flags
pub struct LoginContext {
    /// Command-line arguments after the program name; part of the credential cache key
    pub argv: Vec<String>,
    /// Target cluster from `KUBERNETES_EXEC_INFO`; part of the credential cache key
    pub cluster: Option<Value>,
    /// Shows the authorization URL
    pub presenter: Presenter,
    /// Username and password for LDAP-style upstreams
    pub credentials: Arc<dyn CredentialSource>,
    /// Aborts the login
    pub cancel: CancellationToken,
}

impl LoginContext {
    /// Context of the running process
    pub fn from_env(args: &OidcLoginArgs, cancel: CancellationToken) -> Self {
        Self {
            argv: std::env::args().skip(1).collect(),
            cluster: cluster_info_from_env(),
            presenter: if args.skip_browser {
                print_presenter()
            } else {
                browser_presenter()
            },
            credentials: Arc::new(PromptCredentials),
            cancel,
        }
    }
}

#[derive(Serialize)]
struct CredentialCacheKey {
    args: Vec<String>,
    cluster: Option<Value>,
}

/// Run the login command, printing the credential as JSON on stdout
pub async fn run(args: LoginArgs, cancel: CancellationToken) -> Result<()> {
    match args.command {
        LoginCommand::Oidc(args) => {
            let context = LoginContext::from_env(&args, cancel);
            let credential = login(&args, context).await?;

            let mut stdout = std::io::stdout().lock();
            serde_json::to_writer(&mut stdout, &credential)?;
            writeln!(stdout)?;
            Ok(())
        }
    }
}

/// Produce a cluster credential
///
/// All flags are validated before any network call.
pub async fn login(args: &OidcLoginArgs, context: LoginContext) -> Result<ExecCredential> {
    let upstream_type: UpstreamProviderType = args
        .upstream_identity_provider_type
        .parse()
        .map_err(Error::validation)?;
    let exchange = exchange_client(args)?;
    let http = upstream_http_client(args)?;

    let credential_cache = (!args.credential_cache.is_empty()).then(|| {
        Arc::new(
            CredentialCache::new(&args.credential_cache)
                .with_error_reporter(debug_reporter())
                .with_cancellation(context.cancel.clone()),
        )
    });
    let cache_key = Arc::new(CredentialCacheKey {
        args: context.argv.clone(),
        cluster: context.cluster.clone(),
    });
    if let Some(cache) = &credential_cache {
        let (cache, key) = (cache.clone(), cache_key.clone());
        if let Some(cached) = run_blocking(&context.cancel, move || cache.get(&*key)).await? {
            debug!("Using cached cluster credential");
            return Ok(cached);
        }
    }

    let sessions = FileSessionCache::new(&args.session_cache)
        .with_error_reporter(if args.debug_session_cache {
            warn_reporter()
        } else {
            debug_reporter()
        })
        .with_cancellation(context.cancel.clone());
    let config = LoginConfig {
        issuer: args.issuer.clone(),
        client_id: args.client_id.clone(),
        scopes: args.scopes.clone(),
        listen_port: args.listen_port,
        callback_timeout: DEFAULT_CALLBACK_TIMEOUT,
        request_audience: args.request_audience.clone(),
        upstream_provider_name: args.upstream_identity_provider_name.clone(),
        upstream_provider_type: upstream_type,
    };

    debug!(issuer = %config.issuer, client_id = %config.client_id, "Performing OIDC login");
    let handler = LoginHandler::new(config, http, Arc::new(sessions))
        .with_presenter(context.presenter.clone())
        .with_credentials(context.credentials.clone())
        .with_cancellation(context.cancel.clone());
    let token = handler.login().await?;

    let credential = match exchange {
        Some(client) => {
            debug!(
                endpoint = %client.url(),
                authenticator_type = %args.exchange_authenticator_type,
                authenticator_name = %args.exchange_authenticator_name,
                "Exchanging token for cluster credential"
            );
            let id_token = token
                .id_token
                .as_ref()
                .ok_or_else(|| LoginError::InvalidIdToken("login produced no ID token".into()))?;
            let credential = tokio::select! {
                biased;
                _ = context.cancel.cancelled() => return Err(LoginError::Cancelled.into()),
                result = client.exchange_token(&id_token.token) => result?,
            };
            debug!("Successfully exchanged token for cluster credential");
            credential
        }
        None => {
            debug!("No exchange configured, skipping token credential exchange");
            ExecCredential::from_id_token(&token)
                .ok_or_else(|| LoginError::InvalidIdToken("login produced no ID token".into()))?
        }
    };

    if let Some(cache) = credential_cache {
        let stored = credential.clone();
        run_blocking(&context.cancel, move || cache.put(&*cache_key, &stored)).await?;
    }
    Ok(credential)
}

fn exchange_client(args: &OidcLoginArgs) -> Result<Option<ExchangeClient>> {
    if !args.enable_exchange {
        return Ok(None);
    }
    let config = ExchangeConfig {
        endpoint: args.exchange_endpoint.clone(),
        ca_bundle_data: args.exchange_ca_bundle_data.clone(),
        authenticator_type: args.exchange_authenticator_type.clone(),
        authenticator_name: args.exchange_authenticator_name.clone(),
        api_group_suffix: args.exchange_api_group_suffix.clone(),
    };
    ExchangeClient::new(&config, DEFAULT_EXCHANGE_TIMEOUT)
        .map(Some)
        .map_err(|e| Error::validation(format!("invalid exchange parameters: {}", e)))
}

fn upstream_http_client(args: &OidcLoginArgs) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder().timeout(DEFAULT_HTTP_TIMEOUT);

    for path in &args.ca_bundles {
        let certs = std::fs::read(path)
            .map_err(|e| e.to_string())
            .and_then(|pem| parse_bundle(&pem))
            .map_err(|e| Error::validation(format!("could not read --ca-bundle: {}", e)))?;
        for cert in certs {
            builder = builder.add_root_certificate(cert);
        }
    }
    for data in &args.ca_bundle_data {
        let certs = STANDARD
            .decode(data)
            .map_err(|e| e.to_string())
            .and_then(|pem| parse_bundle(&pem))
            .map_err(|e| Error::validation(format!("could not read --ca-bundle-data: {}", e)))?;
        for cert in certs {
            builder = builder.add_root_certificate(cert);
        }
    }

    builder
        .build()
        .map_err(|e| Error::validation(format!("could not build HTTP client: {}", e)))
}

fn parse_bundle(pem: &[u8]) -> std::result::Result<Vec<reqwest::Certificate>, String> {
    let certs = reqwest::Certificate::from_pem_bundle(pem).map_err(|e| e.to_string())?;
    if certs.is_empty() {
        return Err("no certificates found".into());
    }
    Ok(certs)
}
