//! Upstream OIDC login
//!
//! [`LoginHandler`] turns a [`LoginConfig`] into a verified [`Token`]:
//!
//! 1. A cached session whose ID token is still fresh is returned as is.
//! 2. A stale session with a refresh token is refreshed once. Any refresh
//!    failure falls through to a full login.
//! 3. A full login is either the browser authorization code flow with PKCE,
//!    or, for LDAP-style upstreams, a direct username/password grant.
//!
//! The result is stored in the session cache. When a request audience is
//! configured, the token is then exchanged for one scoped to that audience;
//! the exchanged token is returned but not cached.

pub mod callback;
pub mod pkce;
mod types;
mod upstream;

use std::fmt;
use std::future::Future;
use std::io::{BufRead, Write};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use crate::session::{SessionCache, SessionKey};
use callback::{CallbackListener, CALLBACK_PATH};
use pkce::AttemptSecrets;
use upstream::Upstream;

pub use types::{AccessToken, IdToken, RefreshToken, Token};

/// A cached ID token must outlive this to be used without a refresh
pub const MIN_ID_TOKEN_VALIDITY: Duration = Duration::from_secs(10 * 60);

/// How long to wait for the browser to come back
pub const DEFAULT_CALLBACK_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Timeout for each call to the upstream provider
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Scopes requested when none are configured
pub const DEFAULT_SCOPES: [&str; 3] = ["offline_access", "openid", "ferry:request-audience"];

/// Username read by [`PromptCredentials`] before prompting
pub const USERNAME_ENV: &str = "FERRY_USERNAME";
/// Password read by [`PromptCredentials`] before prompting
pub const PASSWORD_ENV: &str = "FERRY_PASSWORD";

/// Login failures
#[derive(Debug, thiserror::Error)]
pub enum LoginError {
    /// Provider metadata could not be fetched or is unusable
    #[error("could not perform OIDC discovery: {0}")]
    Discovery(String),

    /// The provider could not be reached or answered with garbage
    #[error("could not reach identity provider: {0}")]
    Transport(String),

    /// The provider answered with an OAuth2 error
    #[error("identity provider rejected the request: {error}: {description}")]
    Upstream {
        /// OAuth2 error code
        error: String,
        /// Human-readable description, possibly empty
        description: String,
    },

    /// ID token failed verification or is missing
    #[error("invalid ID token: {0}")]
    InvalidIdToken(String),

    /// The browser callback was unusable
    #[error("invalid callback: {0}")]
    Callback(String),

    /// No callback arrived in time
    #[error("timed out waiting for login callback")]
    Timeout,

    /// The login was cancelled by the caller
    #[error("login cancelled")]
    Cancelled,

    /// Username or password could not be obtained
    #[error("could not read credentials: {0}")]
    Credentials(String),

    /// The local callback listener could not be started
    #[error("could not start callback listener: {0}")]
    Listener(String),

    /// Local failure such as the RNG or a panicked task
    #[error("internal error: {0}")]
    Internal(String),
}

/// Kind of identity provider behind the issuer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpstreamProviderType {
    /// Browser-based login
    #[default]
    Oidc,
    /// Direct username/password login
    Ldap,
    /// Direct username/password login
    ActiveDirectory,
}

impl UpstreamProviderType {
    /// Value used on the command line and in the authorization request
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Oidc => "oidc",
            Self::Ldap => "ldap",
            Self::ActiveDirectory => "activedirectory",
        }
    }

    /// True if logins go through the password grant instead of a browser
    pub fn uses_direct_credentials(self) -> bool {
        matches!(self, Self::Ldap | Self::ActiveDirectory)
    }
}

impl FromStr for UpstreamProviderType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "oidc" => Ok(Self::Oidc),
            "ldap" => Ok(Self::Ldap),
            "activedirectory" => Ok(Self::ActiveDirectory),
            other => Err(format!(
                "--upstream-identity-provider-type value not recognized: {} (supported values: oidc, ldap, activedirectory)",
                other
            )),
        }
    }
}

impl fmt::Display for UpstreamProviderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shows the authorization URL to the user
pub type Presenter = Arc<dyn Fn(&str) -> Result<(), LoginError> + Send + Sync>;

/// Open the URL in the default browser, falling back to printing it
pub fn browser_presenter() -> Presenter {
    Arc::new(|url: &str| -> Result<(), LoginError> {
        if let Err(e) = webbrowser::open(url) {
            warn!(error = %e, "Could not open browser");
            eprintln!("Please log in: {}", url);
        }
        Ok(())
    })
}

/// Print the URL to stderr
pub fn print_presenter() -> Presenter {
    Arc::new(|url: &str| -> Result<(), LoginError> {
        eprintln!("Please log in: {}", url);
        Ok(())
    })
}

/// Supplies a username and password for direct-credential logins
#[cfg_attr(test, automock)]
pub trait CredentialSource: Send + Sync {
    /// Returns `(username, password)`; may block on the terminal
    fn credentials(&self) -> Result<(String, String), LoginError>;
}

/// Reads `FERRY_USERNAME`/`FERRY_PASSWORD`, prompting on the terminal for
/// whichever is unset
#[derive(Debug, Default, Clone, Copy)]
pub struct PromptCredentials;

impl CredentialSource for PromptCredentials {
    fn credentials(&self) -> Result<(String, String), LoginError> {
        let username = match std::env::var(USERNAME_ENV) {
            Ok(username) => username,
            Err(_) => prompt_username()?,
        };
        if username.is_empty() {
            return Err(LoginError::Credentials("username must not be empty".into()));
        }

        let password = match std::env::var(PASSWORD_ENV) {
            Ok(password) => password,
            Err(_) => rpassword::prompt_password("Password: ")
                .map_err(|e| LoginError::Credentials(e.to_string()))?,
        };
        Ok((username, password))
    }
}

fn prompt_username() -> Result<String, LoginError> {
    let mut stderr = std::io::stderr();
    write!(stderr, "Username: ")
        .and_then(|_| stderr.flush())
        .map_err(|e| LoginError::Credentials(e.to_string()))?;

    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .map_err(|e| LoginError::Credentials(e.to_string()))?;
    Ok(line.trim().to_string())
}

/// What to log in to and how
#[derive(Debug, Clone)]
pub struct LoginConfig {
    /// Issuer URL
    pub issuer: String,
    /// OAuth2 client ID
    pub client_id: String,
    /// Scopes to request
    pub scopes: Vec<String>,
    /// Callback listener port; 0 picks a free one
    pub listen_port: u16,
    /// Give up waiting for the browser after this long
    pub callback_timeout: Duration,
    /// Exchange the token for one with this audience
    pub request_audience: Option<String>,
    /// Upstream identity provider to ask the issuer for
    pub upstream_provider_name: Option<String>,
    /// Type of that provider; LDAP types skip the browser
    pub upstream_provider_type: UpstreamProviderType,
}

impl LoginConfig {
    /// Config with default scopes, a random port, and the browser flow
    pub fn new(issuer: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            issuer: issuer.into(),
            client_id: client_id.into(),
            scopes: DEFAULT_SCOPES.iter().map(|s| s.to_string()).collect(),
            listen_port: 0,
            callback_timeout: DEFAULT_CALLBACK_TIMEOUT,
            request_audience: None,
            upstream_provider_name: None,
            upstream_provider_type: UpstreamProviderType::Oidc,
        }
    }

    /// Session cache key for this configuration
    ///
    /// Uses the configured port rather than the bound one, so sessions made
    /// with a random port are still found on the next run.
    pub fn session_key(&self) -> SessionKey {
        let redirect_uri = format!("http://127.0.0.1:{}{}", self.listen_port, CALLBACK_PATH);
        let key = SessionKey::new(&self.issuer, &self.client_id, &self.scopes, redirect_uri);
        match &self.upstream_provider_name {
            Some(name) => key.with_upstream(name, self.upstream_provider_type.as_str()),
            None => key,
        }
    }
}

/// Runs one login
pub struct LoginHandler {
    config: LoginConfig,
    http: reqwest::Client,
    sessions: Arc<dyn SessionCache>,
    presenter: Presenter,
    credentials: Arc<dyn CredentialSource>,
    cancel: CancellationToken,
    upstream: OnceCell<Upstream>,
}

impl LoginHandler {
    /// Handler that opens a browser and prompts for LDAP credentials
    pub fn new(config: LoginConfig, http: reqwest::Client, sessions: Arc<dyn SessionCache>) -> Self {
        Self {
            config,
            http,
            sessions,
            presenter: browser_presenter(),
            credentials: Arc::new(PromptCredentials),
            cancel: CancellationToken::new(),
            upstream: OnceCell::new(),
        }
    }

    /// Replace how the authorization URL is shown
    pub fn with_presenter(mut self, presenter: Presenter) -> Self {
        self.presenter = presenter;
        self
    }

    /// Replace where LDAP credentials come from
    pub fn with_credentials(mut self, credentials: Arc<dyn CredentialSource>) -> Self {
        self.credentials = credentials;
        self
    }

    /// Abort the login when `cancel` fires
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Produce a token, reusing or refreshing a cached session when possible
    pub async fn login(&self) -> Result<Token, LoginError> {
        let key = self.config.session_key();

        let token = match self.cached_session(&key).await? {
            Some(cached) if cached.id_token_valid_for(MIN_ID_TOKEN_VALIDITY, Utc::now()) => {
                debug!("Found unexpired cached token");
                cached
            }
            Some(cached) => match self.try_refresh(&cached).await? {
                Some(refreshed) => {
                    self.store_session(&key, refreshed.clone()).await?;
                    refreshed
                }
                None => self.authenticate_and_cache(&key).await?,
            },
            None => self.authenticate_and_cache(&key).await?,
        };

        match &self.config.request_audience {
            Some(audience) => {
                debug!(audience = %audience, "Exchanging token for requested audience");
                let upstream = self.upstream().await?;
                self.cancellable(upstream.exchange_audience(&token, audience))
                    .await
            }
            None => Ok(token),
        }
    }

    /// `Ok(None)` means the refresh failed and a full login is needed
    async fn try_refresh(&self, cached: &Token) -> Result<Option<Token>, LoginError> {
        let Some(refresh_token) = &cached.refresh_token else {
            debug!("Cached token is stale and has no refresh token");
            return Ok(None);
        };

        debug!("Refreshing cached token");
        let refreshed = match self.upstream().await {
            Ok(upstream) => self.cancellable(upstream.refresh(refresh_token)).await,
            Err(e) => Err(e),
        };
        match refreshed {
            Ok(token) => Ok(Some(token)),
            Err(LoginError::Cancelled) => Err(LoginError::Cancelled),
            Err(e) => {
                debug!(error = %e, "Refresh failed, starting a new login");
                Ok(None)
            }
        }
    }

    async fn authenticate_and_cache(&self, key: &SessionKey) -> Result<Token, LoginError> {
        let upstream = self.upstream().await?;
        let token = if self.config.upstream_provider_type.uses_direct_credentials() {
            self.direct_login(upstream).await?
        } else {
            self.browser_login(upstream).await?
        };
        self.store_session(key, token.clone()).await?;
        Ok(token)
    }

    async fn cached_session(&self, key: &SessionKey) -> Result<Option<Token>, LoginError> {
        let (sessions, key) = (self.sessions.clone(), key.clone());
        run_blocking(&self.cancel, move || sessions.get_token(&key)).await
    }

    async fn store_session(&self, key: &SessionKey, token: Token) -> Result<(), LoginError> {
        let (sessions, key) = (self.sessions.clone(), key.clone());
        run_blocking(&self.cancel, move || sessions.put_token(&key, token)).await
    }

    async fn browser_login(&self, upstream: &Upstream) -> Result<Token, LoginError> {
        let secrets = AttemptSecrets::generate()?;
        let mut listener = CallbackListener::bind(self.config.listen_port, secrets.state.clone()).await?;
        let result = self.complete_browser_login(upstream, &mut listener, &secrets).await;
        listener.shutdown().await;
        result
    }

    async fn complete_browser_login(
        &self,
        upstream: &Upstream,
        listener: &mut CallbackListener,
        secrets: &AttemptSecrets,
    ) -> Result<Token, LoginError> {
        let redirect_uri = listener.redirect_uri();
        let url = upstream.authorization_url(&self.config, &redirect_uri, secrets);
        (self.presenter)(url.as_str())?;

        let code = listener.wait(self.config.callback_timeout, &self.cancel).await?;
        debug!("Received authorization code, redeeming");
        self.cancellable(upstream.redeem_code(&code, secrets, &redirect_uri))
            .await
    }

    async fn direct_login(&self, upstream: &Upstream) -> Result<Token, LoginError> {
        let source = self.credentials.clone();
        let (username, password) = run_blocking(&self.cancel, move || source.credentials()).await??;

        info!(username = %username, "Logging in with username and password");
        self.cancellable(upstream.password_grant(&username, &password, &self.config.scopes))
            .await
    }

    async fn upstream(&self) -> Result<&Upstream, LoginError> {
        self.upstream
            .get_or_try_init(|| self.cancellable(Upstream::discover(self.http.clone(), &self.config)))
            .await
    }

    async fn cancellable<T>(&self, fut: impl Future<Output = Result<T, LoginError>>) -> Result<T, LoginError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(LoginError::Cancelled),
            result = fut => result,
        }
    }
}

/// Run blocking work (cache files, terminal prompts) on the blocking pool
///
/// Returns [`LoginError::Cancelled`] as soon as `cancel` fires; the abandoned
/// work finishes in the background.
pub(crate) async fn run_blocking<T, F>(cancel: &CancellationToken, f: F) -> Result<T, LoginError>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let task = tokio::task::spawn_blocking(f);
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(LoginError::Cancelled),
        result = task => result.map_err(|e| LoginError::Internal(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use axum::{Form, Json, Router};
    use ferry_common::testing::{serve_issuer_with, TestIssuer, TestSigner};
    use parking_lot::Mutex;
    use serde_json::{json, Value};

    use super::*;
    use crate::session::MockSessionCache;

    const CLIENT_ID: &str = "ferry-cli";

    struct IdpState {
        signer: TestSigner,
        refresh_ok: bool,
        grants: Mutex<Vec<HashMap<String, String>>>,
        nonce: Mutex<Option<String>>,
    }

    /// In-process provider with a token endpoint for every grant the handler uses
    struct FakeIdp {
        state: Arc<IdpState>,
        issuer: TestIssuer,
    }

    impl FakeIdp {
        async fn start(refresh_ok: bool) -> Self {
            let state = Arc::new(IdpState {
                signer: TestSigner::new("idp-key"),
                refresh_ok,
                grants: Mutex::new(Vec::new()),
                nonce: Mutex::new(None),
            });
            let routes = Router::new()
                .route("/token", post(token_endpoint))
                .with_state(state.clone());
            let issuer = serve_issuer_with(&state.signer, routes).await;
            Self { state, issuer }
        }

        fn grants(&self) -> Vec<String> {
            self.state
                .grants
                .lock()
                .iter()
                .map(|form| form["grant_type"].clone())
                .collect()
        }

        fn config(&self) -> LoginConfig {
            LoginConfig::new(&self.issuer.issuer, CLIENT_ID)
        }

        fn token(&self, expires_in: i64, refresh: Option<&str>) -> Token {
            let exp = Utc::now().timestamp() + expires_in;
            let raw = self.state.signer.sign(&json!({
                "iss": self.issuer.issuer, "aud": CLIENT_ID, "sub": "alice", "exp": exp,
            }));
            Token {
                access_token: None,
                refresh_token: refresh.map(|token| RefreshToken { token: token.into() }),
                id_token: Some(IdToken {
                    token: raw,
                    expiry: chrono::DateTime::from_timestamp(exp, 0).unwrap(),
                    claims: Default::default(),
                }),
            }
        }
    }

    async fn token_endpoint(
        State(state): State<Arc<IdpState>>,
        headers: HeaderMap,
        Form(form): Form<HashMap<String, String>>,
    ) -> (StatusCode, Json<Value>) {
        state.grants.lock().push(form.clone());
        let host = headers.get("host").and_then(|h| h.to_str().ok()).unwrap_or_default();
        let issuer = format!("http://{}", host);
        let exp = Utc::now().timestamp() + 3600;
        let id_token = |aud: &str, nonce: Option<String>| {
            let mut claims = json!({"iss": issuer, "aud": aud, "sub": "alice", "exp": exp});
            if let Some(nonce) = nonce {
                claims["nonce"] = json!(nonce);
            }
            state.signer.sign(&claims)
        };
        let denied = |description: &str| {
            (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "invalid_grant", "error_description": description})),
            )
        };

        match form["grant_type"].as_str() {
            "authorization_code" => {
                let nonce = state.nonce.lock().clone();
                (
                    StatusCode::OK,
                    Json(json!({
                        "access_token": "access-1", "token_type": "Bearer", "expires_in": 3600,
                        "refresh_token": "refresh-1", "id_token": id_token(CLIENT_ID, nonce),
                    })),
                )
            }
            "refresh_token" if state.refresh_ok => (
                StatusCode::OK,
                Json(json!({
                    "access_token": "access-2", "token_type": "Bearer",
                    "id_token": id_token(CLIENT_ID, None),
                })),
            ),
            "refresh_token" => denied("refresh token expired"),
            "password" if form["username"] == "alice" && form["password"] == "secret" => (
                StatusCode::OK,
                Json(json!({
                    "access_token": "access-3", "token_type": "Bearer",
                    "refresh_token": "refresh-3", "id_token": id_token(CLIENT_ID, None),
                })),
            ),
            "password" => denied("bad credentials"),
            "urn:ietf:params:oauth:grant-type:token-exchange" => (
                StatusCode::OK,
                Json(json!({
                    "access_token": id_token(&form["audience"], None),
                    "token_type": "N_A",
                    "issued_token_type": "urn:ietf:params:oauth:token-type:jwt",
                })),
            ),
            _ => denied("unsupported grant"),
        }
    }

    fn never_present() -> Presenter {
        Arc::new(|url: &str| -> Result<(), LoginError> {
            panic!("unexpected browser presentation of {}", url)
        })
    }

    /// Presenter that plays the browser: records the nonce for the fake
    /// provider, then follows the redirect with a code and the right state
    fn browser(idp: &FakeIdp, presented: Arc<AtomicUsize>) -> Presenter {
        let state = idp.state.clone();
        Arc::new(move |url: &str| -> Result<(), LoginError> {
            presented.fetch_add(1, Ordering::SeqCst);
            let url = url::Url::parse(url).unwrap();
            let q: HashMap<String, String> = url.query_pairs().into_owned().collect();
            *state.nonce.lock() = Some(q["nonce"].clone());
            let callback = format!("{}?code=code-1&state={}", q["redirect_uri"], q["state"]);
            tokio::spawn(async move {
                let _ = reqwest::get(callback).await;
            });
            Ok(())
        })
    }

    #[tokio::test]
    async fn fresh_cached_token_needs_no_network() {
        let mut sessions = MockSessionCache::new();
        let cached = FakeIdp::start(true).await.token(3600, None);
        let returned = cached.clone();
        sessions
            .expect_get_token()
            .times(1)
            .returning(move |_| Some(returned.clone()));
        sessions.expect_put_token().never();

        // Nothing listens here; discovery would fail
        let config = LoginConfig::new("http://127.0.0.1:1", CLIENT_ID);
        let handler = LoginHandler::new(config, reqwest::Client::new(), Arc::new(sessions))
            .with_presenter(never_present());

        assert_eq!(handler.login().await.unwrap(), cached);
    }

    #[tokio::test]
    async fn stale_token_is_refreshed_once_without_browser() {
        let idp = FakeIdp::start(true).await;
        let stale = idp.token(60, Some("refresh-0"));

        let mut sessions = MockSessionCache::new();
        sessions
            .expect_get_token()
            .times(1)
            .returning(move |_| Some(stale.clone()));
        sessions
            .expect_put_token()
            .times(1)
            .withf(|_, token| {
                // The provider returned no new refresh token, so the old one is kept
                token.refresh_token.as_ref().map(|r| r.token.as_str()) == Some("refresh-0")
            })
            .return_const(());

        let handler = LoginHandler::new(idp.config(), reqwest::Client::new(), Arc::new(sessions))
            .with_presenter(never_present());
        let token = handler.login().await.unwrap();

        assert_eq!(idp.grants(), vec!["refresh_token"]);
        assert!(token.id_token_valid_for(MIN_ID_TOKEN_VALIDITY, Utc::now()));
        assert_eq!(token.access_token.unwrap().token, "access-2");
    }

    #[tokio::test]
    async fn failed_refresh_falls_back_to_browser_login() {
        let idp = FakeIdp::start(false).await;
        let stale = idp.token(-60, Some("refresh-0"));

        let mut sessions = MockSessionCache::new();
        sessions
            .expect_get_token()
            .returning(move |_| Some(stale.clone()));
        sessions.expect_put_token().times(1).return_const(());

        let presented = Arc::new(AtomicUsize::new(0));
        let handler = LoginHandler::new(idp.config(), reqwest::Client::new(), Arc::new(sessions))
            .with_presenter(browser(&idp, presented.clone()));
        let token = handler.login().await.unwrap();

        assert_eq!(idp.grants(), vec!["refresh_token", "authorization_code"]);
        assert_eq!(presented.load(Ordering::SeqCst), 1);
        assert_eq!(token.refresh_token.unwrap().token, "refresh-1");
    }

    #[tokio::test]
    async fn browser_login_redeems_code_with_verifier() {
        let idp = FakeIdp::start(true).await;
        let mut sessions = MockSessionCache::new();
        sessions.expect_get_token().returning(|_| None);
        sessions.expect_put_token().times(1).return_const(());

        let presented = Arc::new(AtomicUsize::new(0));
        let handler = LoginHandler::new(idp.config(), reqwest::Client::new(), Arc::new(sessions))
            .with_presenter(browser(&idp, presented));
        let token = handler.login().await.unwrap();
        assert_eq!(token.access_token.unwrap().token, "access-1");

        let grants = idp.state.grants.lock();
        let redeem = &grants[0];
        assert_eq!(redeem["code"], "code-1");
        assert_eq!(redeem["client_id"], CLIENT_ID);
        assert_eq!(redeem["code_verifier"].len(), 64);
        assert!(redeem["redirect_uri"].starts_with("http://127.0.0.1:"));
    }

    #[tokio::test]
    async fn nonce_mismatch_is_rejected() {
        let idp = FakeIdp::start(true).await;
        let mut sessions = MockSessionCache::new();
        sessions.expect_get_token().returning(|_| None);
        sessions.expect_put_token().never();

        let state = idp.state.clone();
        let presenter: Presenter = Arc::new(move |url: &str| -> Result<(), LoginError> {
            let url = url::Url::parse(url).unwrap();
            let q: HashMap<String, String> = url.query_pairs().into_owned().collect();
            *state.nonce.lock() = Some("some-other-nonce".into());
            let callback = format!("{}?code=code-1&state={}", q["redirect_uri"], q["state"]);
            tokio::spawn(async move {
                let _ = reqwest::get(callback).await;
            });
            Ok(())
        });

        let handler = LoginHandler::new(idp.config(), reqwest::Client::new(), Arc::new(sessions))
            .with_presenter(presenter);
        let err = handler.login().await.unwrap_err();
        assert!(matches!(err, LoginError::InvalidIdToken(_)), "{err}");
    }

    #[tokio::test]
    async fn ldap_upstream_uses_password_grant() {
        let idp = FakeIdp::start(true).await;
        let mut sessions = MockSessionCache::new();
        sessions.expect_get_token().returning(|_| None);
        sessions
            .expect_put_token()
            .times(1)
            .withf(|key, _| key.upstream_provider_type == "ldap" && key.upstream_provider_name == "corp")
            .return_const(());

        let mut credentials = MockCredentialSource::new();
        credentials
            .expect_credentials()
            .times(1)
            .returning(|| Ok(("alice".into(), "secret".into())));

        let mut config = idp.config();
        config.upstream_provider_name = Some("corp".into());
        config.upstream_provider_type = UpstreamProviderType::Ldap;

        let handler = LoginHandler::new(config, reqwest::Client::new(), Arc::new(sessions))
            .with_presenter(never_present())
            .with_credentials(Arc::new(credentials));
        let token = handler.login().await.unwrap();

        assert_eq!(idp.grants(), vec!["password"]);
        assert_eq!(token.refresh_token.unwrap().token, "refresh-3");
    }

    #[tokio::test]
    async fn wrong_password_reports_upstream_reason() {
        let idp = FakeIdp::start(true).await;
        let mut sessions = MockSessionCache::new();
        sessions.expect_get_token().returning(|_| None);
        sessions.expect_put_token().never();

        let mut credentials = MockCredentialSource::new();
        credentials
            .expect_credentials()
            .returning(|| Ok(("alice".into(), "wrong".into())));

        let mut config = idp.config();
        config.upstream_provider_type = UpstreamProviderType::ActiveDirectory;

        let handler = LoginHandler::new(config, reqwest::Client::new(), Arc::new(sessions))
            .with_credentials(Arc::new(credentials));
        let err = handler.login().await.unwrap_err();
        assert!(
            matches!(err, LoginError::Upstream { ref error, ref description } if error == "invalid_grant" && description == "bad credentials")
        );
    }

    #[tokio::test]
    async fn audience_exchange_is_not_cached() {
        let idp = FakeIdp::start(true).await;
        let cached = Token {
            access_token: Some(AccessToken {
                token: "access-0".into(),
                token_type: "Bearer".into(),
                expiry: None,
            }),
            ..idp.token(3600, None)
        };

        let mut sessions = MockSessionCache::new();
        sessions
            .expect_get_token()
            .returning(move |_| Some(cached.clone()));
        sessions.expect_put_token().never();

        let mut config = idp.config();
        config.request_audience = Some("cluster-a".into());
        let handler = LoginHandler::new(config, reqwest::Client::new(), Arc::new(sessions))
            .with_presenter(never_present());
        let token = handler.login().await.unwrap();

        let id_token = token.id_token.unwrap();
        assert_eq!(id_token.claims["aud"], "cluster-a");
        assert!(token.refresh_token.is_none());

        let grants = idp.state.grants.lock();
        assert_eq!(grants[0]["subject_token"], "access-0");
        assert_eq!(grants[0]["requested_token_type"], "urn:ietf:params:oauth:token-type:jwt");
    }

    #[tokio::test]
    async fn cancelled_before_callback() {
        let idp = FakeIdp::start(true).await;
        let mut sessions = MockSessionCache::new();
        sessions.expect_get_token().returning(|_| None);
        sessions.expect_put_token().never();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let presenter: Presenter = Arc::new(move |_: &str| -> Result<(), LoginError> {
            trigger.cancel();
            Ok(())
        });

        let handler = LoginHandler::new(idp.config(), reqwest::Client::new(), Arc::new(sessions))
            .with_presenter(presenter)
            .with_cancellation(cancel);
        assert!(matches!(handler.login().await, Err(LoginError::Cancelled)));
        assert!(idp.grants().is_empty());
    }

    #[test]
    fn upstream_type_parsing() {
        assert_eq!("ldap".parse::<UpstreamProviderType>(), Ok(UpstreamProviderType::Ldap));
        assert_eq!(
            "activedirectory".parse::<UpstreamProviderType>(),
            Ok(UpstreamProviderType::ActiveDirectory)
        );
        assert_eq!(
            "saml".parse::<UpstreamProviderType>().unwrap_err(),
            "--upstream-identity-provider-type value not recognized: saml (supported values: oidc, ldap, activedirectory)"
        );
    }

    #[test]
    fn session_key_uses_configured_port() {
        let mut config = LoginConfig::new("https://idp.example.com", CLIENT_ID);
        config.listen_port = 48095;
        let key = config.session_key();
        assert_eq!(key.redirect_uri, "http://127.0.0.1:48095/callback");
        assert_eq!(key.scopes, vec!["ferry:request-audience", "offline_access", "openid"]);
        assert!(key.upstream_provider_name.is_empty());
    }
}
