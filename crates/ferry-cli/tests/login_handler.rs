//! Login handler against an in-process provider and real cache files

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::{FakeIdp, CLIENT_ID};
use ferry_cli::oidc::{
    LoginConfig, LoginError, LoginHandler, Presenter, MIN_ID_TOKEN_VALIDITY,
};
use ferry_cli::cache::CacheError;
use ferry_cli::session::{FileSessionCache, SessionCache};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

fn config(idp: &FakeIdp) -> LoginConfig {
    let mut config = LoginConfig::new(idp.url(), CLIENT_ID);
    config.callback_timeout = Duration::from_secs(10);
    config
}

fn query_param(url: &url::Url, name: &str) -> String {
    url.query_pairs()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.into_owned())
        .unwrap()
}

#[tokio::test]
async fn every_attempt_gets_fresh_state_and_pkce() {
    let idp = FakeIdp::start().await;
    let dir = tempfile::tempdir().unwrap();
    let (presenter, seen) = idp.browser(None);

    // Separate cache files so the second login cannot reuse the first session
    for name in ["first.yaml", "second.yaml"] {
        let sessions = Arc::new(FileSessionCache::new(dir.path().join(name)));
        let handler = LoginHandler::new(config(&idp), reqwest::Client::new(), sessions)
            .with_presenter(presenter.clone());
        handler.login().await.unwrap();
    }

    let seen = seen.lock();
    assert_eq!(seen.len(), 2);
    for param in ["state", "nonce", "code_challenge"] {
        assert_ne!(query_param(&seen[0], param), query_param(&seen[1], param));
    }
    assert_eq!(idp.grants(), vec!["authorization_code", "authorization_code"]);
}

#[tokio::test]
async fn stale_state_callback_is_rejected_and_login_continues() {
    let idp = FakeIdp::start().await;
    let dir = tempfile::tempdir().unwrap();
    let (presenter, _) = idp.browser(Some("state-from-an-earlier-attempt".into()));

    let sessions = Arc::new(FileSessionCache::new(dir.path().join("sessions.yaml")));
    let handler = LoginHandler::new(config(&idp), reqwest::Client::new(), sessions)
        .with_presenter(presenter);
    let token = handler.login().await.unwrap();

    assert_eq!(token.refresh_token.unwrap().token, "refresh-1");
    // The forged code was never redeemed
    assert_eq!(idp.grants(), vec!["authorization_code"]);
}

#[tokio::test]
async fn expired_session_is_refreshed_once_without_browser() {
    let idp = FakeIdp::start().await;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sessions.yaml");
    let config = config(&idp);

    let sessions = Arc::new(FileSessionCache::new(&path));
    sessions.put_token(&config.session_key(), idp.token(60, Some("refresh-0")));

    let presenter: Presenter = Arc::new(|url: &str| -> Result<(), LoginError> {
        panic!("browser opened for {}", url)
    });
    let handler = LoginHandler::new(config.clone(), reqwest::Client::new(), sessions)
        .with_presenter(presenter);
    let token = handler.login().await.unwrap();

    assert_eq!(idp.grants(), vec!["refresh_token"]);
    assert!(token.id_token_valid_for(MIN_ID_TOKEN_VALIDITY, Utc::now()));

    let stored = FileSessionCache::new(&path)
        .get_token(&config.session_key())
        .unwrap();
    assert_eq!(stored.refresh_token.unwrap().token, "refresh-2");
    assert_eq!(stored.id_token.unwrap().token, token.id_token.unwrap().token);
}

#[tokio::test]
async fn cancelled_login_frees_port_and_is_not_a_timeout() {
    let idp = FakeIdp::start().await;
    let dir = tempfile::tempdir().unwrap();

    let port = {
        let socket = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        socket.local_addr().unwrap().port()
    };
    let mut config = config(&idp);
    config.listen_port = port;

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let presenter: Presenter = Arc::new(move |_: &str| -> Result<(), LoginError> {
        trigger.cancel();
        Ok(())
    });

    let sessions = Arc::new(FileSessionCache::new(dir.path().join("sessions.yaml")));
    let handler = LoginHandler::new(config, reqwest::Client::new(), sessions)
        .with_presenter(presenter)
        .with_cancellation(cancel);

    let err = handler.login().await.unwrap_err();
    assert!(matches!(err, LoginError::Cancelled), "{err}");

    // The listener is gone once login returns
    std::net::TcpListener::bind(("127.0.0.1", port)).unwrap();
}

#[tokio::test]
async fn cancellation_interrupts_wait_for_session_lock() {
    let idp = FakeIdp::start().await;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sessions.yaml");

    // Another process is in the middle of a cache transaction
    let held = std::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(dir.path().join("sessions.yaml.lock"))
        .unwrap();
    fs2::FileExt::lock_exclusive(&held).unwrap();

    let cancel = CancellationToken::new();
    let reported = Arc::new(Mutex::new(Vec::<String>::new()));
    let sink = reported.clone();
    let sessions = FileSessionCache::new(&path)
        .with_error_reporter(Arc::new(move |e: &CacheError| sink.lock().push(e.to_string())))
        .with_cancellation(cancel.clone());

    let presenter: Presenter = Arc::new(|url: &str| -> Result<(), LoginError> {
        panic!("browser opened for {}", url)
    });
    let handler = LoginHandler::new(config(&idp), reqwest::Client::new(), Arc::new(sessions))
        .with_presenter(presenter)
        .with_cancellation(cancel.clone());

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });

    let result = tokio::time::timeout(Duration::from_secs(2), handler.login())
        .await
        .expect("login kept waiting for the lock after cancellation");
    assert!(matches!(result, Err(LoginError::Cancelled)));
    assert!(idp.grants().is_empty());

    // The abandoned lock wait gives up too instead of running out its timeout
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while reported.lock().is_empty() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let reported = reported.lock();
    assert!(reported.iter().any(|e| e.contains("cancelled")), "{:?}", *reported);

    fs2::FileExt::unlock(&held).unwrap();
}
