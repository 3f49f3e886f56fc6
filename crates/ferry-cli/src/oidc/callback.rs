//! Loopback listener that receives the authorization code redirect

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::Html;
use axum::routing::get;
use axum::Router;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::LoginError;

/// Path the provider redirects to
pub const CALLBACK_PATH: &str = "/callback";

const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

const SUCCESS_PAGE: &str =
    "<!DOCTYPE html><html><body><p>Login complete. You may close this window.</p></body></html>";
const FAILURE_PAGE: &str =
    "<!DOCTYPE html><html><body><p>Login failed. Check the terminal for details.</p></body></html>";
const FORBIDDEN_PAGE: &str =
    "<!DOCTYPE html><html><body><p>This login link is not the one in progress.</p></body></html>";
const CONFLICT_PAGE: &str =
    "<!DOCTYPE html><html><body><p>This login has already completed.</p></body></html>";

#[derive(Debug, Deserialize)]
struct CallbackParams {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

type Outcome = Result<String, LoginError>;

struct CallbackState {
    expected_state: String,
    // Taken by the first valid callback
    sender: Mutex<Option<oneshot::Sender<Outcome>>>,
}

async fn callback_handler(
    State(state): State<Arc<CallbackState>>,
    Query(params): Query<CallbackParams>,
) -> (StatusCode, Html<&'static str>) {
    if params.state.as_deref() != Some(state.expected_state.as_str()) {
        warn!("Ignoring callback with unexpected state");
        return (StatusCode::FORBIDDEN, Html(FORBIDDEN_PAGE));
    }

    let Some(sender) = state.sender.lock().take() else {
        warn!("Ignoring repeated callback for a completed login");
        return (StatusCode::CONFLICT, Html(CONFLICT_PAGE));
    };

    let (outcome, response) = match (params.error, params.code) {
        (Some(error), _) => (
            Err(LoginError::Upstream {
                error,
                description: params.error_description.unwrap_or_default(),
            }),
            (StatusCode::BAD_REQUEST, Html(FAILURE_PAGE)),
        ),
        (None, Some(code)) if !code.is_empty() => (Ok(code), (StatusCode::OK, Html(SUCCESS_PAGE))),
        (None, _) => (
            Err(LoginError::Callback("callback has no authorization code".into())),
            (StatusCode::BAD_REQUEST, Html(FAILURE_PAGE)),
        ),
    };

    // The waiter may already have given up
    let _ = sender.send(outcome);
    response
}

/// Local HTTP server bound to `127.0.0.1` for the duration of one login attempt
///
/// Call [`shutdown`](Self::shutdown) when done; dropping without it aborts the
/// server task.
pub struct CallbackListener {
    addr: SocketAddr,
    receiver: Option<oneshot::Receiver<Outcome>>,
    stop: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl CallbackListener {
    /// Bind `127.0.0.1:port` (0 picks a free port) and start serving
    pub async fn bind(port: u16, expected_state: impl Into<String>) -> Result<Self, LoginError> {
        let listener = tokio::net::TcpListener::bind((Ipv4Addr::LOCALHOST, port))
            .await
            .map_err(|e| LoginError::Listener(format!("could not bind 127.0.0.1:{}: {}", port, e)))?;
        let addr = listener
            .local_addr()
            .map_err(|e| LoginError::Listener(e.to_string()))?;

        let (sender, receiver) = oneshot::channel();
        let state = Arc::new(CallbackState {
            expected_state: expected_state.into(),
            sender: Mutex::new(Some(sender)),
        });
        let router = Router::new()
            .route(CALLBACK_PATH, get(callback_handler))
            .with_state(state);

        let stop = CancellationToken::new();
        let stopped = stop.clone();
        let task = tokio::spawn(async move {
            let serve = axum::serve(listener, router)
                .with_graceful_shutdown(async move { stopped.cancelled().await });
            if let Err(e) = serve.await {
                debug!(error = %e, "Callback listener stopped with error");
            }
        });

        debug!(addr = %addr, "Callback listener started");
        Ok(Self {
            addr,
            receiver: Some(receiver),
            stop,
            task: Some(task),
        })
    }

    /// Bound address
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// `http://127.0.0.1:<port>/callback`
    pub fn redirect_uri(&self) -> String {
        format!("http://{}{}", self.addr, CALLBACK_PATH)
    }

    /// Wait for the first valid callback, the deadline, or cancellation
    ///
    /// Returns the authorization code. Can only be called once.
    pub async fn wait(&mut self, timeout: Duration, cancel: &CancellationToken) -> Result<String, LoginError> {
        let receiver = self
            .receiver
            .take()
            .ok_or_else(|| LoginError::Callback("callback already consumed".into()))?;

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(LoginError::Cancelled),
            received = tokio::time::timeout(timeout, receiver) => match received {
                Err(_) => Err(LoginError::Timeout),
                Ok(Err(_)) => Err(LoginError::Callback("callback listener stopped".into())),
                Ok(Ok(outcome)) => outcome,
            },
        }
    }

    /// Stop serving and wait for the server task to finish
    pub async fn shutdown(mut self) {
        self.stop.cancel();
        if let Some(mut task) = self.task.take() {
            // Open keep-alive connections would otherwise hold graceful shutdown
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await.is_err() {
                task.abort();
                let _ = task.await;
            }
        }
        debug!(addr = %self.addr, "Callback listener stopped");
    }
}

impl Drop for CallbackListener {
    fn drop(&mut self) {
        self.stop.cancel();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn get_status(url: &str) -> u16 {
        reqwest::get(url).await.unwrap().status().as_u16()
    }

    #[tokio::test]
    async fn first_valid_callback_wins() {
        let mut listener = CallbackListener::bind(0, "expected").await.unwrap();
        let base = listener.redirect_uri();

        assert_eq!(get_status(&format!("{base}?code=abc&state=expected")).await, 200);
        assert_eq!(get_status(&format!("{base}?code=def&state=expected")).await, 409);

        let code = listener
            .wait(Duration::from_secs(5), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(code, "abc");
        listener.shutdown().await;
    }

    #[tokio::test]
    async fn stale_state_is_forbidden_and_wait_continues() {
        let mut listener = CallbackListener::bind(0, "current").await.unwrap();
        let base = listener.redirect_uri();

        assert_eq!(get_status(&format!("{base}?code=abc&state=previous")).await, 403);
        assert_eq!(get_status(&format!("{base}?code=abc")).await, 403);
        assert_eq!(get_status(&format!("{base}?code=xyz&state=current")).await, 200);

        let code = listener
            .wait(Duration::from_secs(5), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(code, "xyz");
        listener.shutdown().await;
    }

    #[tokio::test]
    async fn upstream_error_fails_login() {
        let mut listener = CallbackListener::bind(0, "s").await.unwrap();
        let base = listener.redirect_uri();

        let url = format!("{base}?error=access_denied&error_description=nope&state=s");
        assert_eq!(get_status(&url).await, 400);

        let err = listener
            .wait(Duration::from_secs(5), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LoginError::Upstream { ref error, ref description } if error == "access_denied" && description == "nope"
        ));
        listener.shutdown().await;
    }

    #[tokio::test]
    async fn times_out_without_callback() {
        let mut listener = CallbackListener::bind(0, "s").await.unwrap();
        let err = listener
            .wait(Duration::from_millis(50), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, LoginError::Timeout));
        listener.shutdown().await;
    }

    #[tokio::test]
    async fn cancellation_beats_timeout_and_frees_port() {
        let mut listener = CallbackListener::bind(0, "s").await.unwrap();
        let addr = listener.local_addr();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = listener
            .wait(Duration::from_millis(0), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, LoginError::Cancelled));

        listener.shutdown().await;
        let rebound = CallbackListener::bind(addr.port(), "s").await.unwrap();
        rebound.shutdown().await;
    }
}
