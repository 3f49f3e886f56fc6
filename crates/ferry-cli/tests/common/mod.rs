//! Fake upstream provider and browser shared by the integration tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Form, Json, Router};
use chrono::{DateTime, Utc};
use ferry_cli::oidc::{IdToken, LoginError, Presenter, RefreshToken, Token};
use ferry_common::testing::{serve_issuer_with, TestIssuer, TestSigner};
use parking_lot::Mutex;
use serde_json::{json, Value};
use url::Url;

pub const CLIENT_ID: &str = "ferry-cli";

pub struct IdpState {
    signer: TestSigner,
    nonce: Mutex<Option<String>>,
    grants: Mutex<Vec<HashMap<String, String>>>,
}

/// Issuer with discovery, JWKS, and a token endpoint for the
/// authorization code and refresh grants
pub struct FakeIdp {
    pub state: Arc<IdpState>,
    pub issuer: TestIssuer,
}

impl FakeIdp {
    pub async fn start() -> Self {
        let state = Arc::new(IdpState {
            signer: TestSigner::new("integration-key"),
            nonce: Mutex::new(None),
            grants: Mutex::new(Vec::new()),
        });
        let routes = Router::new()
            .route("/token", post(token_endpoint))
            .with_state(state.clone());
        let issuer = serve_issuer_with(&state.signer, routes).await;
        Self { state, issuer }
    }

    pub fn url(&self) -> String {
        self.issuer.issuer.clone()
    }

    /// `grant_type` of every token request so far
    pub fn grants(&self) -> Vec<String> {
        self.state
            .grants
            .lock()
            .iter()
            .map(|form| form["grant_type"].clone())
            .collect()
    }

    /// A signed token for alice expiring `expires_in` seconds from now
    pub fn token(&self, expires_in: i64, refresh: Option<&str>) -> Token {
        let exp = Utc::now().timestamp() + expires_in;
        Token {
            access_token: None,
            refresh_token: refresh.map(|token| RefreshToken {
                token: token.to_string(),
            }),
            id_token: Some(IdToken {
                token: self.state.signer.sign(&claims(&self.url(), exp, None)),
                expiry: DateTime::from_timestamp(exp, 0).unwrap(),
                claims: Default::default(),
            }),
        }
    }

    /// Presenter acting as the user's browser
    ///
    /// Records each authorization URL, tells the provider which nonce to put
    /// in the next ID token, and follows the redirect back to the listener.
    /// When `stale_state` is set, a redirect carrying that state is sent first.
    pub fn browser(&self, stale_state: Option<String>) -> (Presenter, Arc<Mutex<Vec<Url>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorded = seen.clone();
        let state = self.state.clone();

        let presenter: Presenter = Arc::new(move |raw: &str| -> Result<(), LoginError> {
            let url = Url::parse(raw).unwrap();
            let query: HashMap<String, String> = url.query_pairs().into_owned().collect();
            recorded.lock().push(url);
            *state.nonce.lock() = Some(query["nonce"].clone());

            let redirect_uri = query["redirect_uri"].clone();
            let good = format!("{}?code=code-1&state={}", redirect_uri, query["state"]);
            let stale = stale_state
                .as_ref()
                .map(|s| format!("{}?code=forged&state={}", redirect_uri, s));
            tokio::spawn(async move {
                if let Some(stale) = stale {
                    let status = reqwest::get(stale).await.unwrap().status();
                    assert_eq!(status, reqwest::StatusCode::FORBIDDEN);
                }
                let _ = reqwest::get(good).await;
            });
            Ok(())
        });
        (presenter, seen)
    }
}

fn claims(issuer: &str, exp: i64, nonce: Option<String>) -> Value {
    let mut claims = json!({
        "iss": issuer,
        "aud": CLIENT_ID,
        "sub": "alice-subject",
        "username": "alice",
        "groups": ["devs"],
        "iat": Utc::now().timestamp(),
        "exp": exp,
    });
    if let Some(nonce) = nonce {
        claims["nonce"] = json!(nonce);
    }
    claims
}

async fn token_endpoint(
    State(state): State<Arc<IdpState>>,
    headers: HeaderMap,
    Form(form): Form<HashMap<String, String>>,
) -> (StatusCode, Json<Value>) {
    state.grants.lock().push(form.clone());
    let host = headers
        .get("host")
        .and_then(|h| h.to_str().ok())
        .unwrap_or_default();
    let issuer = format!("http://{}", host);
    let exp = Utc::now().timestamp() + 3600;

    match form["grant_type"].as_str() {
        "authorization_code" if form["code"] == "code-1" => {
            let nonce = state.nonce.lock().clone();
            (
                StatusCode::OK,
                Json(json!({
                    "access_token": "access-1",
                    "token_type": "Bearer",
                    "expires_in": 3600,
                    "refresh_token": "refresh-1",
                    "id_token": state.signer.sign(&claims(&issuer, exp, nonce)),
                })),
            )
        }
        "refresh_token" if form["refresh_token"] == "refresh-0" => (
            StatusCode::OK,
            Json(json!({
                "access_token": "access-2",
                "token_type": "Bearer",
                "refresh_token": "refresh-2",
                "id_token": state.signer.sign(&claims(&issuer, exp, None)),
            })),
        ),
        _ => (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "invalid_grant"})),
        ),
    }
}
