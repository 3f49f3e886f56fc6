//! Test helpers: an ES256 token signer and a local issuer that serves
//! discovery and JWKS documents for it.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::routing::get;
use axum::{Json, Router};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use openssl::bn::{BigNum, BigNumContext};
use openssl::ec::{EcGroup, EcKey};
use openssl::nid::Nid;
use openssl::pkey::PKey;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

/// Signs JWTs with a fresh P-256 key
pub struct TestSigner {
    kid: String,
    encoding_key: EncodingKey,
    jwk: Value,
}

impl TestSigner {
    /// Generate a signer whose tokens carry `kid`
    pub fn new(kid: impl Into<String>) -> Self {
        let kid = kid.into();
        let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).expect("P-256 group");
        let ec_key = EcKey::generate(&group).expect("generate EC key");

        let mut ctx = BigNumContext::new().expect("bn context");
        let mut x = BigNum::new().expect("bn");
        let mut y = BigNum::new().expect("bn");
        ec_key
            .public_key()
            .affine_coordinates_gfp(&group, &mut x, &mut y, &mut ctx)
            .expect("affine coordinates");

        let jwk = json!({
            "kty": "EC",
            "crv": "P-256",
            "use": "sig",
            "alg": "ES256",
            "kid": kid,
            "x": URL_SAFE_NO_PAD.encode(x.to_vec_padded(32).expect("pad x")),
            "y": URL_SAFE_NO_PAD.encode(y.to_vec_padded(32).expect("pad y")),
        });

        let pkey = PKey::from_ec_key(ec_key).expect("pkey");
        let pem = pkey.private_key_to_pem_pkcs8().expect("pkcs8 pem");
        let encoding_key = EncodingKey::from_ec_pem(&pem).expect("encoding key");

        Self {
            kid,
            encoding_key,
            jwk,
        }
    }

    /// Key id placed in token headers
    pub fn kid(&self) -> &str {
        &self.kid
    }

    /// Sign `claims` as an ES256 JWT
    pub fn sign(&self, claims: &Value) -> String {
        let mut header = Header::new(Algorithm::ES256);
        header.kid = Some(self.kid.clone());
        encode(&header, claims, &self.encoding_key).expect("sign token")
    }

    /// Public key as a JWK
    pub fn jwk(&self) -> Value {
        self.jwk.clone()
    }

    /// JWKS document containing only this signer's key
    pub fn jwks(&self) -> Value {
        json!({ "keys": [self.jwk()] })
    }
}

/// A running local issuer
pub struct TestIssuer {
    /// Issuer URL, `http://127.0.0.1:<port>`
    pub issuer: String,
    jwks: Arc<RwLock<Value>>,
    jwks_requests: Arc<AtomicUsize>,
    handle: JoinHandle<()>,
}

impl TestIssuer {
    /// Replace the served key set
    pub async fn set_jwks(&self, jwks: Value) {
        *self.jwks.write().await = jwks;
    }

    /// How many times the key set has been fetched
    pub fn jwks_requests(&self) -> usize {
        self.jwks_requests.load(Ordering::SeqCst)
    }

    /// URL of an endpoint under the issuer
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.issuer, path)
    }
}

impl Drop for TestIssuer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Serve discovery and JWKS for `signer` on an ephemeral port
pub async fn serve_issuer(signer: &TestSigner) -> TestIssuer {
    serve_issuer_with(signer, Router::new()).await
}

/// Serve discovery and JWKS plus extra routes (e.g. `/authorize`, `/token`)
///
/// The discovery document advertises `/authorize` and `/token` under the
/// issuer whether or not `extra` serves them.
pub async fn serve_issuer_with(signer: &TestSigner, extra: Router) -> TestIssuer {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let issuer = format!("http://{}", addr);

    let discovery = json!({
        "issuer": issuer,
        "jwks_uri": format!("{}/jwks", issuer),
        "authorization_endpoint": format!("{}/authorize", issuer),
        "token_endpoint": format!("{}/token", issuer),
    });
    let jwks = Arc::new(RwLock::new(signer.jwks()));
    let jwks_requests = Arc::new(AtomicUsize::new(0));

    let served_jwks = jwks.clone();
    let counter = jwks_requests.clone();
    let app = Router::new()
        .route(
            "/.well-known/openid-configuration",
            get(move || {
                let discovery = discovery.clone();
                async move { Json(discovery) }
            }),
        )
        .route(
            "/jwks",
            get(move || {
                let jwks = served_jwks.clone();
                counter.fetch_add(1, Ordering::SeqCst);
                async move { Json(jwks.read().await.clone()) }
            }),
        )
        .merge(extra);

    let handle = tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    TestIssuer {
        issuer,
        jwks,
        jwks_requests,
        handle,
    }
}
