//! Calls to the upstream OIDC provider
//!
//! Discovery, the authorization URL, and the token endpoint grants the login
//! handler needs: authorization code with PKCE, refresh, resource owner
//! password (for LDAP-style upstreams), and RFC 8693 token exchange.

use chrono::Utc;
use ferry_common::{discover, JwtError, JwtVerifier, ProviderMetadata};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;
use url::Url;

use super::pkce::{AttemptSecrets, CODE_CHALLENGE_METHOD};
use super::types::{AccessToken, IdToken, RefreshToken, Token};
use super::{LoginConfig, LoginError};

const GRANT_AUTHORIZATION_CODE: &str = "authorization_code";
const GRANT_REFRESH_TOKEN: &str = "refresh_token";
const GRANT_PASSWORD: &str = "password";
const GRANT_TOKEN_EXCHANGE: &str = "urn:ietf:params:oauth:grant-type:token-exchange";
const TOKEN_TYPE_ACCESS_TOKEN: &str = "urn:ietf:params:oauth:token-type:access_token";
const TOKEN_TYPE_JWT: &str = "urn:ietf:params:oauth:token-type:jwt";

/// Query parameters naming the upstream identity provider
const IDP_NAME_PARAM: &str = "ferry_idp_name";
const IDP_TYPE_PARAM: &str = "ferry_idp_type";

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    token_type: String,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    id_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OAuthErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// A discovered provider
pub(crate) struct Upstream {
    http: reqwest::Client,
    client_id: String,
    authorization_endpoint: Url,
    token_endpoint: Url,
    verifier: JwtVerifier,
}

impl Upstream {
    /// Fetch provider metadata and prepare a key-set verifier for its ID tokens
    pub(crate) async fn discover(http: reqwest::Client, config: &LoginConfig) -> Result<Self, LoginError> {
        let metadata = discover(&http, &config.issuer)
            .await
            .map_err(|e| LoginError::Discovery(e.to_string()))?;
        Self::from_metadata(http, &config.client_id, &metadata)
    }

    fn from_metadata(
        http: reqwest::Client,
        client_id: &str,
        metadata: &ProviderMetadata,
    ) -> Result<Self, LoginError> {
        let endpoint = |name: &str, value: &Option<String>| -> Result<Url, LoginError> {
            let raw = value
                .as_deref()
                .ok_or_else(|| LoginError::Discovery(format!("provider has no {}", name)))?;
            Url::parse(raw).map_err(|e| LoginError::Discovery(format!("invalid {} {:?}: {}", name, raw, e)))
        };

        Ok(Self {
            authorization_endpoint: endpoint("authorization_endpoint", &metadata.authorization_endpoint)?,
            token_endpoint: endpoint("token_endpoint", &metadata.token_endpoint)?,
            verifier: JwtVerifier::from_metadata(http.clone(), metadata),
            client_id: client_id.to_string(),
            http,
        })
    }

    /// Browser URL for one attempt
    pub(crate) fn authorization_url(
        &self,
        config: &LoginConfig,
        redirect_uri: &str,
        secrets: &AttemptSecrets,
    ) -> Url {
        let mut url = self.authorization_endpoint.clone();
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("response_type", "code")
                .append_pair("client_id", &self.client_id)
                .append_pair("redirect_uri", redirect_uri)
                .append_pair("scope", &config.scopes.join(" "))
                .append_pair("state", &secrets.state)
                .append_pair("nonce", &secrets.nonce)
                .append_pair("code_challenge", &secrets.code_challenge())
                .append_pair("code_challenge_method", CODE_CHALLENGE_METHOD);
            if let Some(name) = &config.upstream_provider_name {
                query
                    .append_pair(IDP_NAME_PARAM, name)
                    .append_pair(IDP_TYPE_PARAM, config.upstream_provider_type.as_str());
            }
        }
        url
    }

    /// Redeem an authorization code; the ID token must carry our nonce
    pub(crate) async fn redeem_code(
        &self,
        code: &str,
        secrets: &AttemptSecrets,
        redirect_uri: &str,
    ) -> Result<Token, LoginError> {
        let response = self
            .token_request(&[
                ("grant_type", GRANT_AUTHORIZATION_CODE),
                ("code", code),
                ("redirect_uri", redirect_uri),
                ("client_id", &self.client_id),
                ("code_verifier", &secrets.code_verifier),
            ])
            .await?;

        let token = self.token_from_response(response, None).await?;
        let nonce = token
            .id_token
            .as_ref()
            .and_then(|id| id.claims.get("nonce"))
            .and_then(Value::as_str);
        if nonce != Some(secrets.nonce.as_str()) {
            return Err(LoginError::InvalidIdToken("nonce does not match".into()));
        }
        Ok(token)
    }

    /// Use a refresh token; a response without a new one keeps the old one
    pub(crate) async fn refresh(&self, refresh_token: &RefreshToken) -> Result<Token, LoginError> {
        let response = self
            .token_request(&[
                ("grant_type", GRANT_REFRESH_TOKEN),
                ("refresh_token", &refresh_token.token),
                ("client_id", &self.client_id),
            ])
            .await?;
        self.token_from_response(response, Some(refresh_token)).await
    }

    /// Send username and password directly to the token endpoint
    pub(crate) async fn password_grant(
        &self,
        username: &str,
        password: &str,
        scopes: &[String],
    ) -> Result<Token, LoginError> {
        let scope = scopes.join(" ");
        let response = self
            .token_request(&[
                ("grant_type", GRANT_PASSWORD),
                ("username", username),
                ("password", password),
                ("scope", &scope),
                ("client_id", &self.client_id),
            ])
            .await?;
        self.token_from_response(response, None).await
    }

    /// RFC 8693: trade the access token for an ID token with a different audience
    pub(crate) async fn exchange_audience(&self, token: &Token, audience: &str) -> Result<Token, LoginError> {
        let access = token.access_token.as_ref().ok_or_else(|| {
            LoginError::InvalidIdToken("no access token to exchange for another audience".into())
        })?;

        let response = self
            .token_request(&[
                ("grant_type", GRANT_TOKEN_EXCHANGE),
                ("subject_token", &access.token),
                ("subject_token_type", TOKEN_TYPE_ACCESS_TOKEN),
                ("requested_token_type", TOKEN_TYPE_JWT),
                ("audience", audience),
                ("client_id", &self.client_id),
            ])
            .await?;

        // The exchanged JWT comes back in the access_token field
        let id_token = self.verify_id_token(&response.access_token, audience).await?;
        debug!(audience = %audience, expiry = %id_token.expiry, "Exchanged token for audience");
        Ok(Token {
            access_token: None,
            refresh_token: None,
            id_token: Some(id_token),
        })
    }

    async fn token_request(&self, params: &[(&str, &str)]) -> Result<TokenResponse, LoginError> {
        let grant = params
            .iter()
            .find(|(k, _)| *k == "grant_type")
            .map(|(_, v)| *v)
            .unwrap_or_default();
        debug!(endpoint = %self.token_endpoint, grant_type = %grant, "Calling token endpoint");

        let response = self
            .http
            .post(self.token_endpoint.clone())
            .form(params)
            .send()
            .await
            .map_err(|e| LoginError::Transport(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| LoginError::Transport(e.to_string()))?;

        if !status.is_success() {
            return Err(match serde_json::from_str::<OAuthErrorResponse>(&body) {
                Ok(oauth) => LoginError::Upstream {
                    error: oauth.error,
                    description: oauth.error_description.unwrap_or_default(),
                },
                Err(_) => LoginError::Transport(format!("token endpoint returned {}", status)),
            });
        }

        serde_json::from_str(&body)
            .map_err(|e| LoginError::Transport(format!("invalid token response: {}", e)))
    }

    async fn token_from_response(
        &self,
        response: TokenResponse,
        previous_refresh: Option<&RefreshToken>,
    ) -> Result<Token, LoginError> {
        let raw_id = response
            .id_token
            .as_deref()
            .ok_or_else(|| LoginError::InvalidIdToken("token response has no id_token".into()))?;
        let id_token = self.verify_id_token(raw_id, &self.client_id).await?;

        let access_expiry = response
            .expires_in
            .and_then(chrono::Duration::try_seconds)
            .map(|ttl| Utc::now() + ttl);
        let refresh_token = response
            .refresh_token
            .map(|token| RefreshToken { token })
            .or_else(|| previous_refresh.cloned());

        Ok(Token {
            access_token: Some(AccessToken {
                token: response.access_token,
                token_type: response.token_type,
                expiry: access_expiry,
            }),
            refresh_token,
            id_token: Some(id_token),
        })
    }

    async fn verify_id_token(&self, raw: &str, audience: &str) -> Result<IdToken, LoginError> {
        let verified = self
            .verifier
            .verify(raw, &[audience.to_string()])
            .await
            .map_err(|e| match e {
                e if e.is_unavailable() => LoginError::Transport(e.to_string()),
                JwtError::Expired => LoginError::InvalidIdToken("ID token has expired".into()),
                e => LoginError::InvalidIdToken(e.to_string()),
            })?;

        Ok(IdToken {
            token: raw.to_string(),
            expiry: verified.expiry,
            claims: verified.claims,
        })
    }
}
