//! Tokens the proxy uses to call the upstream service on its own behalf.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use moka::future::Cache;
use serde::Deserialize;
use serde_with::{DisplayFromStr, PickFirst, serde_as};
use url::Url;

use crate::UpstreamAuthConfig;

/// Tokens are refreshed this long before they expire.
const EXPIRY_SKEW: Duration = Duration::from_secs(120);

#[derive(thiserror::Error, Debug, Clone)]
pub enum CredentialError {
    #[error("Token request to `{url}` failed: {message}")]
    Request { url: String, message: String },
    #[error("Token endpoint rejected the request with status {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("Token response is invalid: {0}")]
    InvalidResponse(String),
    #[error("Invalid token endpoint: {0}")]
    InvalidEndpoint(String),
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UpstreamCredentialProvider: Send + Sync + 'static {
    async fn bearer_token(&self) -> Result<String, CredentialError>;
}

#[serde_as]
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    /// Seconds. Some authorities send it as a string.
    #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
    expires_in: u64,
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: Arc<str>,
    expires_in: Duration,
}

#[derive(Debug)]
struct TokenExpiration;

impl moka::Expiry<(), CachedToken> for TokenExpiration {
    fn expire_after_create(
        &self,
        _key: &(),
        value: &CachedToken,
        _created_at: std::time::Instant,
    ) -> Option<Duration> {
        Some(value.expires_in.saturating_sub(EXPIRY_SKEW))
    }
}

/// OAuth2 client credentials grant against a Microsoft identity platform
/// style authority (`{authority_host}/{tenant}/oauth2/v2.0/token`).
pub struct ClientSecretCredential {
    client: reqwest::Client,
    token_url: Url,
    client_id: String,
    client_secret: String,
    scope: String,
    cache: Cache<(), CachedToken>,
}

impl std::fmt::Debug for ClientSecretCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSecretCredential")
            .field("token_url", &self.token_url.as_str())
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

impl ClientSecretCredential {
    pub fn new(config: &UpstreamAuthConfig) -> Result<Self, CredentialError> {
        let token_url = config
            .authority_host
            .join(&format!("{}/oauth2/v2.0/token", config.tenant_id))
            .map_err(|e| CredentialError::InvalidEndpoint(e.to_string()))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| CredentialError::Request {
                url: token_url.to_string(),
                message: e.to_string(),
            })?;

        Ok(Self {
            client,
            token_url,
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            scope: config.scope.clone(),
            cache: Cache::builder()
                .max_capacity(1)
                .expire_after(TokenExpiration)
                .build(),
        })
    }

    async fn request_token(&self) -> Result<CachedToken, CredentialError> {
        let request_failed = |e: reqwest::Error| CredentialError::Request {
            url: self.token_url.to_string(),
            message: e.to_string(),
        };

        let response = self
            .client
            .post(self.token_url.clone())
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("scope", self.scope.as_str()),
            ])
            .send()
            .await
            .map_err(request_failed)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CredentialError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| CredentialError::InvalidResponse(e.to_string()))?;
        tracing::debug!(
            expires_in = token.expires_in,
            "Obtained upstream access token"
        );

        Ok(CachedToken {
            token: token.access_token.into(),
            expires_in: Duration::from_secs(token.expires_in),
        })
    }
}

#[async_trait]
impl UpstreamCredentialProvider for ClientSecretCredential {
    async fn bearer_token(&self) -> Result<String, CredentialError> {
        self.cache
            .try_get_with((), self.request_token())
            .await
            .map(|cached| cached.token.to_string())
            .map_err(|e| {
                tracing::error!(error = %e, "Failed to obtain upstream access token");
                (*e).clone()
            })
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        sync::atomic::{AtomicUsize, Ordering},
    };

    use axum::{Form, Json, Router, extract::State, routing::post};
    use pretty_assertions::assert_eq;

    use super::*;

    #[derive(Clone)]
    struct TokenServer {
        requests: Arc<AtomicUsize>,
        reject: bool,
    }

    async fn token_endpoint(
        State(server): State<TokenServer>,
        Form(form): Form<HashMap<String, String>>,
    ) -> axum::response::Response {
        use axum::response::IntoResponse;

        server.requests.fetch_add(1, Ordering::SeqCst);
        if server.reject {
            return (http::StatusCode::UNAUTHORIZED, "invalid_client").into_response();
        }
        assert_eq!(form["grant_type"], "client_credentials");
        assert_eq!(form["client_id"], "proxy-client");
        assert_eq!(form["client_secret"], "s3cret");
        assert_eq!(form["scope"], "https://graph.microsoft.com/.default");
        Json(serde_json::json!({
            "token_type": "Bearer",
            "expires_in": "3599",
            "access_token": "upstream-token",
        }))
        .into_response()
    }

    async fn start_token_server(reject: bool) -> (Url, Arc<AtomicUsize>) {
        let requests = Arc::new(AtomicUsize::new(0));
        let router = Router::new()
            .route("/tenant/oauth2/v2.0/token", post(token_endpoint))
            .with_state(TokenServer {
                requests: requests.clone(),
                reject,
            });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });
        (format!("http://{addr}").parse().unwrap(), requests)
    }

    fn config(authority_host: Url) -> UpstreamAuthConfig {
        UpstreamAuthConfig {
            tenant_id: "tenant".to_string(),
            client_id: "proxy-client".to_string(),
            client_secret: "s3cret".to_string(),
            authority_host,
            scope: "https://graph.microsoft.com/.default".to_string(),
        }
    }

    #[tokio::test]
    async fn test_token_is_reused_while_valid() {
        let (authority, requests) = start_token_server(false).await;
        let credential = ClientSecretCredential::new(&config(authority)).unwrap();

        for _ in 0..3 {
            assert_eq!(credential.bearer_token().await.unwrap(), "upstream-token");
        }
        assert_eq!(requests.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rejected_token_request() {
        let (authority, requests) = start_token_server(true).await;
        let credential = ClientSecretCredential::new(&config(authority)).unwrap();

        let err = credential.bearer_token().await.unwrap_err();
        assert!(
            matches!(err, CredentialError::Rejected { status: 401, .. }),
            "{err:?}"
        );
        // Failures are not cached.
        credential.bearer_token().await.unwrap_err();
        assert_eq!(requests.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_debug_hides_secret() {
        let credential =
            ClientSecretCredential::new(&config("https://login.example.com".parse().unwrap()))
                .unwrap();
        let debug = format!("{credential:?}");
        assert!(!debug.contains("s3cret"));
        assert!(debug.contains("https://login.example.com/tenant/oauth2/v2.0/token"));
    }
}
