//! Collaborators for running the proxy without an identity provider, a
//! mailbox access file or the real upstream.

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use axum::{Json, Router, extract::Request};
use http::HeaderMap;
use url::Url;

use crate::service::{
    ProxyState,
    authn::{AuthenticationFailure, Authenticator, Principal, extract_bearer_token},
    authz::MailboxAccessAuthorizer,
    entitlements::{ConfigurationError, EntitlementSource, EntitlementStore, EntitlementTable},
    forward::ReqwestForwarder,
};


/// Accepts a fixed set of opaque bearer tokens.
#[derive(Debug, Clone, Default)]
pub struct StaticTokenAuthenticator {
    principals: HashMap<String, Principal>,
}

impl StaticTokenAuthenticator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>, principal: Principal) -> Self {
        self.principals.insert(token.into(), principal);
        self
    }
}

#[async_trait]
impl Authenticator for StaticTokenAuthenticator {
    async fn authenticate(&self, headers: &HeaderMap) -> Result<Principal, AuthenticationFailure> {
        let token = extract_bearer_token(headers).ok_or(AuthenticationFailure::MissingToken)?;
        self.principals
            .get(token)
            .cloned()
            .ok_or(AuthenticationFailure::UnknownKey { kid: None })
    }
}

/// Serves the same mailbox access document on every load.
#[derive(Debug, Clone)]
pub struct StaticEntitlementSource {
    document: Vec<u8>,
}

impl StaticEntitlementSource {
    #[must_use]
    pub fn new(document: &serde_json::Value) -> Self {
        Self {
            document: document.to_string().into_bytes(),
        }
    }

    #[must_use]
    pub fn raw(document: impl Into<Vec<u8>>) -> Self {
        Self {
            document: document.into(),
        }
    }
}

#[async_trait]
impl EntitlementSource for StaticEntitlementSource {
    async fn load(&self) -> Result<EntitlementTable, ConfigurationError> {
        EntitlementTable::from_json(&self.document)
    }
}

/// A [`ProxyState`] with the production authorizer and forwarder.
///
/// # Panics
/// If the HTTP client cannot be built.
pub fn proxy_state(
    authenticator: impl Authenticator,
    source: impl EntitlementSource,
    upstream: Url,
) -> ProxyState {
    let store = Arc::new(EntitlementStore::new(
        Arc::new(source),
        Duration::from_secs(300),
    ));
    ProxyState {
        authenticator: Arc::new(authenticator),
        authorizer: Arc::new(MailboxAccessAuthorizer::new(store)),
        forwarder: Arc::new(
            ReqwestForwarder::new(Duration::from_secs(5), None)
                .expect("Failed to build HTTP client"),
        ),
        upstream,
        max_body_size: 64 * 1024,
    }
}

/// Start an upstream that answers every request with a JSON description of
/// what it received.
///
/// # Panics
/// If no local port can be bound.
pub async fn spawn_echo_upstream() -> Url {
    let router = Router::new().fallback(describe_request);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind upstream listener");
    let addr = listener
        .local_addr()
        .expect("Upstream listener has no address");
    tokio::spawn(async move { axum::serve(listener, router).await });
    format!("http://{addr}")
        .parse()
        .expect("Upstream url is valid")
}

async fn describe_request(request: Request) -> Json<serde_json::Value> {
    let (parts, body) = request.into_parts();
    let body = axum::body::to_bytes(body, usize::MAX)
        .await
        .unwrap_or_default();
    Json(serde_json::json!({
        "method": parts.method.as_str(),
        "path": parts.uri.path(),
        "query": parts.uri.query(),
        "authorization": parts
            .headers
            .get(http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok()),
        "body": String::from_utf8_lossy(&body),
    }))
}
