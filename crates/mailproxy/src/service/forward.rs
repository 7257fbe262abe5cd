use std::{error::Error as StdError, sync::Arc, time::Duration};

use async_trait::async_trait;
use axum::body::{Body, HttpBody};
use http::{
    HeaderMap, HeaderName, HeaderValue, Request, Response, Uri,
    header::{
        AUTHORIZATION, CONNECTION, HOST, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION, TE, TRAILER,
        TRANSFER_ENCODING, UPGRADE,
    },
};
use percent_encoding::percent_decode_str;
use strum_macros::Display;
use url::Url;

use crate::service::credentials::UpstreamCredentialProvider;

pub const HOP_BY_HOP_HEADERS: [HeaderName; 8] = [
    CONNECTION,
    HeaderName::from_static("keep-alive"),
    PROXY_AUTHENTICATE,
    PROXY_AUTHORIZATION,
    TE,
    TRAILER,
    TRANSFER_ENCODING,
    UPGRADE,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ForwardErrorKind {
    /// Upstream could not be reached or the exchange failed
    Request,
    RequestTimedOut,
    /// Reading the inbound body failed while it was sent upstream
    RequestBody,
    UpstreamCredentials,
    InvalidTarget,
}

/// A forwarding attempt that did not produce an upstream response.
#[derive(thiserror::Error, Debug)]
#[error("Forwarding failed with '{kind}' error: {message}")]
pub struct ForwardError {
    pub kind: ForwardErrorKind,
    /// Type name of the error that ended the attempt
    pub source_type: &'static str,
    pub message: String,
    #[source]
    pub source: Option<Box<dyn StdError + Send + Sync + 'static>>,
}

impl ForwardError {
    pub fn new<E>(kind: ForwardErrorKind, source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self {
            kind,
            source_type: std::any::type_name::<E>(),
            message: source.to_string(),
            source: Some(Box::new(source)),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum InvalidTarget {
    #[error("Upstream url `{0}` cannot be used as a base url")]
    NotABase(String),
    #[error("Request path `{path}` would be forwarded as `{forwarded}`")]
    PathRewritten { path: String, forwarded: String },
}

/// Sends an authorized request to the upstream service and relays its response.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Forwarder: Send + Sync + 'static {
    async fn forward(
        &self,
        request: Request<Body>,
        target: &Url,
    ) -> Result<Response<Body>, ForwardError>;
}

/// Forwards with `reqwest`. Redirects are returned to the caller, system
/// proxies are ignored and bodies are streamed in both directions without
/// being decompressed.
pub struct ReqwestForwarder {
    client: reqwest::Client,
    credentials: Option<Arc<dyn UpstreamCredentialProvider>>,
}

impl std::fmt::Debug for ReqwestForwarder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReqwestForwarder")
            .field("client", &self.client)
            .field(
                "credentials",
                &self.credentials.as_ref().map(|_| "UpstreamCredentialProvider"),
            )
            .finish()
    }
}

impl ReqwestForwarder {
    /// `timeout` bounds connecting and each read from the upstream, not the
    /// whole exchange, so long responses keep streaming while data flows.
    ///
    /// If `credentials` is set, the caller's `Authorization` header is replaced
    /// with a token of the proxy itself.
    pub fn new(
        timeout: Duration,
        credentials: Option<Arc<dyn UpstreamCredentialProvider>>,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .connect_timeout(timeout)
            .read_timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            credentials,
        })
    }
}

#[async_trait]
impl Forwarder for ReqwestForwarder {
    async fn forward(
        &self,
        request: Request<Body>,
        target: &Url,
    ) -> Result<Response<Body>, ForwardError> {
        let (parts, body) = request.into_parts();
        let url = target_url(target, &parts.uri)?;

        let mut headers = parts.headers;
        strip_hop_by_hop_headers(&mut headers);
        headers.remove(HOST);

        if let Some(credentials) = &self.credentials {
            let token = credentials
                .bearer_token()
                .await
                .map_err(|e| ForwardError::new(ForwardErrorKind::UpstreamCredentials, e))?;
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| ForwardError::new(ForwardErrorKind::UpstreamCredentials, e))?;
            headers.insert(AUTHORIZATION, value);
        }

        let mut builder = self
            .client
            .request(parts.method.clone(), url.clone())
            .headers(headers);
        if body.size_hint().exact() != Some(0) {
            builder = builder.body(reqwest::Body::wrap_stream(body.into_data_stream()));
        }

        tracing::debug!(method = %parts.method, %url, "Forwarding request upstream");
        let mut response = builder.send().await.map_err(|e| {
            let kind = if e.is_timeout() {
                ForwardErrorKind::RequestTimedOut
            } else if e.is_body() {
                ForwardErrorKind::RequestBody
            } else {
                ForwardErrorKind::Request
            };
            ForwardError::new(kind, e)
        })?;
        tracing::debug!(status = %response.status(), %url, "Received upstream response");

        let status = response.status();
        let mut headers = std::mem::take(response.headers_mut());
        strip_hop_by_hop_headers(&mut headers);

        let mut relayed = Response::new(Body::from_stream(response.bytes_stream()));
        *relayed.status_mut() = status;
        *relayed.headers_mut() = headers;
        Ok(relayed)
    }
}

/// The upstream path is the target's path followed by the inbound path.
///
/// The inbound path must arrive upstream segment by segment. If url parsing
/// would resolve dot segments or otherwise restructure it, the request is not
/// forwarded.
fn target_url(target: &Url, uri: &Uri) -> Result<Url, ForwardError> {
    if target.cannot_be_a_base() {
        return Err(ForwardError::new(
            ForwardErrorKind::InvalidTarget,
            InvalidTarget::NotABase(target.to_string()),
        ));
    }
    let mut url = target.clone();
    let path = format!("{}{}", target.path().trim_end_matches('/'), uri.path());
    url.set_path(&path);
    url.set_query(uri.query());

    if !same_segments(&path, url.path()) {
        return Err(ForwardError::new(
            ForwardErrorKind::InvalidTarget,
            InvalidTarget::PathRewritten {
                path,
                forwarded: url.path().to_string(),
            },
        ));
    }
    Ok(url)
}

/// Equal after percent-decoding each segment. Differences in escaping are
/// fine, a different number or order of segments is not.
fn same_segments(expected: &str, actual: &str) -> bool {
    let decoded = |path: &str| {
        path.split('/')
            .map(|segment| percent_decode_str(segment).decode_utf8_lossy().into_owned())
            .collect::<Vec<_>>()
    };
    decoded(expected) == decoded(actual)
}

/// Removes hop-by-hop headers, including those listed in `Connection`.
pub fn strip_hop_by_hop_headers(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in listed.iter().chain(HOP_BY_HOP_HEADERS.iter()) {
        headers.remove(name);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use axum::{Json, Router, extract::Request as AxumRequest, routing::any};
    use bytes::Bytes;
    use http::{Method, StatusCode};
    use http_body_util::BodyExt;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::service::credentials::MockUpstreamCredentialProvider;

    async fn echo(request: AxumRequest) -> axum::response::Response {
        use axum::response::IntoResponse;

        let (parts, body) = request.into_parts();
        let body = body.collect().await.unwrap().to_bytes();
        let headers: BTreeMap<String, String> = parts
            .headers
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_str().unwrap().to_string()))
            .collect();
        let mut response = Json(serde_json::json!({
            "method": parts.method.as_str(),
            "path": parts.uri.path(),
            "query": parts.uri.query(),
            "headers": headers,
            "body": String::from_utf8_lossy(&body),
        }))
        .into_response();
        response
            .headers_mut()
            .insert("x-upstream", HeaderValue::from_static("yes"));
        *response.status_mut() = StatusCode::ACCEPTED;
        response
    }

    async fn slow() -> &'static str {
        tokio::time::sleep(Duration::from_secs(5)).await;
        "late"
    }

    async fn trickle() -> Body {
        let chunks = futures::stream::unfold(0u8, |i| async move {
            if i == 5 {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
            Some((Ok::<_, std::io::Error>(Bytes::from(format!("chunk{i};"))), i + 1))
        });
        Body::from_stream(chunks)
    }

    async fn start_upstream() -> Url {
        let router = Router::new()
            .route("/slow", any(slow))
            .route("/trickle", any(trickle))
            .fallback(echo);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });
        format!("http://{addr}").parse().unwrap()
    }

    async fn json_body(response: Response<Body>) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_relays_method_path_query_body_and_headers() {
        let upstream = start_upstream().await;
        let forwarder = ReqwestForwarder::new(Duration::from_secs(5), None).unwrap();

        let request = Request::builder()
            .method(Method::PATCH)
            .uri("/v1.0/users/alice@example.com/messages/1?$select=subject")
            .header(AUTHORIZATION, "Bearer caller-token")
            .header(CONNECTION, "x-hop")
            .header("x-hop", "1")
            .header(PROXY_AUTHORIZATION, "secret")
            .header("x-custom", "kept")
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"isRead":true}"#))
            .unwrap();

        let response = forwarder.forward(request, &upstream).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(response.headers()["x-upstream"], "yes");

        let echoed = json_body(response).await;
        assert_eq!(echoed["method"], "PATCH");
        assert_eq!(echoed["path"], "/v1.0/users/alice@example.com/messages/1");
        assert_eq!(echoed["query"], "$select=subject");
        assert_eq!(echoed["body"], r#"{"isRead":true}"#);
        let headers = &echoed["headers"];
        assert_eq!(headers["authorization"], "Bearer caller-token");
        assert_eq!(headers["x-custom"], "kept");
        assert!(headers.get("x-hop").is_none());
        assert!(headers.get("proxy-authorization").is_none());
        assert_eq!(headers["host"], upstream.authority());
    }

    #[tokio::test]
    async fn test_target_path_is_prefixed() {
        let upstream = start_upstream().await;
        let target = upstream.join("/graph/").unwrap();
        let forwarder = ReqwestForwarder::new(Duration::from_secs(5), None).unwrap();
        let request = Request::builder()
            .uri("/v1.0/subscriptions")
            .body(Body::empty())
            .unwrap();
        let echoed = json_body(forwarder.forward(request, &target).await.unwrap()).await;
        assert_eq!(echoed["path"], "/graph/v1.0/subscriptions");
        assert_eq!(echoed["method"], "GET");
    }

    #[tokio::test]
    async fn test_replaces_authorization_with_upstream_credentials() {
        let upstream = start_upstream().await;
        let mut credentials = MockUpstreamCredentialProvider::new();
        credentials
            .expect_bearer_token()
            .times(1)
            .returning(|| Ok("proxy-token".to_string()));
        let forwarder =
            ReqwestForwarder::new(Duration::from_secs(5), Some(Arc::new(credentials))).unwrap();

        let request = Request::builder()
            .uri("/v1.0/users/alice/messages")
            .header(AUTHORIZATION, "Bearer caller-token")
            .body(Body::empty())
            .unwrap();
        let echoed = json_body(forwarder.forward(request, &upstream).await.unwrap()).await;
        assert_eq!(echoed["headers"]["authorization"], "Bearer proxy-token");
    }

    #[tokio::test]
    async fn test_connection_failure() {
        let forwarder = ReqwestForwarder::new(Duration::from_secs(5), None).unwrap();
        let request = Request::builder()
            .uri("/v1.0/users/alice/messages")
            .body(Body::empty())
            .unwrap();
        let err = forwarder
            .forward(request, &"http://127.0.0.1:1".parse().unwrap())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ForwardErrorKind::Request);
        assert_eq!(err.source_type, std::any::type_name::<reqwest::Error>());
    }

    #[tokio::test]
    async fn test_timeout() {
        let upstream = start_upstream().await;
        let forwarder = ReqwestForwarder::new(Duration::from_millis(200), None).unwrap();
        let request = Request::builder().uri("/slow").body(Body::empty()).unwrap();
        let err = forwarder.forward(request, &upstream).await.unwrap_err();
        assert_eq!(err.kind, ForwardErrorKind::RequestTimedOut);
        assert_eq!(err.kind.to_string(), "RequestTimedOut");
    }

    #[tokio::test]
    async fn test_streaming_response_outlives_timeout() {
        let upstream = start_upstream().await;
        let forwarder = ReqwestForwarder::new(Duration::from_millis(300), None).unwrap();
        let request = Request::builder()
            .uri("/trickle")
            .body(Body::empty())
            .unwrap();
        let response = forwarder.forward(request, &upstream).await.unwrap();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, Bytes::from_static(b"chunk0;chunk1;chunk2;chunk3;chunk4;"));
    }

    #[test]
    fn test_target_url_keeps_path() {
        let target: Url = "https://graph.example.com".parse().unwrap();
        let uri: Uri = "/v1.0/users/alice%40example.com/messages('a')?$top=1"
            .parse()
            .unwrap();
        let url = target_url(&target, &uri).unwrap();
        assert_eq!(
            url.as_str(),
            "https://graph.example.com/v1.0/users/alice%40example.com/messages('a')?$top=1"
        );
    }

    #[test]
    fn test_target_url_refuses_dot_segments() {
        let target: Url = "https://graph.example.com/graph/".parse().unwrap();
        for path in [
            "/v1.0/users/alice@example.com/../../users/bob@example.com/messages",
            "/v1.0/users/alice@example.com/%2e%2e/%2E%2E/users/bob@example.com",
            "/v1.0/users/./alice@example.com",
        ] {
            let uri: Uri = path.parse().unwrap();
            let err = target_url(&target, &uri).unwrap_err();
            assert_eq!(err.kind, ForwardErrorKind::InvalidTarget, "{path}");
        }
    }

    #[test]
    fn test_strip_hop_by_hop_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(CONNECTION, HeaderValue::from_static("close, x-trace"));
        headers.insert("x-trace", HeaderValue::from_static("1"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers.insert("x-keep", HeaderValue::from_static("1"));
        strip_hop_by_hop_headers(&mut headers);
        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key("x-keep"));
    }
}
