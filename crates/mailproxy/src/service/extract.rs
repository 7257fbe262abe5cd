use async_trait::async_trait;
use axum::body::Body;
use bytes::Bytes;
use http::{HeaderMap, Method, Request, Uri, request::Parts};
use lazy_regex::regex_captures;
use percent_encoding::percent_decode_str;
use serde::Deserialize;

use crate::service::MailboxId;

/// The inbound request, with a body that can be inspected before forwarding.
///
/// The body is read at most once. After [`ProxyRequest::buffered_body`] was
/// called, [`ProxyRequest::into_request`] rebuilds the request from the
/// buffered bytes. Otherwise the original body stream is handed back untouched.
#[derive(Debug)]
pub struct ProxyRequest {
    parts: Parts,
    body: Option<Body>,
    buffered: Option<Bytes>,
    limit: usize,
}

impl ProxyRequest {
    /// `limit` bounds the number of bytes [`ProxyRequest::buffered_body`] reads.
    #[must_use]
    pub fn new(request: Request<Body>, limit: usize) -> Self {
        let (parts, body) = request.into_parts();
        Self {
            parts,
            body: Some(body),
            buffered: None,
            limit,
        }
    }

    #[must_use]
    pub fn method(&self) -> &Method {
        &self.parts.method
    }

    #[must_use]
    pub fn uri(&self) -> &Uri {
        &self.parts.uri
    }

    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.parts.headers
    }

    pub async fn buffered_body(&mut self) -> Result<Bytes, InvalidResource> {
        if let Some(bytes) = &self.buffered {
            return Ok(bytes.clone());
        }

        let body = self.body.take().unwrap_or_else(Body::empty);
        match axum::body::to_bytes(body, self.limit).await {
            Ok(bytes) => {
                self.buffered = Some(bytes.clone());
                Ok(bytes)
            }
            Err(e) => {
                // The stream is partially consumed and cannot be forwarded anymore.
                self.buffered = Some(Bytes::new());
                if is_length_limit_error(&e) {
                    Err(InvalidResource::BodyTooLarge { limit: self.limit })
                } else {
                    Err(InvalidResource::UnreadableBody(e))
                }
            }
        }
    }

    /// Fails if the path contains a `.` or `..` segment, also when the dots
    /// or the separators are percent-encoded. Such paths are normalized on
    /// the way upstream and would reach a different mailbox than the one
    /// that was authorized.
    pub fn ensure_canonical_path(&self) -> Result<(), InvalidResource> {
        ensure_no_dot_segments(self.uri().path())
    }

    #[must_use]
    pub fn into_request(self) -> Request<Body> {
        let body = match (self.buffered, self.body) {
            (Some(bytes), _) => Body::from(bytes),
            (None, Some(body)) => body,
            (None, None) => Body::empty(),
        };
        Request::from_parts(self.parts, body)
    }
}

fn ensure_no_dot_segments(path: &str) -> Result<(), InvalidResource> {
    let has_dot_segment = path.split(['/', '\\']).any(|segment| {
        percent_decode_str(segment)
            .decode_utf8_lossy()
            .split(['/', '\\'])
            .any(|decoded| decoded == "." || decoded == "..")
    });
    if has_dot_segment {
        return Err(InvalidResource::DotSegment {
            path: path.to_string(),
        });
    }
    Ok(())
}

fn is_length_limit_error(e: &axum::Error) -> bool {
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(e);
    while let Some(err) = current {
        if err.is::<http_body_util::LengthLimitError>() {
            return true;
        }
        current = err.source();
    }
    false
}

/// The request does not name a mailbox the proxy can check. Results in
/// `400 InvalidInput`.
#[derive(thiserror::Error, Debug)]
pub enum InvalidResource {
    #[error("Request body exceeds the limit of {limit} bytes")]
    BodyTooLarge { limit: usize },
    #[error("Failed to read request body")]
    UnreadableBody(#[source] axum::Error),
    #[error("Request body is not valid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),
    #[error("Request body does not specify a resource")]
    MissingResource,
    #[error("Only resources starting with /users/ is allowed. Found resource '{resource}'")]
    UnsupportedResource { resource: String },
    #[error("User identifier not found in resource path '{resource}'")]
    MissingMailbox { resource: String },
    #[error("User identifier not found in request path '{path}'")]
    MissingPathSegment { path: String },
    #[error("Relative path segments are not allowed. Found path '{path}'")]
    DotSegment { path: String },
}

/// Determines the mailbox a request operates on.
#[async_trait]
pub trait ResourceExtractor: Send + Sync + std::fmt::Debug + 'static {
    async fn extract(&self, request: &mut ProxyRequest) -> Result<MailboxId, InvalidResource>;
}

/// Reads the mailbox from `/{version}/users/{mailbox}/...`.
#[derive(Debug, Clone, Copy, Default)]
pub struct UserPathExtractor;

impl UserPathExtractor {
    const MAILBOX_SEGMENT: usize = 3;
}

#[async_trait]
impl ResourceExtractor for UserPathExtractor {
    async fn extract(&self, request: &mut ProxyRequest) -> Result<MailboxId, InvalidResource> {
        let path = request.uri().path();
        path.split('/')
            .nth(Self::MAILBOX_SEGMENT)
            .filter(|segment| !segment.is_empty())
            .map(|segment| MailboxId::new(percent_decode_str(segment).decode_utf8_lossy()))
            .ok_or_else(|| InvalidResource::MissingPathSegment {
                path: path.to_string(),
            })
    }
}

#[derive(Debug, Deserialize)]
struct SubscriptionBody {
    #[serde(default)]
    resource: Option<serde_json::Value>,
}

/// Reads the mailbox from the `resource` field of a subscription request body,
/// e.g. `{"resource": "/users/alice@example.com/mailFolders('Inbox')/messages"}`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubscriptionResourceExtractor;

impl SubscriptionResourceExtractor {
    fn mailbox_from_resource(resource: &str) -> Result<MailboxId, InvalidResource> {
        if !resource.starts_with("/users/") {
            return Err(InvalidResource::UnsupportedResource {
                resource: resource.to_string(),
            });
        }
        ensure_no_dot_segments(resource)?;
        match regex_captures!(r"^/users/([^/]*)/", resource) {
            Some((_, mailbox)) if !mailbox.is_empty() => Ok(MailboxId::new(mailbox)),
            _ => Err(InvalidResource::MissingMailbox {
                resource: resource.to_string(),
            }),
        }
    }
}

#[async_trait]
impl ResourceExtractor for SubscriptionResourceExtractor {
    async fn extract(&self, request: &mut ProxyRequest) -> Result<MailboxId, InvalidResource> {
        let body = request.buffered_body().await?;
        let parsed: SubscriptionBody =
            serde_json::from_slice(&body).map_err(InvalidResource::InvalidJson)?;
        match parsed.resource {
            Some(serde_json::Value::String(resource)) => Self::mailbox_from_resource(&resource),
            _ => Err(InvalidResource::MissingResource),
        }
    }
}
