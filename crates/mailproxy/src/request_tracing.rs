use http::{HeaderValue, Request};
use tower_http::{
    request_id::{MakeRequestId, RequestId},
    trace::MakeSpan,
};
use tracing::{Level, Span};
use uuid::Uuid;

use crate::api::X_REQUEST_ID_HEADER;

/// A `MakeSpan` implementation that attaches the `request_id` to the span.
///
/// Only the path is recorded. Query strings of mailbox requests may contain
/// message content filters and stay out of the logs.
#[derive(Debug, Clone)]
pub struct RestMakeSpan {
    level: Level,
}

impl RestMakeSpan {
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level }
    }
}

impl<B> MakeSpan<B> for RestMakeSpan {
    fn make_span(&mut self, request: &Request<B>) -> Span {
        // `tracing::span!` requires a constant level.
        macro_rules! make_span {
            ($level:expr) => {
                tracing::span!(
                    $level,
                    "request",
                    method = %request.method(),
                    path = %request.uri().path(),
                    version = ?request.version(),
                    user_agent = %request
                                .headers()
                                .get(http::header::USER_AGENT)
                                .and_then(|v| v.to_str().ok())
                                .unwrap_or("not set"),
                    request_id = %request
                                .headers()
                                .get(X_REQUEST_ID_HEADER)
                                .and_then(|v| v.to_str().ok())
                                .unwrap_or("MISSING-REQUEST-ID"),
                )
            }
        }

        match self.level {
            Level::TRACE => make_span!(Level::TRACE),
            Level::DEBUG => make_span!(Level::DEBUG),
            Level::INFO => make_span!(Level::INFO),
            Level::WARN => make_span!(Level::WARN),
            Level::ERROR => make_span!(Level::ERROR),
        }
    }
}

/// A [`MakeRequestId`] that generates `UUIDv7`s.
#[derive(Debug, Clone, Copy, Default)]
pub struct MakeRequestUuid7;

impl MakeRequestId for MakeRequestUuid7 {
    fn make_request_id<B>(&mut self, _request: &Request<B>) -> Option<RequestId> {
        HeaderValue::from_str(&Uuid::now_v7().to_string())
            .ok()
            .map(RequestId::new)
    }
}
