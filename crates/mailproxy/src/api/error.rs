use std::{
    error::Error as StdError,
    fmt::{Display, Formatter},
};

use http::StatusCode;
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;
use uuid::Uuid;

fn error_chain_fmt(e: &dyn StdError, f: &mut Formatter<'_>) -> std::fmt::Result {
    writeln!(f, "{e}")?;
    let mut current = e.source();
    while let Some(cause) = current {
        writeln!(f, "Caused by:\n\t{cause}")?;
        current = cause.source();
    }
    Ok(())
}

fn error_chain_vec(e: &(dyn StdError + Send + Sync + 'static)) -> Vec<String> {
    let mut details = Vec::new();
    let mut current = Some(e as &(dyn StdError + 'static));
    while let Some(cause) = current {
        details.push(format!("{cause}"));
        current = cause.source();
    }
    details
}

/// JSON wrapper for all error responses produced by the proxy itself.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorModel,
}

impl From<ErrorModel> for ErrorResponse {
    fn from(value: ErrorModel) -> Self {
        ErrorResponse { error: value }
    }
}

impl Display for ErrorResponse {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.error)
    }
}

/// Details about the failure that caused a `ProxyError`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InnerError {
    /// Type name of the underlying error
    pub r#type: String,
    pub message: String,
}

/// Error payload in the shape of the upstream mailbox API:
/// `{"error": {"code": "...", "message": "...", "innerError": {...}}}`
#[derive(Debug, TypedBuilder, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorModel {
    /// Machine readable error code, e.g. `Forbidden` or `InvalidInput`
    #[builder(setter(into))]
    pub code: String,
    /// Human-readable error message
    #[builder(setter(into))]
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    #[builder(default)]
    pub inner_error: Option<InnerError>,
    #[serde(skip)]
    #[builder(default = StatusCode::INTERNAL_SERVER_ERROR)]
    pub status: StatusCode,
    #[serde(skip)]
    #[builder(default)]
    pub source: Option<Box<dyn StdError + Send + Sync + 'static>>,
    #[serde(skip)]
    #[builder(default = Uuid::now_v7())]
    pub error_id: Uuid,
}

impl StdError for ErrorModel {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn StdError + 'static))
    }
}

impl Display for ErrorModel {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{} ({}): {}", self.code, self.status, self.message)?;

        if let Some(inner) = &self.inner_error {
            writeln!(f, "Inner error {}: {}", inner.r#type, inner.message)?;
        }

        if let Some(source) = self.source.as_ref() {
            writeln!(f, "Caused by:")?;
            error_chain_fmt(&**source, f)?;
        }

        Ok(())
    }
}

impl ErrorModel {
    pub const CODE_INVALID_INPUT: &'static str = "InvalidInput";
    pub const CODE_FORBIDDEN: &'static str = "Forbidden";
    pub const CODE_PROXY_ERROR: &'static str = "ProxyError";
    pub const CODE_CONFIGURATION_ERROR: &'static str = "ConfigurationError";

    pub fn bad_request(
        message: impl Into<String>,
        source: Option<Box<dyn StdError + Send + Sync + 'static>>,
    ) -> Self {
        Self::new(
            message,
            Self::CODE_INVALID_INPUT,
            StatusCode::BAD_REQUEST,
            source,
        )
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(message, Self::CODE_FORBIDDEN, StatusCode::FORBIDDEN, None)
    }

    /// A failed forwarding attempt. `inner` describes the error that ended it.
    pub fn proxy_error(
        message: impl Into<String>,
        inner: InnerError,
        source: Option<Box<dyn StdError + Send + Sync + 'static>>,
    ) -> Self {
        Self::builder()
            .message(message)
            .code(Self::CODE_PROXY_ERROR)
            .status(StatusCode::INTERNAL_SERVER_ERROR)
            .inner_error(Some(inner))
            .source(source)
            .build()
    }

    pub fn internal(
        message: impl Into<String>,
        code: impl Into<String>,
        source: Option<Box<dyn StdError + Send + Sync + 'static>>,
    ) -> Self {
        Self::new(message, code, StatusCode::INTERNAL_SERVER_ERROR, source)
    }

    pub fn new(
        message: impl Into<String>,
        code: impl Into<String>,
        status: StatusCode,
        source: Option<Box<dyn StdError + Send + Sync + 'static>>,
    ) -> Self {
        Self::builder()
            .message(message)
            .code(code)
            .status(status)
            .source(source)
            .build()
    }
}

impl axum::response::IntoResponse for ErrorModel {
    fn into_response(self) -> axum::response::Response {
        ErrorResponse { error: self }.into_response()
    }
}

impl axum::response::IntoResponse for ErrorResponse {
    fn into_response(self) -> axum::response::Response {
        let Self { error } = self;
        let ErrorModel {
            code,
            message,
            inner_error,
            status,
            source,
            error_id,
        } = error;
        let source = source.map(|e| error_chain_vec(&*e)).unwrap_or_default();

        // Sources never leave the process, they are only logged.
        if status.is_server_error() {
            tracing::error!(
                event_source = "error_response",
                %error_id,
                status = status.as_u16(),
                code = %code,
                message = %message,
                inner_error = ?inner_error,
                source = ?source,
                "Internal server error response"
            );
        } else {
            tracing::info!(
                event_source = "error_response",
                %error_id,
                status = status.as_u16(),
                code = %code,
                message = %message,
                source = ?source,
                "Error response"
            );
        }

        let mut response = axum::Json(ErrorResponse {
            error: ErrorModel {
                code,
                message,
                inner_error,
                status,
                source: None,
                error_id,
            },
        })
        .into_response();
        *response.status_mut() = status;
        response
    }
}
