mod jwt;

use async_trait::async_trait;
use http::HeaderMap;
pub use jwt::JwtAuthenticator;

use crate::service::{ApplicationId, authz::FunctionalRole};

/// The authenticated caller of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub app_id: ApplicationId,
    /// App roles from the access token
    pub roles: Vec<String>,
}

impl Principal {
    #[must_use]
    pub fn new(app_id: ApplicationId, roles: Vec<String>) -> Self {
        Self { app_id, roles }
    }

    #[must_use]
    pub fn has_role(&self, role: FunctionalRole) -> bool {
        let name = role.name();
        self.roles.iter().any(|r| r == name)
    }
}

/// Every variant results in a `401 Unauthorized` without a body.
#[derive(thiserror::Error, Debug)]
pub enum AuthenticationFailure {
    #[error("Request does not carry a bearer token")]
    MissingToken,
    #[error("Access token is invalid: {0}")]
    InvalidToken(#[from] jsonwebtoken::errors::Error),
    #[error("No signing key found for key id {kid:?}")]
    UnknownKey { kid: Option<String> },
    #[error("Token is signed with algorithm {alg:?}, which the signing key does not allow")]
    AlgorithmMismatch { alg: jsonwebtoken::Algorithm },
    #[error("Access token does not identify the calling application")]
    MissingApplicationId,
    #[error("Signing keys are unavailable: {reason}")]
    KeysUnavailable { reason: String },
}

/// Establishes who is calling from the request headers.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Authenticator: Send + Sync + 'static {
    async fn authenticate(&self, headers: &HeaderMap) -> Result<Principal, AuthenticationFailure>;
}

/// Extract the token of an `Authorization: Bearer <token>` header.
#[must_use]
pub fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(http::header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}
