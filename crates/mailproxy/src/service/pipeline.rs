use std::sync::Arc;

use axum::{
    body::Body,
    response::{IntoResponse, Response},
};
use http::{Request, StatusCode, header::WWW_AUTHENTICATE};
use strum_macros::Display;
use url::Url;

use crate::{
    api::{ErrorModel, InnerError},
    service::{
        MailboxId,
        authn::{AuthenticationFailure, Authenticator},
        authz::{AuthorizationDecision, Authorizer, FunctionalRole, MailboxOperation},
        entitlements::ConfigurationError,
        extract::{
            InvalidResource, ProxyRequest, ResourceExtractor, SubscriptionResourceExtractor,
            UserPathExtractor,
        },
        forward::{ForwardError, Forwarder},
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum ProxyOperationKind {
    UserMailbox,
    Subscription,
}

/// What a route requires before a request may be forwarded.
#[derive(Debug, Clone, Copy)]
pub struct ProxyOperation {
    pub kind: ProxyOperationKind,
    pub required_role: FunctionalRole,
    pub extractor: &'static dyn ResourceExtractor,
}

impl ProxyOperation {
    /// `/{version}/users/{mailbox}/...`
    #[must_use]
    pub const fn user_mailbox() -> Self {
        Self {
            kind: ProxyOperationKind::UserMailbox,
            required_role: FunctionalRole::Users,
            extractor: &UserPathExtractor,
        }
    }

    /// `/{version}/subscriptions`
    #[must_use]
    pub const fn subscription() -> Self {
        Self {
            kind: ProxyOperationKind::Subscription,
            required_role: FunctionalRole::Subscriptions,
            extractor: &SubscriptionResourceExtractor,
        }
    }
}

/// Collaborators shared by all requests.
#[derive(Clone)]
pub struct ProxyState {
    pub authenticator: Arc<dyn Authenticator>,
    pub authorizer: Arc<dyn Authorizer>,
    pub forwarder: Arc<dyn Forwarder>,
    pub upstream: Url,
    pub max_body_size: usize,
}

impl std::fmt::Debug for ProxyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyState")
            .field("authenticator", &"Authenticator")
            .field("authorizer", &"Authorizer")
            .field("forwarder", &"Forwarder")
            .field("upstream", &self.upstream.as_str())
            .field("max_body_size", &self.max_body_size)
            .finish()
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ProxyError {
    #[error("Authentication failed: {0}")]
    Unauthenticated(#[from] AuthenticationFailure),
    #[error("The '{role}' role is required to {}", .role.description())]
    RoleDenied { role: FunctionalRole },
    #[error(transparent)]
    InvalidResource(#[from] InvalidResource),
    #[error("The app must be granted access in the proxy api, to the mailbox '{mailbox}'")]
    OwnershipDenied { mailbox: MailboxId },
    #[error("Mailbox access configuration is unavailable")]
    Configuration(#[from] ConfigurationError),
    #[error("Proxy operation ended with '{}' error", .0.kind)]
    Upstream(#[from] ForwardError),
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        match self {
            ProxyError::Unauthenticated(e) => {
                tracing::info!(reason = %e, "Rejecting unauthenticated request");
                (StatusCode::UNAUTHORIZED, [(WWW_AUTHENTICATE, "Bearer")]).into_response()
            }
            e @ (ProxyError::RoleDenied { .. } | ProxyError::OwnershipDenied { .. }) => {
                ErrorModel::forbidden(e.to_string()).into_response()
            }
            ProxyError::InvalidResource(e) => {
                ErrorModel::bad_request(e.to_string(), Some(Box::new(e))).into_response()
            }
            e @ ProxyError::Configuration(_) => ErrorModel::internal(
                e.to_string(),
                ErrorModel::CODE_CONFIGURATION_ERROR,
                Some(Box::new(e)),
            )
            .into_response(),
            ProxyError::Upstream(e) => ErrorModel::proxy_error(
                format!("Proxy operation ended with '{}' error", e.kind),
                InnerError {
                    r#type: e.source_type.to_string(),
                    message: e.message.clone(),
                },
                Some(Box::new(e)),
            )
            .into_response(),
        }
    }
}

/// Run a request through all gates and forward it, translating failures into
/// error responses.
pub async fn run(state: &ProxyState, operation: ProxyOperation, request: Request<Body>) -> Response {
    match execute(state, operation, request).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

/// Authenticate, check the role, extract the mailbox, check ownership and
/// forward. Each gate either passes the request on or ends it.
#[tracing::instrument(skip_all, fields(operation = %operation.kind))]
pub async fn execute(
    state: &ProxyState,
    operation: ProxyOperation,
    request: Request<Body>,
) -> Result<Response, ProxyError> {
    let principal = state.authenticator.authenticate(request.headers()).await?;

    if !principal.has_role(operation.required_role) {
        tracing::info!(
            app_id = %principal.app_id,
            role = %operation.required_role,
            "Caller lacks the required role"
        );
        return Err(ProxyError::RoleDenied {
            role: operation.required_role,
        });
    }

    let mut request = ProxyRequest::new(request, state.max_body_size);
    request.ensure_canonical_path()?;
    let mailbox = operation.extractor.extract(&mut request).await?;

    let mailbox_operation = MailboxOperation::from_method(request.method());
    match state
        .authorizer
        .authorize(&principal, mailbox_operation, &mailbox)
        .await?
    {
        AuthorizationDecision::Allow => {}
        AuthorizationDecision::Deny { reason } => {
            tracing::info!(app_id = %principal.app_id, %mailbox, %reason, "Mailbox access denied");
            return Err(ProxyError::OwnershipDenied { mailbox });
        }
    }

    let response = state
        .forwarder
        .forward(request.into_request(), &state.upstream)
        .await?;
    tracing::debug!(
        app_id = %principal.app_id,
        %mailbox,
        status = %response.status(),
        "Forwarded request"
    );
    Ok(response)
}
