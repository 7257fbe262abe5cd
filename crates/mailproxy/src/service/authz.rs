use std::sync::Arc;

use async_trait::async_trait;
use http::Method;
use strum::EnumIter;
use strum_macros::{Display, EnumString};

use crate::service::{
    ApplicationId, MailboxId,
    authn::Principal,
    entitlements::{ConfigurationError, EntitlementStore},
};

/// App roles a caller's token must carry before any mailbox is looked at.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Display, EnumIter, EnumString)]
pub enum FunctionalRole {
    /// Read and manage entities below `/users/{mailbox}`
    #[strum(serialize = "Proxy.Users")]
    Users,
    /// Create and manage change notification subscriptions
    #[strum(serialize = "Proxy.Subscriptions")]
    Subscriptions,
}

impl FunctionalRole {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            FunctionalRole::Users => "Proxy.Users",
            FunctionalRole::Subscriptions => "Proxy.Subscriptions",
        }
    }

    #[must_use]
    pub fn description(self) -> &'static str {
        match self {
            FunctionalRole::Users => "manage mailbox entities of users",
            FunctionalRole::Subscriptions => "manage mailbox outlook entities",
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum MailboxOperation {
    Read,
    Edit,
}

impl MailboxOperation {
    #[must_use]
    pub fn from_method(method: &Method) -> Self {
        if *method == Method::GET || *method == Method::HEAD || *method == Method::OPTIONS {
            MailboxOperation::Read
        } else {
            MailboxOperation::Edit
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthorizationDecision {
    Allow,
    Deny { reason: String },
}

impl AuthorizationDecision {
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        matches!(self, AuthorizationDecision::Allow)
    }
}

/// Decides whether a principal may perform an operation on a mailbox.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Authorizer: Send + Sync + 'static {
    async fn authorize(
        &self,
        principal: &Principal,
        operation: MailboxOperation,
        mailbox: &MailboxId,
    ) -> Result<AuthorizationDecision, ConfigurationError>;
}

/// Grants access to exactly the mailboxes listed for the application in the
/// mailbox access file. Reads and edits require the same grant.
#[derive(Debug, Clone)]
pub struct MailboxAccessAuthorizer {
    store: Arc<EntitlementStore>,
}

impl MailboxAccessAuthorizer {
    #[must_use]
    pub fn new(store: Arc<EntitlementStore>) -> Self {
        Self { store }
    }

    pub async fn evaluate(
        &self,
        app_id: ApplicationId,
        mailbox: &MailboxId,
    ) -> Result<AuthorizationDecision, ConfigurationError> {
        let owned = self.store.resolve(app_id).await?;
        if owned.contains(mailbox) {
            Ok(AuthorizationDecision::Allow)
        } else {
            Ok(AuthorizationDecision::Deny {
                reason: format!("Application `{app_id}` is not granted access to mailbox `{mailbox}`"),
            })
        }
    }
}

#[async_trait]
impl Authorizer for MailboxAccessAuthorizer {
    async fn authorize(
        &self,
        principal: &Principal,
        operation: MailboxOperation,
        mailbox: &MailboxId,
    ) -> Result<AuthorizationDecision, ConfigurationError> {
        let decision = self.evaluate(principal.app_id, mailbox).await?;
        tracing::debug!(
            app_id = %principal.app_id,
            %operation,
            %mailbox,
            allowed = decision.is_allowed(),
            "Evaluated mailbox access"
        );
        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;
    use strum::IntoEnumIterator;
    use uuid::Uuid;

    use super::*;
    use crate::service::{
        MailboxSet,
        entitlements::{EntitlementTable, MockEntitlementSource},
    };

    fn authorizer_with(app: ApplicationId, mailboxes: &[&str]) -> MailboxAccessAuthorizer {
        let set: MailboxSet = mailboxes.iter().copied().map(MailboxId::from).collect();
        let mut source = MockEntitlementSource::new();
        source.expect_load().returning(move || {
            Ok(std::iter::once((app, set.clone())).collect::<EntitlementTable>())
        });
        MailboxAccessAuthorizer::new(Arc::new(EntitlementStore::new(
            Arc::new(source),
            Duration::from_secs(300),
        )))
    }

    #[test]
    fn test_role_names() {
        assert_eq!(FunctionalRole::Users.to_string(), "Proxy.Users");
        assert_eq!(
            "Proxy.Subscriptions".parse::<FunctionalRole>().unwrap(),
            FunctionalRole::Subscriptions
        );
        for role in FunctionalRole::iter() {
            assert_eq!(role.name(), role.to_string());
        }
    }

    #[test]
    fn test_operation_from_method() {
        assert_eq!(
            MailboxOperation::from_method(&Method::GET),
            MailboxOperation::Read
        );
        assert_eq!(
            MailboxOperation::from_method(&Method::HEAD),
            MailboxOperation::Read
        );
        assert_eq!(
            MailboxOperation::from_method(&Method::OPTIONS),
            MailboxOperation::Read
        );
        assert_eq!(
            MailboxOperation::from_method(&Method::PATCH),
            MailboxOperation::Edit
        );
        assert_eq!(
            MailboxOperation::from_method(&Method::DELETE),
            MailboxOperation::Edit
        );
    }

    #[tokio::test]
    async fn test_allow_iff_owned() {
        let app = ApplicationId::new(Uuid::now_v7());
        let authz = authorizer_with(app, &["alice@example.com", "shared@example.com"]);

        assert_eq!(
            authz
                .evaluate(app, &MailboxId::new("Alice@Example.com"))
                .await
                .unwrap(),
            AuthorizationDecision::Allow
        );
        let denied = authz
            .evaluate(app, &MailboxId::new("bob@example.com"))
            .await
            .unwrap();
        let AuthorizationDecision::Deny { reason } = denied else {
            panic!("expected deny");
        };
        assert!(reason.contains("bob@example.com"));
        assert!(!reason.contains("alice@example.com"));
    }

    #[tokio::test]
    async fn test_unknown_application_is_denied() {
        let app = ApplicationId::new(Uuid::now_v7());
        let authz = authorizer_with(app, &["alice@example.com"]);
        let stranger = ApplicationId::new(Uuid::now_v7());
        assert!(
            !authz
                .evaluate(stranger, &MailboxId::new("alice@example.com"))
                .await
                .unwrap()
                .is_allowed()
        );
    }

    #[tokio::test]
    async fn test_authorize_ignores_operation() {
        let app = ApplicationId::new(Uuid::now_v7());
        let authz = authorizer_with(app, &["alice@example.com"]);
        let principal = Principal::new(app, vec!["Proxy.Users".to_string()]);
        for operation in [MailboxOperation::Read, MailboxOperation::Edit] {
            assert!(
                authz
                    .authorize(&principal, operation, &MailboxId::new("alice@example.com"))
                    .await
                    .unwrap()
                    .is_allowed()
            );
        }
    }
}
