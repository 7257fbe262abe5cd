pub mod authn;
pub mod authz;
pub mod credentials;
pub mod entitlements;
pub mod extract;
pub mod forward;
pub mod pipeline;

mod identifier;

pub use identifier::{ApplicationId, MailboxId, MailboxSet};
pub use pipeline::{ProxyError, ProxyOperation, ProxyOperationKind, ProxyState};
