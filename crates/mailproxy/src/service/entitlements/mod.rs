//! Which application may act on which mailbox.
//!
//! The mapping is read wholesale from an [`EntitlementSource`] and held by the
//! [`EntitlementStore`] for a bounded time before it is read again.

mod source;
mod store;
mod table;

use std::path::PathBuf;

pub use source::{EntitlementSource, FileEntitlementSource};
#[cfg(test)]
pub use source::MockEntitlementSource;
pub use store::EntitlementStore;
pub use table::EntitlementTable;

#[derive(thiserror::Error, Debug)]
pub enum ConfigurationError {
    #[error("Mailbox access file `{}` does not exist", path.display())]
    Missing { path: PathBuf },
    #[error("Failed to read mailbox access file `{}`", path.display())]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Mailbox access configuration is not valid JSON: {source}")]
    Malformed {
        #[source]
        source: serde_json::Error,
    },
    #[error("Mailbox access configuration is invalid: {0}")]
    Invalid(String),
}
