use std::path::{Path, PathBuf};

use async_trait::async_trait;

use super::{ConfigurationError, EntitlementTable};

/// Produces a complete entitlement table. Called on every cache refresh.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EntitlementSource: Send + Sync + 'static {
    async fn load(&self) -> Result<EntitlementTable, ConfigurationError>;
}

/// Reads the mailbox access JSON document from disk.
#[derive(Debug, Clone)]
pub struct FileEntitlementSource {
    path: PathBuf,
}

impl FileEntitlementSource {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl EntitlementSource for FileEntitlementSource {
    async fn load(&self) -> Result<EntitlementTable, ConfigurationError> {
        let bytes = tokio::fs::read(&self.path).await.map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                ConfigurationError::Missing {
                    path: self.path.clone(),
                }
            } else {
                ConfigurationError::Unreadable {
                    path: self.path.clone(),
                    source,
                }
            }
        })?;
        EntitlementTable::from_json(&bytes)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::service::{ApplicationId, MailboxId};

    #[tokio::test]
    async fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"applications": [{{"appId": "6f0ad2b1-3a0b-4a39-9d43-0b4c7d0cda11", "mailboxes": ["alice@example.com"]}}]}}"#
        )
        .unwrap();

        let source = FileEntitlementSource::new(file.path());
        let table = source.load().await.unwrap();
        let app: ApplicationId = "6f0ad2b1-3a0b-4a39-9d43-0b4c7d0cda11".parse().unwrap();
        assert!(
            table
                .mailboxes(app)
                .contains(&MailboxId::new("alice@example.com"))
        );
    }

    #[tokio::test]
    async fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let source = FileEntitlementSource::new(dir.path().join("mailboxAccess.json"));
        let err = source.load().await.unwrap_err();
        assert!(matches!(err, ConfigurationError::Missing { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn test_directory_is_unreadable() {
        let dir = tempfile::tempdir().unwrap();
        let source = FileEntitlementSource::new(dir.path());
        let err = source.load().await.unwrap_err();
        assert!(
            matches!(err, ConfigurationError::Unreadable { .. }),
            "{err:?}"
        );
    }
}
