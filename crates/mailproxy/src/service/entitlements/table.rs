use std::{collections::HashMap, sync::Arc};

use serde::Deserialize;

use super::ConfigurationError;
use crate::service::{ApplicationId, MailboxId, MailboxSet};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MailboxAccessDocument {
    applications: Vec<ApplicationEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApplicationEntry {
    app_id: ApplicationId,
    mailboxes: Vec<String>,
}

/// Immutable snapshot of application to mailbox grants.
#[derive(Debug, Clone, Default)]
pub struct EntitlementTable {
    entries: HashMap<ApplicationId, Arc<MailboxSet>>,
    empty: Arc<MailboxSet>,
}

impl EntitlementTable {
    /// Parse a mailbox access document:
    /// `{"applications": [{"appId": "<uuid>", "mailboxes": ["..."]}]}`
    ///
    /// If an application is listed more than once the last entry wins.
    pub fn from_json(bytes: &[u8]) -> Result<Self, ConfigurationError> {
        let document: MailboxAccessDocument = serde_json::from_slice(bytes)
            .map_err(|source| ConfigurationError::Malformed { source })?;

        let mut entries = HashMap::with_capacity(document.applications.len());
        for ApplicationEntry { app_id, mailboxes } in document.applications {
            if mailboxes.iter().any(String::is_empty) {
                return Err(ConfigurationError::Invalid(format!(
                    "Application `{app_id}` lists an empty mailbox"
                )));
            }
            let set = mailboxes.into_iter().map(MailboxId::from).collect();
            if entries.insert(app_id, Arc::new(set)).is_some() {
                tracing::warn!(
                    %app_id,
                    "Application is listed more than once in the mailbox access file, using the last entry"
                );
            }
        }

        Ok(Self {
            entries,
            empty: Arc::default(),
        })
    }

    /// Mailboxes granted to `app_id`. Unknown applications own nothing.
    #[must_use]
    pub fn mailboxes(&self, app_id: ApplicationId) -> Arc<MailboxSet> {
        self.entries
            .get(&app_id)
            .cloned()
            .unwrap_or_else(|| self.empty.clone())
    }

    #[must_use]
    pub fn application_count(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ApplicationId, &Arc<MailboxSet>)> {
        self.entries.iter()
    }
}

impl FromIterator<(ApplicationId, MailboxSet)> for EntitlementTable {
    fn from_iter<T: IntoIterator<Item = (ApplicationId, MailboxSet)>>(iter: T) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(app, set)| (app, Arc::new(set)))
                .collect(),
            empty: Arc::default(),
        }
    }
}
