use std::{collections::HashSet, fmt::Display, ops::Deref, str::FromStr};

use serde::{Deserialize, Serialize};
use unicase::UniCase;

/// Identifies a calling application. Taken from the validated access token.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord, Copy)]
#[serde(transparent)]
pub struct ApplicationId(uuid::Uuid);

impl ApplicationId {
    #[must_use]
    pub fn new(id: uuid::Uuid) -> Self {
        Self(id)
    }
}

impl Deref for ApplicationId {
    type Target = uuid::Uuid;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<uuid::Uuid> for ApplicationId {
    fn from(value: uuid::Uuid) -> Self {
        Self(value)
    }
}

impl FromStr for ApplicationId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(uuid::Uuid::from_str(s)?))
    }
}

impl Display for ApplicationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A mailbox as it was written by the caller or in the access file.
///
/// Equality and hashing ignore case. No other normalization is applied.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MailboxId(String);

impl MailboxId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn folded(&self) -> UniCase<&str> {
        UniCase::new(self.0.as_str())
    }
}

impl PartialEq for MailboxId {
    fn eq(&self, other: &Self) -> bool {
        self.folded() == other.folded()
    }
}

impl Eq for MailboxId {}

impl std::hash::Hash for MailboxId {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.folded().hash(state);
    }
}

impl Display for MailboxId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MailboxId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for MailboxId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Ordered, de-duplicated set of mailboxes owned by one application.
#[derive(Debug, Clone, Default)]
pub struct MailboxSet {
    mailboxes: Vec<MailboxId>,
    index: HashSet<MailboxId>,
}

impl MailboxSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` if an equivalent mailbox was already present. The first
    /// spelling is kept.
    pub fn insert(&mut self, mailbox: MailboxId) -> bool {
        if self.index.contains(&mailbox) {
            return false;
        }
        self.index.insert(mailbox.clone());
        self.mailboxes.push(mailbox);
        true
    }

    #[must_use]
    pub fn contains(&self, mailbox: &MailboxId) -> bool {
        self.index.contains(mailbox)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.mailboxes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mailboxes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MailboxId> {
        self.mailboxes.iter()
    }
}

impl FromIterator<MailboxId> for MailboxSet {
    fn from_iter<T: IntoIterator<Item = MailboxId>>(iter: T) -> Self {
        let mut set = Self::new();
        for mailbox in iter {
            set.insert(mailbox);
        }
        set
    }
}
