//! Durable key/value storage port
//!
//! The pending authorization attempt, the token record and the session
//! snapshot all live in a [`KeyValueStore`] under namespaced keys
//! ([`StorageKeys`]). Stores that are shared between several browsing
//! contexts expose a change feed through [`KeyValueStore::subscribe`]; the
//! feed only yields changes made by *other* contexts, mirroring how
//! browsers deliver storage events.

mod file;
mod memory;

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};

use crate::error::StorageError;
use crate::types::ContextId;

pub use file::FileStore;
pub use memory::{ContextStore, MemoryStore};

/// Default key namespace
pub const DEFAULT_NAMESPACE: &str = "anthropic_oauth";

/// Key/value storage scoped to one browsing context
pub trait KeyValueStore: Send + Sync {
    /// Read a value
    ///
    /// # Errors
    /// Returns an error if the backend cannot be read.
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Write a value, replacing any previous one
    ///
    /// # Errors
    /// Returns an error if the backend cannot be written.
    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Delete a value; deleting a missing key succeeds
    ///
    /// # Errors
    /// Returns an error if the backend cannot be written.
    fn remove(&self, key: &str) -> Result<(), StorageError>;

    /// Subscribe to changes made by other contexts, if the store is shared
    fn subscribe(&self) -> Option<ExternalChanges> {
        None
    }
}

/// A single change to a stored key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEvent {
    /// Key that changed
    pub key: String,
    /// Value before the change
    pub old_value: Option<String>,
    /// Value after the change; `None` when the key was removed
    pub new_value: Option<String>,
    /// Context that made the change
    pub origin: ContextId,
}

/// Feed of storage changes that originated in other contexts
#[derive(Debug)]
pub struct ExternalChanges {
    receiver: broadcast::Receiver<StorageEvent>,
    own: ContextId,
}

impl ExternalChanges {
    pub(crate) fn new(receiver: broadcast::Receiver<StorageEvent>, own: ContextId) -> Self {
        Self { receiver, own }
    }

    /// Wait for the next external change; `None` once the store is gone
    pub async fn recv(&mut self) -> Option<StorageEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if event.origin == self.own => {}
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Storage change feed lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Take the next already-delivered external change without waiting
    pub fn try_recv(&mut self) -> Option<StorageEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) if event.origin == self.own => {}
                Ok(event) => return Some(event),
                Err(TryRecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Storage change feed lagged");
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }
}

/// Namespaced storage keys
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageKeys {
    namespace: String,
}

impl Default for StorageKeys {
    fn default() -> Self {
        Self::new(DEFAULT_NAMESPACE)
    }
}

impl StorageKeys {
    /// Create keys under `namespace`
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    /// Namespace prefix
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Key of the pending authorization attempt
    #[must_use]
    pub fn pending_authorization(&self) -> String {
        format!("{}.pending_authorization", self.namespace)
    }

    /// Key of the token record
    #[must_use]
    pub fn tokens(&self) -> String {
        format!("{}.tokens", self.namespace)
    }

    /// Key of the session snapshot
    #[must_use]
    pub fn session(&self) -> String {
        format!("{}.session", self.namespace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_are_namespaced() {
        let keys = StorageKeys::new("tutor");
        assert_eq!(keys.pending_authorization(), "tutor.pending_authorization");
        assert_eq!(keys.tokens(), "tutor.tokens");
        assert_eq!(keys.session(), "tutor.session");
        assert_eq!(StorageKeys::default().namespace(), DEFAULT_NAMESPACE);
    }
}
