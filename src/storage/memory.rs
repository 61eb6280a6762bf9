//! In-memory store shared between contexts

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::broadcast;

use super::{ExternalChanges, KeyValueStore, StorageEvent};
use crate::error::StorageError;
use crate::types::ContextId;

const CHANGE_FEED_CAPACITY: usize = 64;

#[derive(Debug)]
struct Backend {
    entries: Mutex<HashMap<String, String>>,
    changes: broadcast::Sender<StorageEvent>,
}

/// Origin-wide in-memory storage
///
/// Cloning a `MemoryStore` shares the same entries. Each browsing context
/// gets its own [`ContextStore`] view via [`MemoryStore::context`]; writes
/// through one view are delivered to the others as [`StorageEvent`]s.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    backend: Arc<Backend>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Self {
            backend: Arc::new(Backend {
                entries: Mutex::new(HashMap::new()),
                changes,
            }),
        }
    }

    /// Open a view for a new browsing context
    #[must_use]
    pub fn context(&self) -> ContextStore {
        ContextStore {
            backend: Arc::clone(&self.backend),
            id: ContextId::next(),
        }
    }

    /// Snapshot of every stored key, sorted
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.backend.entries().keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl Backend {
    fn entries(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, event: StorageEvent) {
        // No receivers is fine: nobody is listening yet.
        let _ = self.changes.send(event);
    }
}

/// One context's view of a [`MemoryStore`]
#[derive(Debug, Clone)]
pub struct ContextStore {
    backend: Arc<Backend>,
    id: ContextId,
}

impl ContextStore {
    /// Identity of this context
    #[must_use]
    pub fn id(&self) -> &ContextId {
        &self.id
    }
}

impl KeyValueStore for ContextStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.backend.entries().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let old_value = self
            .backend
            .entries()
            .insert(key.to_string(), value.to_string());
        if old_value.as_deref() != Some(value) {
            self.backend.publish(StorageEvent {
                key: key.to_string(),
                old_value,
                new_value: Some(value.to_string()),
                origin: self.id.clone(),
            });
        }
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        let old_value = self.backend.entries().remove(key);
        if old_value.is_some() {
            self.backend.publish(StorageEvent {
                key: key.to_string(),
                old_value,
                new_value: None,
                origin: self.id.clone(),
            });
        }
        Ok(())
    }

    fn subscribe(&self) -> Option<ExternalChanges> {
        Some(ExternalChanges::new(
            self.backend.changes.subscribe(),
            self.id.clone(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contexts_share_entries() {
        let store = MemoryStore::new();
        let a = store.context();
        let b = store.context();

        a.set("ns.tokens", "{}").unwrap();
        assert_eq!(b.get("ns.tokens").unwrap().as_deref(), Some("{}"));

        b.remove("ns.tokens").unwrap();
        assert!(a.get("ns.tokens").unwrap().is_none());
        assert!(store.keys().is_empty());
    }

    #[test]
    fn test_change_feed_skips_own_writes() {
        let store = MemoryStore::new();
        let a = store.context();
        let b = store.context();
        let mut a_feed = a.subscribe().unwrap();
        let mut b_feed = b.subscribe().unwrap();

        a.set("ns.session", "v1").unwrap();

        assert!(a_feed.try_recv().is_none());
        let event = b_feed.try_recv().unwrap();
        assert_eq!(event.key, "ns.session");
        assert_eq!(event.old_value, None);
        assert_eq!(event.new_value.as_deref(), Some("v1"));
        assert_eq!(&event.origin, a.id());
    }

    #[test]
    fn test_unchanged_writes_are_silent() {
        let store = MemoryStore::new();
        let a = store.context();
        let b = store.context();
        let mut b_feed = b.subscribe().unwrap();

        a.set("k", "same").unwrap();
        a.set("k", "same").unwrap();
        a.remove("missing").unwrap();

        assert!(b_feed.try_recv().is_some());
        assert!(b_feed.try_recv().is_none());
    }
}
