//! In-memory store backend for testing.

use crate::backend::LocalStore;
use crate::error::StoreResult;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::BTreeMap;

/// An in-memory document store.
///
/// This backend keeps all data in memory and is suitable for:
/// - Unit tests
/// - Integration tests
/// - Ephemeral sessions that don't need persistence
///
/// # Thread Safety
///
/// The backend is thread-safe and can be shared across threads.
///
/// # Example
///
/// ```rust
/// use jotsync_store::{LocalStore, MemoryStore};
/// use serde_json::json;
///
/// let store = MemoryStore::new();
/// store.put("notes", "1", &json!({"title": "hello"})).unwrap();
/// assert!(store.get("notes", "1").unwrap().is_some());
/// ```
#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: RwLock<BTreeMap<String, BTreeMap<String, Value>>>,
    meta: RwLock<BTreeMap<String, String>>,
}

impl MemoryStore {
    /// Creates a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of items in a collection.
    #[must_use]
    pub fn len(&self, collection: &str) -> usize {
        self.collections
            .read()
            .get(collection)
            .map_or(0, BTreeMap::len)
    }

    /// Returns true if the collection is empty or absent.
    #[must_use]
    pub fn is_empty(&self, collection: &str) -> bool {
        self.len(collection) == 0
    }

    /// Clears all collections and metadata.
    pub fn clear(&self) {
        self.collections.write().clear();
        self.meta.write().clear();
    }
}

impl LocalStore for MemoryStore {
    fn get(&self, collection: &str, id: &str) -> StoreResult<Option<Value>> {
        Ok(self
            .collections
            .read()
            .get(collection)
            .and_then(|items| items.get(id))
            .cloned())
    }

    fn put(&self, collection: &str, id: &str, item: &Value) -> StoreResult<()> {
        self.collections
            .write()
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), item.clone());
        Ok(())
    }

    fn delete(&self, collection: &str, id: &str) -> StoreResult<()> {
        if let Some(items) = self.collections.write().get_mut(collection) {
            items.remove(id);
        }
        Ok(())
    }

    fn list(&self, collection: &str) -> StoreResult<Vec<Value>> {
        Ok(self
            .collections
            .read()
            .get(collection)
            .map(|items| items.values().cloned().collect())
            .unwrap_or_default())
    }

    fn query_by_index(
        &self,
        collection: &str,
        field: &str,
        value: &Value,
    ) -> StoreResult<Vec<Value>> {
        Ok(self
            .collections
            .read()
            .get(collection)
            .map(|items| {
                items
                    .values()
                    .filter(|item| item.get(field) == Some(value))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn get_meta(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.meta.read().get(key).cloned())
    }

    fn put_meta(&self, key: &str, value: &str) -> StoreResult<()> {
        self.meta.write().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete_meta(&self, key: &str) -> StoreResult<()> {
        self.meta.write().remove(key);
        Ok(())
    }
}
