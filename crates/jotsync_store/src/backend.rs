//! The durable local store contract.

use crate::error::StoreResult;
use serde_json::Value;

/// A durable on-device document store.
///
/// Implement this trait to plug a persistence engine into the sync
/// engine. Items are JSON documents keyed by a string id within a
/// named collection. Index scans match a single top-level field by
/// deep equality.
///
/// # Guarantees required of implementations
///
/// - Each `put`/`delete` is atomic and durable on return.
/// - `list` and `query_by_index` observe all prior writes.
/// - No ordering guarantee is made across collections.
///
/// No multi-item transaction is assumed anywhere in the engine.
pub trait LocalStore: Send + Sync {
    /// Gets an item by id, or `None` if absent.
    fn get(&self, collection: &str, id: &str) -> StoreResult<Option<Value>>;

    /// Inserts or replaces an item.
    fn put(&self, collection: &str, id: &str, item: &Value) -> StoreResult<()>;

    /// Deletes an item. Deleting an absent item is not an error.
    fn delete(&self, collection: &str, id: &str) -> StoreResult<()>;

    /// Returns all items in a collection. Order is unspecified.
    fn list(&self, collection: &str) -> StoreResult<Vec<Value>>;

    /// Returns all items whose top-level `field` equals `value`.
    fn query_by_index(&self, collection: &str, field: &str, value: &Value)
        -> StoreResult<Vec<Value>>;

    /// Gets a metadata value (watermarks, device identifiers).
    fn get_meta(&self, key: &str) -> StoreResult<Option<String>>;

    /// Sets a metadata value.
    fn put_meta(&self, key: &str, value: &str) -> StoreResult<()>;

    /// Removes a metadata value.
    fn delete_meta(&self, key: &str) -> StoreResult<()>;
}
