//! Syncable entities and the entity-type vocabulary.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The kinds of entities the sync engine replicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    /// A note.
    Note,
    /// A folder grouping notes.
    Folder,
    /// A spaced-repetition review entry.
    Review,
}

impl EntityType {
    /// The store collection holding entities of this type.
    pub fn collection(&self) -> &'static str {
        match self {
            EntityType::Note => "notes",
            EntityType::Folder => "folders",
            EntityType::Review => "reviews",
        }
    }

    /// Fields compared during conflict detection.
    ///
    /// Bookkeeping fields (timestamps, version, dirty flag) are never
    /// compared; only user-visible content can conflict.
    pub fn comparable_fields(&self) -> &'static [&'static str] {
        match self {
            EntityType::Note => &["title", "content", "folder_id", "is_pinned"],
            EntityType::Folder => &["name", "parent_id", "sort_order"],
            EntityType::Review => &["content", "rating", "reviewed_at"],
        }
    }

    /// All entity types, in merge-pass order.
    pub fn all() -> &'static [EntityType] {
        &[EntityType::Folder, EntityType::Note, EntityType::Review]
    }
}

/// A locally cached entity that participates in sync.
///
/// Domain fields live in `fields` as a JSON map; the remaining fields
/// are sync bookkeeping.
///
/// # Invariants
///
/// - `dirty` is set only by the local write path
///   ([`SyncableEntity::apply_local_change`]) and cleared only by a
///   confirmed server acknowledgment ([`SyncableEntity::mark_synced`]).
/// - `id` is stable once server-assigned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncableEntity {
    /// Entity ID, stable once assigned by the server.
    pub id: i64,
    /// Owning user.
    pub owner_id: i64,
    /// Kind of entity.
    pub entity_type: EntityType,
    /// Domain fields (title, content, ...).
    #[serde(default)]
    pub fields: Map<String, Value>,
    /// Server-side modification timestamp (unix ms).
    pub updated_at: i64,
    /// Monotonic version counter. Zero means "not set"; callers must
    /// go through [`SyncableEntity::effective_version`].
    #[serde(default)]
    pub version: i64,
    /// Local ingestion time (unix ms).
    #[serde(default)]
    pub cached_at: i64,
    /// True iff a local mutation has not been synced.
    #[serde(default)]
    pub dirty: bool,
}

impl SyncableEntity {
    /// Creates a clean entity as received from the server.
    pub fn new(
        id: i64,
        owner_id: i64,
        entity_type: EntityType,
        fields: Map<String, Value>,
        updated_at: i64,
    ) -> Self {
        Self {
            id,
            owner_id,
            entity_type,
            fields,
            updated_at,
            version: updated_at,
            cached_at: updated_at,
            dirty: false,
        }
    }

    /// The version used for comparisons.
    ///
    /// Falls back to the timestamp when no explicit version was ever
    /// assigned (legacy rows, server omissions).
    pub fn effective_version(&self) -> i64 {
        if self.version > 0 {
            self.version
        } else {
            self.updated_at
        }
    }

    /// Returns a domain field by name.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Applies a local mutation: overwrites the given fields, bumps
    /// the timestamp and version, and marks the entity dirty.
    ///
    /// This is the only path that sets `dirty`.
    pub fn apply_local_change(&mut self, changes: &Map<String, Value>, now: i64) {
        for (key, value) in changes {
            self.fields.insert(key.clone(), value.clone());
        }
        self.updated_at = now;
        self.version = self.effective_version().max(now).max(self.version + 1);
        self.dirty = true;
    }

    /// Clears the dirty flag after a confirmed server acknowledgment.
    ///
    /// This is the only path that clears `dirty`.
    pub fn mark_synced(&mut self, server_updated_at: i64, now: i64) {
        self.updated_at = server_updated_at;
        self.version = server_updated_at;
        self.cached_at = now;
        self.dirty = false;
    }

    /// The store key for this entity.
    pub fn storage_key(&self) -> String {
        self.id.to_string()
    }
}
