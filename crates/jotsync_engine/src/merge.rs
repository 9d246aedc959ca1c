//! Conflict detection and field-level merging.
//!
//! The merge engine compares local and server snapshots of the same
//! entity, detects field-level conflicts, and proposes or executes
//! resolutions. Resolution is last-writer-biased with an optional
//! manual path; it is not a commutative merge algebra.

use crate::error::{SyncError, SyncResult};
use jotsync_protocol::{
    ConflictRecord, EntityType, ResolutionStrategy, SyncableEntity,
};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use tracing::debug;

/// Outcome of [`MergeEngine::compare_versions`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionComparison {
    /// The server side is strictly newer and the local side has no
    /// unsynced changes; the local copy should be replaced.
    pub needs_update: bool,
    /// Both sides changed since the last common sync point.
    pub conflict: bool,
}

/// Outcome of a [`MergeEngine::merge_entities`] pass.
#[derive(Debug, Default)]
pub struct MergeOutcome {
    /// Server-only entities to create locally.
    pub to_create: Vec<SyncableEntity>,
    /// Local-only entity IDs to delete (never dirty ones).
    pub to_delete: Vec<i64>,
    /// Server snapshots that should replace clean local copies.
    pub to_update: Vec<SyncableEntity>,
    /// Conflicts detected during the pass.
    pub conflicts: Vec<ConflictRecord>,
}

/// Compares snapshots, detects conflicts, and executes resolutions.
///
/// Unresolved conflicts accumulate in an internal list until resolved
/// or cleared; the sync state machine keys its `conflict` state off
/// that list.
pub struct MergeEngine {
    skew_window_ms: i64,
    conflicts: RwLock<Vec<ConflictRecord>>,
}

impl MergeEngine {
    /// Creates an engine with the given clock-skew tolerance window.
    pub fn new(skew_window: Duration) -> Self {
        Self {
            skew_window_ms: skew_window.as_millis() as i64,
            conflicts: RwLock::new(Vec::new()),
        }
    }

    /// Compares a local and a server snapshot of the same entity.
    ///
    /// `conflict` is true iff the local side is dirty and the two
    /// timestamps differ. `needs_update` is true iff the local side
    /// is clean and the server is strictly newer by version or
    /// timestamp.
    pub fn compare_versions(
        &self,
        local: &SyncableEntity,
        server: &SyncableEntity,
    ) -> VersionComparison {
        if local.dirty {
            return VersionComparison {
                needs_update: false,
                conflict: local.updated_at != server.updated_at,
            };
        }

        let newer = server.effective_version() > local.effective_version()
            || server.updated_at > local.updated_at;
        VersionComparison {
            needs_update: newer,
            conflict: false,
        }
    }

    /// Detects field-level divergence between two snapshots,
    /// restricted to the entity type's comparable fields.
    ///
    /// Returns `None` if no compared field differs. Comparison is
    /// deep: arrays and objects are compared structurally, and a
    /// missing field equals JSON null.
    pub fn detect_conflict(
        &self,
        local: &SyncableEntity,
        server: &SyncableEntity,
    ) -> Option<ConflictRecord> {
        self.detect_conflict_with_fields(local, server, local.entity_type.comparable_fields())
    }

    /// [`MergeEngine::detect_conflict`] with an explicit field
    /// allow-list.
    pub fn detect_conflict_with_fields(
        &self,
        local: &SyncableEntity,
        server: &SyncableEntity,
        comparable_fields: &[&str],
    ) -> Option<ConflictRecord> {
        let mut conflicting = BTreeSet::new();

        for field in comparable_fields {
            let local_value = local.field(field).unwrap_or(&Value::Null);
            let server_value = server.field(field).unwrap_or(&Value::Null);
            if local_value != server_value {
                conflicting.insert((*field).to_string());
            }
        }

        if conflicting.is_empty() {
            return None;
        }

        let suggested = self.suggest_resolution(local, server);
        Some(ConflictRecord::new(
            local.clone(),
            server.clone(),
            conflicting,
            suggested,
        ))
    }

    /// Suggests a resolution based on timestamp distance.
    ///
    /// Within the skew window the timestamps are not trustworthy
    /// enough to pick a side, so a field merge is suggested.
    pub fn suggest_resolution(
        &self,
        local: &SyncableEntity,
        server: &SyncableEntity,
    ) -> ResolutionStrategy {
        let delta = server.updated_at - local.updated_at;
        if delta > self.skew_window_ms {
            ResolutionStrategy::Server
        } else if -delta > self.skew_window_ms {
            ResolutionStrategy::Local
        } else {
            ResolutionStrategy::Merge
        }
    }

    /// Produces the resolved snapshot for a conflict.
    ///
    /// `Local` and `Server` pick that snapshot outright. `Merge`
    /// starts from the server snapshot, carries over local-only
    /// fields, and applies [`merge_field_value`] to each conflicting
    /// field. Any resolution that differs from the server snapshot
    /// stays dirty so the next upload pushes it.
    pub fn resolve_conflict(
        &self,
        record: &ConflictRecord,
        strategy: ResolutionStrategy,
    ) -> SyncableEntity {
        let resolved = match strategy {
            ResolutionStrategy::Local => {
                let mut entity = record.local_snapshot.clone();
                entity.dirty = true;
                entity
            }
            ResolutionStrategy::Server => {
                let mut entity = record.server_snapshot.clone();
                entity.dirty = false;
                entity
            }
            ResolutionStrategy::Merge => {
                let local = &record.local_snapshot;
                let server = &record.server_snapshot;
                let mut entity = server.clone();

                // Merge every field that differs, not just the ones
                // that triggered detection; side data like tags must
                // not be silently dropped to one side.
                let mut names: BTreeSet<&str> =
                    local.fields.keys().map(String::as_str).collect();
                names.extend(server.fields.keys().map(String::as_str));

                for field in names {
                    let local_value = local.field(field).unwrap_or(&Value::Null);
                    let server_value = server.field(field).unwrap_or(&Value::Null);
                    if local_value != server_value {
                        entity.fields.insert(
                            field.to_string(),
                            merge_field_value(local_value, server_value),
                        );
                    }
                }

                entity.updated_at = local.updated_at.max(server.updated_at);
                entity.version = local.effective_version().max(server.effective_version());
                entity.dirty = true;
                entity
            }
        };

        self.remove_conflict(record.entity_type, record.entity_id);
        resolved
    }

    /// Reconciles a local and a server entity list of one type.
    ///
    /// Server-only entities become creates. Local-only entities
    /// become deletes unless dirty: a pending local write must never
    /// be silently discarded. Matching IDs go through
    /// [`MergeEngine::compare_versions`] and
    /// [`MergeEngine::detect_conflict`]; detected conflicts are also
    /// accumulated on the engine.
    pub fn merge_entities(
        &self,
        local_list: &[SyncableEntity],
        server_list: &[SyncableEntity],
        entity_type: EntityType,
    ) -> SyncResult<MergeOutcome> {
        let local_by_id: HashMap<i64, &SyncableEntity> =
            local_list.iter().map(|e| (e.id, e)).collect();
        let server_by_id: HashMap<i64, &SyncableEntity> =
            server_list.iter().map(|e| (e.id, e)).collect();

        let mut outcome = MergeOutcome::default();

        for server in server_list {
            if server.entity_type != entity_type {
                return Err(SyncError::Protocol(format!(
                    "server list for {entity_type:?} contained a {:?}",
                    server.entity_type
                )));
            }
            if !local_by_id.contains_key(&server.id) {
                outcome.to_create.push(server.clone());
            }
        }

        for local in local_list {
            if !server_by_id.contains_key(&local.id) {
                if local.dirty {
                    debug!(
                        entity_id = local.id,
                        "keeping dirty local-only entity; pending write not discarded"
                    );
                } else {
                    outcome.to_delete.push(local.id);
                }
            }
        }

        for local in local_list {
            let Some(server) = server_by_id.get(&local.id) else {
                continue;
            };

            let comparison = self.compare_versions(local, server);
            if comparison.conflict {
                if let Some(record) = self.detect_conflict(local, server) {
                    self.conflicts.write().push(record.clone());
                    outcome.conflicts.push(record);
                }
            } else if comparison.needs_update {
                outcome.to_update.push((*server).clone());
            }
        }

        Ok(outcome)
    }

    /// Accumulates a conflict detected outside a merge pass (reported
    /// by the server, or found while applying a single update).
    pub fn record_conflict(&self, record: ConflictRecord) {
        self.conflicts.write().push(record);
    }

    /// The accumulated unresolved conflicts.
    pub fn conflicts(&self) -> Vec<ConflictRecord> {
        self.conflicts.read().clone()
    }

    /// Number of unresolved conflicts.
    pub fn conflict_count(&self) -> usize {
        self.conflicts.read().len()
    }

    /// Drops all accumulated conflicts.
    pub fn clear_conflicts(&self) {
        self.conflicts.write().clear();
    }

    fn remove_conflict(&self, entity_type: EntityType, entity_id: i64) {
        self.conflicts
            .write()
            .retain(|c| !(c.entity_type == entity_type && c.entity_id == entity_id));
    }
}

/// Merges a single conflicting field value.
///
/// Preference order: the non-null side; for two arrays, their union
/// with duplicates removed; for two strings, the longer one; anything
/// else falls back to the server value.
pub fn merge_field_value(local: &Value, server: &Value) -> Value {
    match (local, server) {
        (Value::Null, other) => other.clone(),
        (other, Value::Null) => other.clone(),
        (Value::Array(local_items), Value::Array(server_items)) => {
            let mut merged = local_items.clone();
            for item in server_items {
                if !merged.contains(item) {
                    merged.push(item.clone());
                }
            }
            Value::Array(merged)
        }
        (Value::String(local_str), Value::String(server_str)) => {
            if local_str.len() > server_str.len() {
                Value::String(local_str.clone())
            } else {
                Value::String(server_str.clone())
            }
        }
        // Unresolvable scalar conflict: the server wins.
        (_, server_value) => server_value.clone(),
    }
}
