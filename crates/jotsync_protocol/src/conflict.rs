//! Conflict records and resolution vocabulary.

use crate::entity::{EntityType, SyncableEntity};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// How a single conflict should be resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    /// Keep the local snapshot outright.
    Local,
    /// Accept the server snapshot outright.
    Server,
    /// Merge field-by-field (non-null preference, array union,
    /// longer string, server-wins scalar default).
    Merge,
}

/// Policy for handling conflicts produced by a merge pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Auto-resolve every conflict with the local snapshot.
    LocalWins,
    /// Auto-resolve every conflict with the server snapshot.
    ServerWins,
    /// Auto-resolve with a field-level merge.
    FieldMerge,
    /// Auto-resolve with whatever each record suggests.
    Suggested,
    /// Leave conflicts for manual resolution.
    Manual,
}

impl ConflictPolicy {
    /// Returns true if this policy resolves conflicts without user
    /// involvement.
    pub fn auto_resolves(&self) -> bool {
        !matches!(self, ConflictPolicy::Manual)
    }

    /// The strategy this policy applies to a record, if automatic.
    pub fn strategy_for(&self, record: &ConflictRecord) -> Option<ResolutionStrategy> {
        match self {
            ConflictPolicy::LocalWins => Some(ResolutionStrategy::Local),
            ConflictPolicy::ServerWins => Some(ResolutionStrategy::Server),
            ConflictPolicy::FieldMerge => Some(ResolutionStrategy::Merge),
            ConflictPolicy::Suggested => Some(record.suggested_resolution),
            ConflictPolicy::Manual => None,
        }
    }
}

/// A detected divergence between a local and a server snapshot of the
/// same entity.
///
/// Records are ephemeral: they are created during a merge pass when
/// both sides changed a value and destroyed when a resolution is
/// applied. They are serializable because the server may also report
/// conflicts on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    /// Kind of entity.
    pub entity_type: EntityType,
    /// Entity ID.
    pub entity_id: i64,
    /// The local snapshot at detection time.
    pub local_snapshot: SyncableEntity,
    /// The server snapshot at detection time.
    pub server_snapshot: SyncableEntity,
    /// Names of fields whose values differ.
    pub conflicting_fields: BTreeSet<String>,
    /// The resolution the engine would pick automatically.
    pub suggested_resolution: ResolutionStrategy,
}

impl ConflictRecord {
    /// Creates a new conflict record.
    pub fn new(
        local_snapshot: SyncableEntity,
        server_snapshot: SyncableEntity,
        conflicting_fields: BTreeSet<String>,
        suggested_resolution: ResolutionStrategy,
    ) -> Self {
        Self {
            entity_type: local_snapshot.entity_type,
            entity_id: local_snapshot.id,
            local_snapshot,
            server_snapshot,
            conflicting_fields,
            suggested_resolution,
        }
    }
}
