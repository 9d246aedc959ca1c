//! Queued operations for the offline queue.

use crate::entity::EntityType;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Type of queued operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    /// Entity was created locally and has no server ID yet.
    Create,
    /// Entity fields were changed locally.
    Update,
    /// Entity was deleted locally.
    Delete,
}

/// Lifecycle status of a queued operation.
///
/// Legal transitions:
///
/// ```text
/// pending → processing → completed            (terminal)
///           processing → pending              (retry, while retries remain)
///           processing → failed               (terminal, retries exhausted)
///           failed     → pending              (operator-triggered retry)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    /// Waiting to be uploaded.
    Pending,
    /// Currently part of an in-flight batch.
    Processing,
    /// Acknowledged by the server.
    Completed,
    /// Retries exhausted; waiting for operator action.
    Failed,
}

impl OperationStatus {
    /// Returns true if `next` is a legal transition from this status.
    pub fn can_transition_to(&self, next: OperationStatus) -> bool {
        matches!(
            (self, next),
            (OperationStatus::Pending, OperationStatus::Processing)
                | (OperationStatus::Processing, OperationStatus::Completed)
                | (OperationStatus::Processing, OperationStatus::Pending)
                | (OperationStatus::Processing, OperationStatus::Failed)
                | (OperationStatus::Failed, OperationStatus::Pending)
        )
    }

    /// Returns true if no further transition can occur without
    /// operator intervention.
    pub fn is_terminal(&self) -> bool {
        matches!(self, OperationStatus::Completed | OperationStatus::Failed)
    }
}

/// A mutation recorded while offline, to be replayed against the
/// server in creation order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedOperation {
    /// Client-generated, globally unique ID. Travels with every
    /// upload so the server can deduplicate redelivery.
    pub operation_id: String,
    /// Owning user.
    pub owner_id: i64,
    /// Create, update, or delete.
    pub operation_type: OperationType,
    /// Kind of entity affected.
    pub entity_type: EntityType,
    /// Entity ID; `None` for a create that has not been assigned a
    /// server ID yet.
    pub entity_id: Option<i64>,
    /// Changed fields.
    #[serde(default)]
    pub payload: Map<String, Value>,
    /// Creation time (unix ms). FIFO upload order key.
    pub created_at: i64,
    /// Lifecycle status.
    pub status: OperationStatus,
    /// Number of failed upload attempts so far.
    #[serde(default)]
    pub retry_count: u32,
    /// Message from the most recent failure.
    #[serde(default)]
    pub last_error: Option<String>,
}

impl QueuedOperation {
    fn new(
        owner_id: i64,
        operation_type: OperationType,
        entity_type: EntityType,
        entity_id: Option<i64>,
        payload: Map<String, Value>,
        created_at: i64,
    ) -> Self {
        Self {
            operation_id: Uuid::new_v4().to_string(),
            owner_id,
            operation_type,
            entity_type,
            entity_id,
            payload,
            created_at,
            status: OperationStatus::Pending,
            retry_count: 0,
            last_error: None,
        }
    }

    /// Creates a CREATE operation. The entity has no server ID yet.
    pub fn create(
        owner_id: i64,
        entity_type: EntityType,
        payload: Map<String, Value>,
        created_at: i64,
    ) -> Self {
        Self::new(owner_id, OperationType::Create, entity_type, None, payload, created_at)
    }

    /// Creates an UPDATE operation against a known entity.
    pub fn update(
        owner_id: i64,
        entity_type: EntityType,
        entity_id: i64,
        payload: Map<String, Value>,
        created_at: i64,
    ) -> Self {
        Self::new(
            owner_id,
            OperationType::Update,
            entity_type,
            Some(entity_id),
            payload,
            created_at,
        )
    }

    /// Creates a DELETE operation against a known entity.
    pub fn delete(owner_id: i64, entity_type: EntityType, entity_id: i64, created_at: i64) -> Self {
        Self::new(
            owner_id,
            OperationType::Delete,
            entity_type,
            Some(entity_id),
            Map::new(),
            created_at,
        )
    }

    /// Merges a newer UPDATE payload into this operation, field-wise,
    /// newer values winning, and refreshes the timestamp.
    ///
    /// Only UPDATE operations are ever merged; the queue enforces
    /// that invariant.
    pub fn merge_payload(&mut self, newer: &Map<String, Value>, now: i64) {
        for (key, value) in newer {
            self.payload.insert(key.clone(), value.clone());
        }
        self.created_at = now;
    }

    /// Returns true if this operation can be coalesced with a newer
    /// UPDATE for the same entity.
    pub fn is_mergeable_with(&self, entity_type: EntityType, entity_id: i64) -> bool {
        self.operation_type == OperationType::Update
            && self.status == OperationStatus::Pending
            && self.entity_type == entity_type
            && self.entity_id == Some(entity_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn status_transitions() {
        use OperationStatus::*;

        assert!(Pending.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Completed));
        assert!(Processing.can_transition_to(Pending));
        assert!(Processing.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Pending));

        assert!(!Pending.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Pending));
        assert!(!Completed.can_transition_to(Processing));
        assert!(!Failed.can_transition_to(Processing));
    }

    #[test]
    fn terminal_statuses() {
        assert!(OperationStatus::Completed.is_terminal());
        assert!(OperationStatus::Failed.is_terminal());
        assert!(!OperationStatus::Pending.is_terminal());
        assert!(!OperationStatus::Processing.is_terminal());
    }

    #[test]
    fn constructors_assign_unique_ids() {
        let a = QueuedOperation::create(1, EntityType::Note, Map::new(), 100);
        let b = QueuedOperation::create(1, EntityType::Note, Map::new(), 100);

        assert_ne!(a.operation_id, b.operation_id);
        assert_eq!(a.status, OperationStatus::Pending);
        assert_eq!(a.retry_count, 0);
        assert!(a.entity_id.is_none());
    }

    #[test]
    fn merge_payload_newer_wins() {
        let mut op = QueuedOperation::update(
            1,
            EntityType::Note,
            42,
            payload(&[("title", json!("a")), ("content", json!("body"))]),
            100,
        );

        op.merge_payload(&payload(&[("title", json!("b"))]), 200);

        assert_eq!(op.payload.get("title"), Some(&json!("b")));
        assert_eq!(op.payload.get("content"), Some(&json!("body")));
        assert_eq!(op.created_at, 200);
    }

    #[test]
    fn mergeable_only_pending_updates_same_entity() {
        let update = QueuedOperation::update(1, EntityType::Note, 42, Map::new(), 100);
        assert!(update.is_mergeable_with(EntityType::Note, 42));
        assert!(!update.is_mergeable_with(EntityType::Note, 43));
        assert!(!update.is_mergeable_with(EntityType::Folder, 42));

        let mut processing = update.clone();
        processing.status = OperationStatus::Processing;
        assert!(!processing.is_mergeable_with(EntityType::Note, 42));

        let create = QueuedOperation::create(1, EntityType::Note, Map::new(), 100);
        assert!(!create.is_mergeable_with(EntityType::Note, 42));

        let delete = QueuedOperation::delete(1, EntityType::Note, 42, 100);
        assert!(!delete.is_mergeable_with(EntityType::Note, 42));
    }

    #[test]
    fn serde_roundtrip() {
        let op = QueuedOperation::update(
            1,
            EntityType::Review,
            9,
            payload(&[("rating", json!(5))]),
            123,
        );

        let raw = serde_json::to_value(&op).unwrap();
        assert_eq!(raw["operation_type"], json!("update"));
        assert_eq!(raw["entity_type"], json!("review"));
        assert_eq!(raw["status"], json!("pending"));

        let back: QueuedOperation = serde_json::from_value(raw).unwrap();
        assert_eq!(back, op);
    }
}
