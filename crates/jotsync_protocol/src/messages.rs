//! Sync request/response wire contract.
//!
//! The same logical contract is carried by both transports: the
//! duplex channel wraps these in [`crate::ChannelMessage`] frames,
//! the polling carrier posts them as HTTP bodies.

use crate::conflict::ConflictRecord;
use crate::entity::{EntityType, SyncableEntity};
use crate::operation::QueuedOperation;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Client-side state summary sent with every request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientState {
    /// The watermark: last server timestamp the client has fully
    /// applied (unix ms). Zero means "never synced".
    pub last_sync_time: i64,
    /// Number of operations still queued after this request.
    pub pending_operations: u32,
}

/// A sync request: the client's queued operations plus its watermark.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRequest {
    /// Correlates the response on the duplex channel.
    pub request_id: String,
    /// Stable per-device identifier.
    pub client_id: String,
    /// Client state summary.
    pub client_state: ClientState,
    /// Operations in creation order. Order is significant: later
    /// operations may depend on earlier ones.
    pub operations: Vec<QueuedOperation>,
}

impl SyncRequest {
    /// Creates a request with a fresh `request_id`.
    pub fn new(
        client_id: impl Into<String>,
        client_state: ClientState,
        operations: Vec<QueuedOperation>,
    ) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            client_id: client_id.into(),
            client_state,
            operations,
        }
    }
}

/// Overall outcome of a sync request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// Every operation succeeded.
    Ok,
    /// Some operations failed; see per-operation results.
    Partial,
    /// The request as a whole failed.
    Error,
}

/// Per-operation outcome inside a [`SyncResponse`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationResult {
    /// The operation this result refers to.
    pub operation_id: String,
    /// Whether the server applied it.
    pub success: bool,
    /// Server-assigned entity ID for successful creates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<i64>,
    /// Failure message, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl OperationResult {
    /// A successful result, optionally carrying a server-assigned ID.
    pub fn success(operation_id: impl Into<String>, entity_id: Option<i64>) -> Self {
        Self {
            operation_id: operation_id.into(),
            success: true,
            entity_id,
            error: None,
        }
    }

    /// A failed result.
    pub fn failure(operation_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            operation_id: operation_id.into(),
            success: false,
            entity_id: None,
            error: Some(error.into()),
        }
    }
}

/// A server-side delta pushed or pulled to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerUpdate {
    /// Kind of entity.
    pub entity_type: EntityType,
    /// Entity ID.
    pub entity_id: i64,
    /// True if the entity was deleted on the server.
    #[serde(default)]
    pub deleted: bool,
    /// The entity snapshot; absent for deletions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity: Option<SyncableEntity>,
}

impl ServerUpdate {
    /// An update carrying a fresh entity snapshot.
    pub fn upsert(entity: SyncableEntity) -> Self {
        Self {
            entity_type: entity.entity_type,
            entity_id: entity.id,
            deleted: false,
            entity: Some(entity),
        }
    }

    /// A deletion notice.
    pub fn deletion(entity_type: EntityType, entity_id: i64) -> Self {
        Self {
            entity_type,
            entity_id,
            deleted: true,
            entity: None,
        }
    }
}

/// The server's answer to a [`SyncRequest`].
///
/// The client advances its watermark only after the whole response
/// has been applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncResponse {
    /// Overall outcome.
    pub status: SyncStatus,
    /// One result per uploaded operation.
    #[serde(default)]
    pub operation_results: Vec<OperationResult>,
    /// Server deltas since the client's watermark.
    #[serde(default)]
    pub server_updates: Vec<ServerUpdate>,
    /// Conflicts the server detected while applying operations.
    #[serde(default)]
    pub conflicts: Vec<ConflictRecord>,
    /// Server time (unix ms); the watermark candidate.
    pub server_time: i64,
}

impl SyncResponse {
    /// A fully successful response.
    pub fn ok(
        operation_results: Vec<OperationResult>,
        server_updates: Vec<ServerUpdate>,
        server_time: i64,
    ) -> Self {
        Self {
            status: SyncStatus::Ok,
            operation_results,
            server_updates,
            conflicts: Vec::new(),
            server_time,
        }
    }

    /// Derives the overall status from the per-operation results.
    pub fn with_derived_status(mut self) -> Self {
        let failures = self.operation_results.iter().filter(|r| !r.success).count();
        self.status = if failures == 0 {
            SyncStatus::Ok
        } else if failures == self.operation_results.len() {
            SyncStatus::Error
        } else {
            SyncStatus::Partial
        };
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    #[test]
    fn request_ids_are_unique() {
        let state = ClientState {
            last_sync_time: 0,
            pending_operations: 0,
        };
        let a = SyncRequest::new("client-1", state, vec![]);
        let b = SyncRequest::new("client-1", state, vec![]);
        assert_ne!(a.request_id, b.request_id);
    }

    #[test]
    fn operation_result_constructors() {
        let ok = OperationResult::success("op-1", Some(42));
        assert!(ok.success);
        assert_eq!(ok.entity_id, Some(42));
        assert!(ok.error.is_none());

        let failed = OperationResult::failure("op-2", "validation failed");
        assert!(!failed.success);
        assert_eq!(failed.error.as_deref(), Some("validation failed"));
    }

    #[test]
    fn derived_status() {
        let resp = SyncResponse::ok(
            vec![
                OperationResult::success("a", None),
                OperationResult::success("b", None),
            ],
            vec![],
            100,
        )
        .with_derived_status();
        assert_eq!(resp.status, SyncStatus::Ok);

        let resp = SyncResponse::ok(
            vec![
                OperationResult::success("a", None),
                OperationResult::failure("b", "boom"),
            ],
            vec![],
            100,
        )
        .with_derived_status();
        assert_eq!(resp.status, SyncStatus::Partial);

        let resp = SyncResponse::ok(vec![OperationResult::failure("a", "boom")], vec![], 100)
            .with_derived_status();
        assert_eq!(resp.status, SyncStatus::Error);
    }

    #[test]
    fn server_update_constructors() {
        let entity = SyncableEntity::new(5, 1, EntityType::Folder, Map::new(), 100);
        let upsert = ServerUpdate::upsert(entity);
        assert!(!upsert.deleted);
        assert_eq!(upsert.entity_id, 5);
        assert!(upsert.entity.is_some());

        let gone = ServerUpdate::deletion(EntityType::Note, 9);
        assert!(gone.deleted);
        assert!(gone.entity.is_none());
    }

    #[test]
    fn response_serde_roundtrip() {
        let resp = SyncResponse::ok(
            vec![OperationResult::success("op-1", Some(42))],
            vec![ServerUpdate::deletion(EntityType::Review, 3)],
            1234,
        );

        let raw = serde_json::to_string(&resp).unwrap();
        let back: SyncResponse = serde_json::from_str(&raw).unwrap();
        assert_eq!(back, resp);
    }
}
