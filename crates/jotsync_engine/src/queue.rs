//! Durable offline operation queue.
//!
//! Local mutations made while offline are recorded here and replayed
//! against the server in creation order once connectivity returns.
//! The queue lives in the local store, so it survives restarts.

use crate::clock::Clock;
use crate::error::{SyncError, SyncResult};
use jotsync_protocol::{EntityType, OperationStatus, OperationType, QueuedOperation};
use jotsync_store::LocalStore;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const QUEUE_COLLECTION: &str = "sync_queue";

/// A durable FIFO queue of local mutations awaiting upload.
///
/// # Invariants
///
/// - Upload order is creation order. Timestamps are stamped strictly
///   monotonically, so two enqueues in the same millisecond still
///   order correctly.
/// - Consecutive UPDATEs to the same entity coalesce into one pending
///   operation instead of piling up.
/// - Status changes follow the [`OperationStatus`] transition table;
///   anything else is rejected as a [`SyncError::Queue`].
pub struct OfflineQueue {
    store: Arc<dyn LocalStore>,
    clock: Arc<dyn Clock>,
    max_retries: u32,
    last_created_at: AtomicI64,
}

impl OfflineQueue {
    /// Creates a queue over the given store.
    pub fn new(store: Arc<dyn LocalStore>, clock: Arc<dyn Clock>, max_retries: u32) -> Self {
        Self {
            store,
            clock,
            max_retries,
            last_created_at: AtomicI64::new(0),
        }
    }

    /// Enqueues a CREATE for an entity with no server ID yet.
    pub fn enqueue_create(
        &self,
        owner_id: i64,
        entity_type: EntityType,
        payload: Map<String, Value>,
    ) -> SyncResult<QueuedOperation> {
        let op = QueuedOperation::create(owner_id, entity_type, payload, self.stamp());
        self.persist(&op)?;
        debug!(operation_id = %op.operation_id, ?entity_type, "queued create");
        Ok(op)
    }

    /// Enqueues an UPDATE.
    ///
    /// If a pending UPDATE for the same entity already exists, the new
    /// payload merges into it (newer fields win) and the existing
    /// operation is refreshed in place rather than a second one
    /// appended.
    pub fn enqueue_update(
        &self,
        owner_id: i64,
        entity_type: EntityType,
        entity_id: i64,
        payload: Map<String, Value>,
    ) -> SyncResult<QueuedOperation> {
        let now = self.stamp();

        for mut existing in self.load_all()? {
            if existing.owner_id == owner_id && existing.is_mergeable_with(entity_type, entity_id) {
                existing.merge_payload(&payload, now);
                self.persist(&existing)?;
                debug!(
                    operation_id = %existing.operation_id,
                    entity_id,
                    "coalesced update into pending operation"
                );
                return Ok(existing);
            }
        }

        let op = QueuedOperation::update(owner_id, entity_type, entity_id, payload, now);
        self.persist(&op)?;
        debug!(operation_id = %op.operation_id, entity_id, "queued update");
        Ok(op)
    }

    /// Enqueues a DELETE.
    pub fn enqueue_delete(
        &self,
        owner_id: i64,
        entity_type: EntityType,
        entity_id: i64,
    ) -> SyncResult<QueuedOperation> {
        let op = QueuedOperation::delete(owner_id, entity_type, entity_id, self.stamp());
        self.persist(&op)?;
        debug!(operation_id = %op.operation_id, entity_id, "queued delete");
        Ok(op)
    }

    /// Re-enqueues an operation produced elsewhere (conflict
    /// resolutions that need re-upload). The timestamp is restamped
    /// so it sorts after everything already queued.
    pub fn enqueue(&self, mut op: QueuedOperation) -> SyncResult<QueuedOperation> {
        op.created_at = self.stamp();
        op.status = OperationStatus::Pending;
        self.persist(&op)?;
        Ok(op)
    }

    /// Looks up an operation by ID.
    pub fn get(&self, operation_id: &str) -> SyncResult<Option<QueuedOperation>> {
        match self.store.get(QUEUE_COLLECTION, operation_id)? {
            Some(raw) => Ok(Some(serde_json::from_value(raw)?)),
            None => Ok(None),
        }
    }

    /// All pending operations for one owner, in FIFO order.
    ///
    /// Several owners may share one store; each sees only their own
    /// operations.
    pub fn get_pending_operations(&self, owner_id: i64) -> SyncResult<Vec<QueuedOperation>> {
        let mut pending: Vec<_> = self
            .load_all()?
            .into_iter()
            .filter(|op| op.owner_id == owner_id && op.status == OperationStatus::Pending)
            .collect();
        pending.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.operation_id.cmp(&b.operation_id))
        });
        Ok(pending)
    }

    /// The owner's oldest pending operations, at most `limit`.
    pub fn get_next_batch(&self, owner_id: i64, limit: usize) -> SyncResult<Vec<QueuedOperation>> {
        let mut pending = self.get_pending_operations(owner_id)?;
        pending.truncate(limit);
        Ok(pending)
    }

    /// Marks an operation as part of an in-flight batch.
    pub fn mark_processing(&self, operation_id: &str) -> SyncResult<QueuedOperation> {
        self.transition(operation_id, OperationStatus::Processing, |_| {})
    }

    /// Marks an operation as acknowledged by the server.
    pub fn mark_completed(&self, operation_id: &str) -> SyncResult<QueuedOperation> {
        self.transition(operation_id, OperationStatus::Completed, |op| {
            op.last_error = None;
        })
    }

    /// Records a failed upload attempt.
    ///
    /// The operation returns to pending while retries remain and
    /// becomes terminally failed once they are exhausted.
    pub fn mark_failed(&self, operation_id: &str, error: &str) -> SyncResult<QueuedOperation> {
        let Some(mut op) = self.get(operation_id)? else {
            return Err(SyncError::Queue(format!(
                "operation {operation_id} not found"
            )));
        };

        let retry_count = op.retry_count + 1;
        let next = if retry_count >= self.max_retries {
            OperationStatus::Failed
        } else {
            OperationStatus::Pending
        };

        if !op.status.can_transition_to(next) {
            return Err(SyncError::Queue(format!(
                "operation {operation_id} cannot go from {:?} to {next:?}",
                op.status
            )));
        }

        op.retry_count = retry_count;
        op.last_error = Some(error.to_string());
        op.status = next;
        self.persist(&op)?;

        if next == OperationStatus::Failed {
            warn!(operation_id, retry_count, error, "operation failed terminally");
        } else {
            debug!(operation_id, retry_count, error, "operation will retry");
        }
        Ok(op)
    }

    /// Returns the owner's terminally failed operations to pending
    /// with a fresh retry budget. Returns how many were revived.
    pub fn retry_failed(&self, owner_id: i64) -> SyncResult<usize> {
        let mut revived = 0;
        for mut op in self.load_all()? {
            if op.owner_id == owner_id && op.status == OperationStatus::Failed {
                op.status = OperationStatus::Pending;
                op.retry_count = 0;
                self.persist(&op)?;
                revived += 1;
            }
        }
        if revived > 0 {
            info!(revived, "revived failed operations");
        }
        Ok(revived)
    }

    /// Purges completed operations older than `max_age`. Returns how
    /// many were removed.
    pub fn cleanup_completed(&self, max_age: Duration) -> SyncResult<usize> {
        let cutoff = self.clock.now_ms() - max_age.as_millis() as i64;
        let mut removed = 0;
        for op in self.load_all()? {
            if op.status == OperationStatus::Completed && op.created_at < cutoff {
                self.store.delete(QUEUE_COLLECTION, &op.operation_id)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Number of pending operations for one owner.
    pub fn pending_count(&self, owner_id: i64) -> SyncResult<usize> {
        Ok(self.get_pending_operations(owner_id)?.len())
    }

    /// Total number of queued operations, in any status.
    pub fn len(&self) -> SyncResult<usize> {
        Ok(self.load_all()?.len())
    }

    /// Returns true if nothing is queued.
    pub fn is_empty(&self) -> SyncResult<bool> {
        Ok(self.len()? == 0)
    }

    fn transition(
        &self,
        operation_id: &str,
        next: OperationStatus,
        mutate: impl FnOnce(&mut QueuedOperation),
    ) -> SyncResult<QueuedOperation> {
        let Some(mut op) = self.get(operation_id)? else {
            return Err(SyncError::Queue(format!(
                "operation {operation_id} not found"
            )));
        };

        if !op.status.can_transition_to(next) {
            return Err(SyncError::Queue(format!(
                "operation {operation_id} cannot go from {:?} to {next:?}",
                op.status
            )));
        }

        op.status = next;
        mutate(&mut op);
        self.persist(&op)?;
        Ok(op)
    }

    fn persist(&self, op: &QueuedOperation) -> SyncResult<()> {
        let raw = serde_json::to_value(op)?;
        self.store.put(QUEUE_COLLECTION, &op.operation_id, &raw)?;
        Ok(())
    }

    fn load_all(&self) -> SyncResult<Vec<QueuedOperation>> {
        self.store
            .list(QUEUE_COLLECTION)?
            .into_iter()
            .map(|raw| serde_json::from_value(raw).map_err(SyncError::from))
            .collect()
    }

    // Strictly monotonic creation stamp; enqueues in the same
    // millisecond must still sort FIFO.
    fn stamp(&self) -> i64 {
        let now = self.clock.now_ms();
        self.last_created_at
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last + 1))
            })
            .map(|last| now.max(last + 1))
            .unwrap_or(now)
    }
}
