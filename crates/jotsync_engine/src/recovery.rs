//! Recovery synchronization.
//!
//! When connectivity returns after an offline stretch, recovery runs
//! as one non-reentrant pass: upload the queued operations in
//! batches, download server deltas since the watermark (or everything
//! if the watermark is gone), then merge and persist. The watermark
//! only advances after the whole pass has been applied, so a crash
//! mid-recovery re-fetches rather than loses data.

use crate::clock::Clock;
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::merge::MergeEngine;
use crate::queue::OfflineQueue;
use crate::transport::Transport;
use jotsync_protocol::{
    ClientState, ConflictRecord, EntityType, OperationResult, OperationType, QueuedOperation,
    ServerUpdate, SyncRequest, SyncableEntity,
};
use jotsync_store::LocalStore;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

const WATERMARK_KEY: &str = "last_sync_time";

/// Observable phases of a recovery pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryPhase {
    /// No recovery running.
    Idle,
    /// Replaying the offline queue.
    Uploading,
    /// Fetching server deltas.
    Downloading,
    /// Reconciling fetched deltas with local state.
    Merging,
    /// The last pass finished.
    Complete,
}

/// Outcome of a recovery pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Operations acknowledged by the server.
    pub uploaded: usize,
    /// Operations the server rejected (now retrying or failed).
    pub upload_failures: usize,
    /// Server deltas fetched.
    pub downloaded: usize,
    /// Conflicts detected during the pass.
    pub conflicts: usize,
    /// Conflicts left for manual resolution.
    pub unresolved_conflicts: usize,
    /// Whether the download degraded to a full fetch.
    pub full_fetch: bool,
    /// The new watermark.
    pub server_time: i64,
}

#[derive(Default)]
struct ConflictTally {
    total: usize,
    unresolved: usize,
}

type PhaseListener = Box<dyn Fn(RecoveryPhase) + Send + Sync>;

/// Runs recovery passes against a transport.
pub struct RecoveryOrchestrator {
    store: Arc<dyn LocalStore>,
    queue: Arc<OfflineQueue>,
    merge: Arc<MergeEngine>,
    clock: Arc<dyn Clock>,
    config: SyncConfig,
    in_progress: AtomicBool,
    phase: RwLock<RecoveryPhase>,
    phase_listener: RwLock<Option<PhaseListener>>,
}

impl RecoveryOrchestrator {
    /// Creates an orchestrator.
    pub fn new(
        store: Arc<dyn LocalStore>,
        queue: Arc<OfflineQueue>,
        merge: Arc<MergeEngine>,
        clock: Arc<dyn Clock>,
        config: SyncConfig,
    ) -> Self {
        Self {
            store,
            queue,
            merge,
            clock,
            config,
            in_progress: AtomicBool::new(false),
            phase: RwLock::new(RecoveryPhase::Idle),
            phase_listener: RwLock::new(None),
        }
    }

    /// The current phase.
    pub fn phase(&self) -> RecoveryPhase {
        *self.phase.read()
    }

    /// Returns true if a pass is running.
    pub fn is_syncing(&self) -> bool {
        self.in_progress.load(Ordering::SeqCst)
    }

    /// Registers a phase-change listener.
    pub fn on_phase_change(&self, listener: impl Fn(RecoveryPhase) + Send + Sync + 'static) {
        *self.phase_listener.write() = Some(Box::new(listener));
    }

    /// The persisted watermark, if any.
    pub fn watermark(&self) -> SyncResult<Option<i64>> {
        Ok(self
            .store
            .get_meta(WATERMARK_KEY)?
            .and_then(|raw| raw.parse().ok()))
    }

    /// Runs a full recovery pass: upload, download, merge.
    ///
    /// Non-reentrant: a second call while one is running returns
    /// [`SyncError::SyncInProgress`] without touching anything.
    pub fn perform_recovery_sync(&self, transport: &dyn Transport) -> SyncResult<RecoveryReport> {
        if self.in_progress.swap(true, Ordering::SeqCst) {
            return Err(SyncError::SyncInProgress);
        }

        let result = self.run(transport);
        if result.is_err() {
            self.set_phase(RecoveryPhase::Idle);
        }
        self.in_progress.store(false, Ordering::SeqCst);
        result
    }

    /// Download-only pass for routine background syncs: fetches
    /// deltas since `since` (or the stored watermark when `None`),
    /// merges them, and advances the watermark. Queued uploads wait
    /// for the next full pass. Shares the non-reentrancy guard with
    /// [`Self::perform_recovery_sync`].
    pub fn incremental_recovery(
        &self,
        transport: &dyn Transport,
        since: Option<i64>,
    ) -> SyncResult<RecoveryReport> {
        if self.in_progress.swap(true, Ordering::SeqCst) {
            return Err(SyncError::SyncInProgress);
        }

        let result = self.run_incremental(transport, since);
        if result.is_err() {
            self.set_phase(RecoveryPhase::Idle);
        }
        self.in_progress.store(false, Ordering::SeqCst);
        result
    }

    fn run(&self, transport: &dyn Transport) -> SyncResult<RecoveryReport> {
        let watermark = self.watermark()?;
        let mut tally = ConflictTally::default();
        let mut uploaded_ids = HashSet::new();

        self.set_phase(RecoveryPhase::Uploading);
        let (uploaded, upload_failures, pushed_updates) =
            self.process_queue(transport, watermark, &mut tally, &mut uploaded_ids)?;

        self.set_phase(RecoveryPhase::Downloading);
        let (mut updates, server_time, full_fetch) = self.download(transport, watermark)?;
        let downloaded = updates.len();
        // Deltas piggybacked on upload responses merge in the same pass
        updates.extend(pushed_updates);

        self.set_phase(RecoveryPhase::Merging);
        self.merge_and_persist(updates, full_fetch, &mut tally, &uploaded_ids)?;
        self.set_watermark(server_time)?;

        self.set_phase(RecoveryPhase::Complete);
        info!(
            uploaded,
            upload_failures, downloaded, full_fetch, "recovery pass complete"
        );
        Ok(RecoveryReport {
            uploaded,
            upload_failures,
            downloaded,
            conflicts: tally.total,
            unresolved_conflicts: tally.unresolved,
            full_fetch,
            server_time,
        })
    }

    fn run_incremental(
        &self,
        transport: &dyn Transport,
        since: Option<i64>,
    ) -> SyncResult<RecoveryReport> {
        let since = match since {
            Some(since) => Some(since),
            None => self.watermark()?,
        };
        let mut tally = ConflictTally::default();

        self.set_phase(RecoveryPhase::Downloading);
        let (updates, server_time, full_fetch) = self.download(transport, since)?;
        let downloaded = updates.len();

        self.set_phase(RecoveryPhase::Merging);
        self.merge_and_persist(updates, full_fetch, &mut tally, &HashSet::new())?;
        self.set_watermark(server_time)?;

        self.set_phase(RecoveryPhase::Complete);
        debug!(downloaded, full_fetch, "incremental pass complete");
        Ok(RecoveryReport {
            uploaded: 0,
            upload_failures: 0,
            downloaded,
            conflicts: tally.total,
            unresolved_conflicts: tally.unresolved,
            full_fetch,
            server_time,
        })
    }

    /// Applies one pushed delta outside a recovery pass. Returns the
    /// number of conflicts it raised.
    pub fn apply_server_update(&self, update: ServerUpdate) -> SyncResult<usize> {
        let mut tally = ConflictTally::default();
        if update.deleted {
            self.apply_deletion(&update)?;
        } else if let Some(entity) = update.entity {
            self.apply_upsert(entity, &mut tally)?;
        }
        Ok(tally.total)
    }

    /// Uploads the pending queue in creation order, in batches.
    ///
    /// A snapshot of the pending set is taken up front; operations
    /// that return to pending during this pass wait for the next one.
    fn process_queue(
        &self,
        transport: &dyn Transport,
        watermark: Option<i64>,
        tally: &mut ConflictTally,
        uploaded_ids: &mut HashSet<(EntityType, i64)>,
    ) -> SyncResult<(usize, usize, Vec<ServerUpdate>)> {
        let pending = self.queue.get_pending_operations(self.config.owner_id)?;
        if pending.is_empty() {
            return Ok((0, 0, Vec::new()));
        }

        let mut uploaded = 0;
        let mut failures = 0;
        let mut pushed_updates = Vec::new();

        for chunk in pending.chunks(self.config.batch_size.max(1)) {
            let mut ops = Vec::with_capacity(chunk.len());
            for op in chunk {
                ops.push(self.queue.mark_processing(&op.operation_id)?);
            }

            let request = SyncRequest::new(
                &self.config.client_id,
                ClientState {
                    last_sync_time: watermark.unwrap_or(0),
                    pending_operations: self.queue.pending_count(self.config.owner_id)? as u32,
                },
                ops.clone(),
            );

            let response = match transport.sync(&request) {
                Ok(response) => response,
                Err(err) => {
                    // The whole batch is unacknowledged; put it back
                    // through the retry path and surface the error
                    for op in &ops {
                        let _ = self.queue.mark_failed(&op.operation_id, &err.to_string());
                    }
                    return Err(err);
                }
            };

            let by_id: HashMap<&str, &OperationResult> = response
                .operation_results
                .iter()
                .map(|r| (r.operation_id.as_str(), r))
                .collect();

            for op in &ops {
                match by_id.get(op.operation_id.as_str()) {
                    Some(result) if result.success => {
                        self.apply_op_success(op, result, response.server_time, uploaded_ids)?;
                        self.queue.mark_completed(&op.operation_id)?;
                        uploaded += 1;
                    }
                    Some(result) => {
                        let message = result.error.as_deref().unwrap_or("rejected by server");
                        self.queue.mark_failed(&op.operation_id, message)?;
                        failures += 1;
                    }
                    None => {
                        self.queue
                            .mark_failed(&op.operation_id, "no result returned")?;
                        failures += 1;
                    }
                }
            }

            for record in response.conflicts {
                self.handle_conflict(record, tally)?;
            }
            pushed_updates.extend(response.server_updates);
        }

        Ok((uploaded, failures, pushed_updates))
    }

    /// Reflects a server-acknowledged operation in the local cache.
    fn apply_op_success(
        &self,
        op: &QueuedOperation,
        result: &OperationResult,
        server_time: i64,
        uploaded_ids: &mut HashSet<(EntityType, i64)>,
    ) -> SyncResult<()> {
        let now = self.clock.now_ms();
        match op.operation_type {
            OperationType::Create => {
                if let Some(id) = result.entity_id {
                    let entity = SyncableEntity::new(
                        id,
                        op.owner_id,
                        op.entity_type,
                        op.payload.clone(),
                        server_time,
                    );
                    self.put_entity(&entity)?;
                    uploaded_ids.insert((op.entity_type, id));
                    debug!(entity_id = id, "create acknowledged; server id assigned");
                } else {
                    warn!(operation_id = %op.operation_id, "create acknowledged without an id");
                }
            }
            OperationType::Update => {
                if let Some(id) = op.entity_id {
                    uploaded_ids.insert((op.entity_type, id));
                    match self.load_entity(op.entity_type, id)? {
                        Some(mut entity) => {
                            for (key, value) in &op.payload {
                                entity.fields.insert(key.clone(), value.clone());
                            }
                            entity.mark_synced(server_time, now);
                            self.put_entity(&entity)?;
                        }
                        None => {
                            let entity = SyncableEntity::new(
                                id,
                                op.owner_id,
                                op.entity_type,
                                op.payload.clone(),
                                server_time,
                            );
                            self.put_entity(&entity)?;
                        }
                    }
                }
            }
            OperationType::Delete => {
                if let Some(id) = op.entity_id {
                    self.store
                        .delete(op.entity_type.collection(), &id.to_string())?;
                }
            }
        }
        Ok(())
    }

    /// Fetches deltas, paging while the server reports more.
    ///
    /// A rejected incremental fetch degrades to a full fetch rather
    /// than failing the pass: losing the watermark costs bandwidth,
    /// not correctness.
    fn download(
        &self,
        transport: &dyn Transport,
        since: Option<i64>,
    ) -> SyncResult<(Vec<ServerUpdate>, i64, bool)> {
        let mut cursor = since;
        let mut full_fetch = since.is_none();
        let mut first = true;
        let mut updates = Vec::new();
        let mut server_time = 0;

        loop {
            let response = match transport.fetch_updates(cursor) {
                Ok(response) if response.success => response,
                failed if first && cursor.is_some() => {
                    match failed {
                        Ok(_) | Err(SyncError::Protocol(_)) => {
                            warn!("incremental fetch rejected; falling back to full fetch");
                            cursor = None;
                            full_fetch = true;
                            first = false;
                            continue;
                        }
                        Err(err) => return Err(err),
                    }
                }
                Ok(_) => return Err(SyncError::Protocol("fetch reported failure".into())),
                Err(err) => return Err(err),
            };

            first = false;
            server_time = response.server_time;
            updates.extend(response.updates);

            if response.has_more {
                cursor = Some(response.server_time);
            } else {
                break;
            }
        }

        Ok((updates, server_time, full_fetch))
    }

    /// Applies fetched deltas to the local cache.
    ///
    /// A full fetch is reconciled per entity type through
    /// [`MergeEngine::merge_entities`]; an incremental fetch applies
    /// each delta individually.
    fn merge_and_persist(
        &self,
        updates: Vec<ServerUpdate>,
        full_fetch: bool,
        tally: &mut ConflictTally,
        uploaded_ids: &HashSet<(EntityType, i64)>,
    ) -> SyncResult<()> {
        if full_fetch {
            let mut by_type: HashMap<EntityType, Vec<SyncableEntity>> = HashMap::new();
            let mut deletions = Vec::new();
            for update in updates {
                if update.deleted {
                    deletions.push(update);
                } else if let Some(entity) = update.entity {
                    by_type.entry(entity.entity_type).or_default().push(entity);
                }
            }

            for ty in EntityType::all() {
                let server_list = by_type.remove(ty).unwrap_or_default();
                let local_list = self.load_entities(*ty)?;
                let outcome = self.merge.merge_entities(&local_list, &server_list, *ty)?;

                for entity in outcome.to_create.iter().chain(outcome.to_update.iter()) {
                    self.put_entity(entity)?;
                }
                for id in outcome.to_delete {
                    // Rows acknowledged by this pass's upload may not be
                    // visible in the server snapshot yet; keep them.
                    if uploaded_ids.contains(&(*ty, id)) {
                        continue;
                    }
                    self.store.delete(ty.collection(), &id.to_string())?;
                }
                for record in outcome.conflicts {
                    self.handle_conflict(record, tally)?;
                }
            }

            for update in deletions {
                self.apply_deletion(&update)?;
            }
        } else {
            for update in updates {
                if update.deleted {
                    self.apply_deletion(&update)?;
                } else if let Some(entity) = update.entity {
                    self.apply_upsert(entity, tally)?;
                }
            }
        }
        Ok(())
    }

    fn apply_upsert(&self, entity: SyncableEntity, tally: &mut ConflictTally) -> SyncResult<()> {
        match self.load_entity(entity.entity_type, entity.id)? {
            None => self.put_entity(&entity),
            Some(local) => {
                let comparison = self.merge.compare_versions(&local, &entity);
                if comparison.conflict {
                    if let Some(record) = self.merge.detect_conflict(&local, &entity) {
                        self.handle_conflict(record, tally)?;
                    }
                    // Timestamps differ but no compared field does:
                    // the pending local write re-uploads as usual
                    Ok(())
                } else if comparison.needs_update {
                    self.put_entity(&entity)
                } else {
                    Ok(())
                }
            }
        }
    }

    fn apply_deletion(&self, update: &ServerUpdate) -> SyncResult<()> {
        if let Some(local) = self.load_entity(update.entity_type, update.entity_id)? {
            if local.dirty {
                // A pending local write outlives a server deletion;
                // the re-upload recreates the entity
                warn!(
                    entity_id = update.entity_id,
                    "server deleted an entity with unsynced local changes; keeping local"
                );
                return Ok(());
            }
        }
        self.store
            .delete(update.entity_type.collection(), &update.entity_id.to_string())?;
        Ok(())
    }

    fn handle_conflict(
        &self,
        record: ConflictRecord,
        tally: &mut ConflictTally,
    ) -> SyncResult<()> {
        tally.total += 1;
        match self.config.conflict_policy.strategy_for(&record) {
            Some(strategy) => {
                let resolved = self.merge.resolve_conflict(&record, strategy);
                self.put_entity(&resolved)?;
                if resolved.dirty {
                    // Local or merged content must reach the server
                    self.queue.enqueue_update(
                        resolved.owner_id,
                        record.entity_type,
                        record.entity_id,
                        resolved.fields.clone(),
                    )?;
                }
            }
            None => {
                tally.unresolved += 1;
                self.merge.record_conflict(record);
            }
        }
        Ok(())
    }

    fn set_watermark(&self, server_time: i64) -> SyncResult<()> {
        self.store
            .put_meta(WATERMARK_KEY, &server_time.to_string())?;
        Ok(())
    }

    fn load_entity(&self, ty: EntityType, id: i64) -> SyncResult<Option<SyncableEntity>> {
        match self.store.get(ty.collection(), &id.to_string())? {
            Some(raw) => Ok(Some(serde_json::from_value(raw)?)),
            None => Ok(None),
        }
    }

    fn load_entities(&self, ty: EntityType) -> SyncResult<Vec<SyncableEntity>> {
        self.store
            .list(ty.collection())?
            .into_iter()
            .map(|raw| serde_json::from_value(raw).map_err(SyncError::from))
            .collect()
    }

    fn put_entity(&self, entity: &SyncableEntity) -> SyncResult<()> {
        let raw = serde_json::to_value(entity)?;
        self.store
            .put(entity.entity_type.collection(), &entity.storage_key(), &raw)?;
        Ok(())
    }

    fn set_phase(&self, phase: RecoveryPhase) {
        *self.phase.write() = phase;
        debug!(?phase, "recovery phase");
        if let Some(listener) = self.phase_listener.read().as_ref() {
            listener(phase);
        }
    }
}
