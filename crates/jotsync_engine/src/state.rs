//! Sync state machine and the engine's composition root.
//!
//! [`SyncService`] wires the monitor, queue, merge engine, recovery
//! orchestrator, and two transports together, and drives them from a
//! single cooperative `tick`. The observable lifecycle is the
//! [`SyncState`] machine; transitions outside its table are bugs and
//! are refused.

use crate::clock::Clock;
use crate::config::SyncConfig;
use crate::connectivity::ConnectivityMonitor;
use crate::error::{SyncError, SyncResult};
use crate::merge::MergeEngine;
use crate::queue::OfflineQueue;
use crate::recovery::{RecoveryOrchestrator, RecoveryPhase, RecoveryReport};
use crate::transport::{Transport, TransportEvent, TransportKind};
use jotsync_protocol::{
    ConflictRecord, EntityType, QueuedOperation, ResolutionStrategy, SyncableEntity,
};
use jotsync_store::LocalStore;
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Observable lifecycle of the sync engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Connected (or connectable) with nothing to do.
    Idle,
    /// A recovery pass is running.
    Syncing,
    /// No connectivity; mutations queue locally.
    Offline,
    /// Unresolved conflicts are waiting for resolution.
    Conflict,
    /// A non-connectivity failure needs attention.
    Error,
}

impl SyncState {
    /// Returns true if moving to `next` is legal.
    ///
    /// Self-transitions are not in the table; they are no-ops, not
    /// moves.
    pub fn can_transition_to(&self, next: SyncState) -> bool {
        use SyncState::*;
        matches!(
            (self, next),
            (Idle, Syncing)
                | (Idle, Offline)
                | (Idle, Error)
                | (Syncing, Idle)
                | (Syncing, Conflict)
                | (Syncing, Error)
                | (Syncing, Offline)
                | (Conflict, Syncing)
                | (Conflict, Idle)
                | (Error, Syncing)
                | (Error, Idle)
                | (Error, Offline)
                | (Offline, Syncing)
                | (Offline, Idle)
        )
    }

    /// The lowercase label used in logs and errors.
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Idle => "idle",
            SyncState::Syncing => "syncing",
            SyncState::Offline => "offline",
            SyncState::Conflict => "conflict",
            SyncState::Error => "error",
        }
    }
}

/// Running counters for the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    /// When the last successful pass finished (unix ms).
    pub last_sync_at: Option<i64>,
    /// When a pass was last attempted (unix ms).
    pub last_attempt_at: Option<i64>,
    /// Completed recovery passes.
    pub successful_syncs: u64,
    /// Failed recovery passes.
    pub failed_syncs: u64,
    /// Operations acknowledged by the server, lifetime.
    pub operations_uploaded: u64,
    /// Server deltas applied, lifetime.
    pub updates_downloaded: u64,
    /// Conflicts detected, lifetime.
    pub conflicts_detected: u64,
    /// Operations currently pending upload.
    pub pending_operations: usize,
    /// Conflicts currently awaiting resolution.
    pub conflicts_pending: usize,
}

/// A point-in-time view of the whole engine.
#[derive(Debug, Clone)]
pub struct SyncStatusSnapshot {
    /// Lifecycle state.
    pub state: SyncState,
    /// Perceived connectivity.
    pub online: bool,
    /// The active carrier, if any.
    pub transport: Option<TransportKind>,
    /// Recovery phase.
    pub phase: RecoveryPhase,
    /// Counters.
    pub stats: SyncStats,
}

type StateListener = Box<dyn Fn(SyncState, SyncState) + Send + Sync>;

/// The engine's composition root.
///
/// All collaborators are injected; the service owns no globals. Time
/// comes from the injected [`Clock`], so the whole engine runs under
/// virtual time in tests.
pub struct SyncService {
    store: Arc<dyn LocalStore>,
    monitor: Arc<ConnectivityMonitor>,
    primary: Arc<dyn Transport>,
    fallback: Arc<dyn Transport>,
    queue: Arc<OfflineQueue>,
    merge: Arc<MergeEngine>,
    recovery: RecoveryOrchestrator,
    clock: Arc<dyn Clock>,
    config: SyncConfig,
    state: RwLock<SyncState>,
    active: RwLock<Option<TransportKind>>,
    stats: RwLock<SyncStats>,
    connectivity_edges: Arc<Mutex<VecDeque<bool>>>,
    needs_sync: AtomicBool,
    state_listener: RwLock<Option<StateListener>>,
}

impl SyncService {
    /// Wires up a service. The primary transport is preferred; the
    /// fallback takes over when the primary cannot connect.
    pub fn new(
        store: Arc<dyn LocalStore>,
        monitor: Arc<ConnectivityMonitor>,
        primary: Arc<dyn Transport>,
        fallback: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
        config: SyncConfig,
    ) -> Self {
        let queue = Arc::new(OfflineQueue::new(
            store.clone(),
            clock.clone(),
            config.queue_max_retries,
        ));
        let merge = Arc::new(MergeEngine::new(config.conflict_skew_window));
        let recovery = RecoveryOrchestrator::new(
            store.clone(),
            queue.clone(),
            merge.clone(),
            clock.clone(),
            config.clone(),
        );

        let connectivity_edges = Arc::new(Mutex::new(VecDeque::new()));
        let edges = connectivity_edges.clone();
        monitor.subscribe(move |online| {
            edges.lock().push_back(online);
        });

        let initial = if monitor.is_online() {
            SyncState::Idle
        } else {
            SyncState::Offline
        };

        Self {
            store,
            monitor,
            primary,
            fallback,
            queue,
            merge,
            recovery,
            clock,
            config,
            state: RwLock::new(initial),
            active: RwLock::new(None),
            stats: RwLock::new(SyncStats::default()),
            connectivity_edges,
            needs_sync: AtomicBool::new(false),
            state_listener: RwLock::new(None),
        }
    }

    /// The current lifecycle state.
    pub fn state(&self) -> SyncState {
        *self.state.read()
    }

    /// The active carrier, if any.
    pub fn active_transport(&self) -> Option<TransportKind> {
        *self.active.read()
    }

    /// The offline queue.
    pub fn queue(&self) -> &Arc<OfflineQueue> {
        &self.queue
    }

    /// The merge engine (for inspecting unresolved conflicts).
    pub fn merge(&self) -> &Arc<MergeEngine> {
        &self.merge
    }

    /// Registers a listener invoked on each state transition with
    /// `(from, to)`.
    pub fn on_state_change(
        &self,
        listener: impl Fn(SyncState, SyncState) + Send + Sync + 'static,
    ) {
        *self.state_listener.write() = Some(Box::new(listener));
    }

    /// Running counters, with the live pending/conflict gauges filled
    /// in.
    pub fn stats(&self) -> SyncStats {
        let mut stats = *self.stats.read();
        stats.pending_operations = self.queue.pending_count(self.config.owner_id).unwrap_or(0);
        stats.conflicts_pending = self.merge.conflict_count();
        stats
    }

    /// A point-in-time snapshot of the engine.
    pub fn status(&self) -> SyncStatusSnapshot {
        SyncStatusSnapshot {
            state: self.state(),
            online: self.monitor.is_online(),
            transport: self.active_transport(),
            phase: self.recovery.phase(),
            stats: self.stats(),
        }
    }

    /// Records a local create: queues it for upload. The cache row
    /// appears once the server assigns an ID.
    pub fn record_local_create(
        &self,
        owner_id: i64,
        entity_type: EntityType,
        fields: Map<String, Value>,
    ) -> SyncResult<QueuedOperation> {
        self.queue.enqueue_create(owner_id, entity_type, fields)
    }

    /// Records a local update: applies it to the cached row and
    /// queues it for upload.
    pub fn record_local_update(
        &self,
        owner_id: i64,
        entity_type: EntityType,
        entity_id: i64,
        changes: Map<String, Value>,
    ) -> SyncResult<QueuedOperation> {
        let now = self.clock.now_ms();
        match self.load_entity(entity_type, entity_id)? {
            Some(mut entity) => {
                entity.apply_local_change(&changes, now);
                self.put_entity(&entity)?;
            }
            None => {
                debug!(entity_id, "update to uncached entity; queueing anyway");
            }
        }
        self.queue
            .enqueue_update(owner_id, entity_type, entity_id, changes)
    }

    /// Records a local delete: removes the cached row and queues the
    /// deletion for upload.
    pub fn record_local_delete(
        &self,
        owner_id: i64,
        entity_type: EntityType,
        entity_id: i64,
    ) -> SyncResult<QueuedOperation> {
        self.store
            .delete(entity_type.collection(), &entity_id.to_string())?;
        self.queue.enqueue_delete(owner_id, entity_type, entity_id)
    }

    /// Runs a recovery pass now.
    ///
    /// Goes through the full lifecycle: `syncing`, then `idle`,
    /// `conflict`, `offline`, or `error` depending on the outcome.
    pub fn sync_now(&self) -> SyncResult<RecoveryReport> {
        if !self.monitor.is_online() {
            self.set_state(SyncState::Offline);
            return Err(SyncError::NotConnected);
        }

        let transport = self.ensure_transport()?;
        self.set_state(SyncState::Syncing);
        let now = self.clock.now_ms();
        self.stats.write().last_attempt_at = Some(now);

        match self.recovery.perform_recovery_sync(transport.as_ref()) {
            Ok(report) => {
                {
                    let mut stats = self.stats.write();
                    stats.successful_syncs += 1;
                    stats.last_sync_at = Some(self.clock.now_ms());
                    stats.operations_uploaded += report.uploaded as u64;
                    stats.updates_downloaded += report.downloaded as u64;
                    stats.conflicts_detected += report.conflicts as u64;
                }
                if let Err(err) = self.queue.cleanup_completed(self.config.completed_max_age) {
                    warn!(%err, "queue cleanup failed");
                }

                if self.merge.conflict_count() > 0 {
                    self.set_state(SyncState::Conflict);
                } else {
                    self.set_state(SyncState::Idle);
                }
                Ok(report)
            }
            Err(SyncError::SyncInProgress) => Err(SyncError::SyncInProgress),
            Err(err) => {
                self.stats.write().failed_syncs += 1;
                if err.is_connectivity_loss() {
                    self.set_state(SyncState::Offline);
                } else {
                    self.set_state(SyncState::Error);
                }
                Err(err)
            }
        }
    }

    /// Resolves one unresolved conflict with the given strategy,
    /// persists the result, and queues a re-upload if the resolution
    /// kept local content.
    pub fn resolve_conflict(
        &self,
        entity_type: EntityType,
        entity_id: i64,
        strategy: ResolutionStrategy,
    ) -> SyncResult<SyncableEntity> {
        let record = self
            .merge
            .conflicts()
            .into_iter()
            .find(|c| c.entity_type == entity_type && c.entity_id == entity_id)
            .ok_or(SyncError::ConflictNotFound { entity_id })?;

        let resolved = self.merge.resolve_conflict(&record, strategy);
        self.put_entity(&resolved)?;
        if resolved.dirty {
            self.queue.enqueue_update(
                resolved.owner_id,
                entity_type,
                entity_id,
                resolved.fields.clone(),
            )?;
        }

        if self.merge.conflict_count() == 0 && self.state() == SyncState::Conflict {
            self.set_state(SyncState::Idle);
        }
        Ok(resolved)
    }

    /// Advances the whole engine: connectivity edges, both carriers'
    /// timers, and pushed events.
    pub fn tick(&self) {
        let now = self.clock.now_ms();

        let edges: Vec<bool> = self.connectivity_edges.lock().drain(..).collect();
        for online in edges {
            self.handle_connectivity_change(online);
        }

        self.primary.tick(now);
        self.fallback.tick(now);

        for event in self.primary.drain_events() {
            self.handle_event(TransportKind::Channel, event);
        }
        for event in self.fallback.drain_events() {
            self.handle_event(TransportKind::Polling, event);
        }

        if self.needs_sync.swap(false, Ordering::SeqCst) && self.monitor.is_online() {
            if let Err(err) = self.sync_now() {
                debug!(%err, "deferred sync attempt failed");
            }
        }
    }

    /// Reacts to a connectivity edge from the monitor.
    pub fn handle_connectivity_change(&self, online: bool) {
        if online {
            info!("connectivity restored; scheduling recovery sync");
            self.needs_sync.store(true, Ordering::SeqCst);
        } else {
            info!("connectivity lost; queueing locally");
            self.set_state(SyncState::Offline);
        }
    }

    fn handle_event(&self, kind: TransportKind, event: TransportEvent) {
        match event {
            TransportEvent::Update(update) => match self.recovery.apply_server_update(update) {
                Ok(conflicts) if conflicts > 0 && self.merge.conflict_count() > 0 => {
                    self.set_state(SyncState::Conflict);
                }
                Ok(_) => {}
                Err(err) => warn!(%err, "failed to apply pushed update"),
            },
            TransportEvent::Conflict(record) => {
                if let Err(err) = self.handle_pushed_conflict(record) {
                    warn!(%err, "failed to handle pushed conflict");
                }
            }
            TransportEvent::ConnectionLost => {
                if self.active_transport() != Some(kind) {
                    return;
                }
                if kind == TransportKind::Channel && self.monitor.is_online() {
                    // The channel is gone but the network is not:
                    // degrade to polling while the channel backs off
                    info!("channel lost; degrading to polling");
                    if self.fallback.connect().is_ok() {
                        *self.active.write() = Some(TransportKind::Polling);
                        return;
                    }
                }
                *self.active.write() = None;
                self.set_state(SyncState::Offline);
            }
            TransportEvent::ConnectionRestored => {
                if kind == TransportKind::Channel
                    && self.active_transport() == Some(TransportKind::Polling)
                {
                    info!("channel back; leaving polling fallback");
                    self.fallback.disconnect();
                }
                *self.active.write() = Some(kind);
                self.needs_sync.store(true, Ordering::SeqCst);
            }
            TransportEvent::AuthRejected => {
                warn!(?kind, "credentials rejected");
                self.set_state(SyncState::Error);
            }
        }
    }

    fn handle_pushed_conflict(&self, record: ConflictRecord) -> SyncResult<()> {
        match self.config.conflict_policy.strategy_for(&record) {
            Some(strategy) => {
                let resolved = self.merge.resolve_conflict(&record, strategy);
                self.put_entity(&resolved)?;
                if resolved.dirty {
                    self.queue.enqueue_update(
                        resolved.owner_id,
                        record.entity_type,
                        record.entity_id,
                        resolved.fields.clone(),
                    )?;
                }
            }
            None => {
                self.merge.record_conflict(record);
                self.set_state(SyncState::Conflict);
            }
        }
        self.stats.write().conflicts_detected += 1;
        Ok(())
    }

    /// Picks a usable transport, preferring the primary.
    fn ensure_transport(&self) -> SyncResult<Arc<dyn Transport>> {
        if let Some(kind) = self.active_transport() {
            let transport = self.transport_for(kind);
            if transport.is_connected() {
                return Ok(transport);
            }
        }

        match self.primary.connect() {
            Ok(()) => {
                *self.active.write() = Some(TransportKind::Channel);
                Ok(self.primary.clone())
            }
            Err(SyncError::Auth(message)) => {
                self.set_state(SyncState::Error);
                Err(SyncError::Auth(message))
            }
            Err(primary_err) => {
                debug!(%primary_err, "primary transport unavailable; trying fallback");
                match self.fallback.connect() {
                    Ok(()) => {
                        *self.active.write() = Some(TransportKind::Polling);
                        Ok(self.fallback.clone())
                    }
                    Err(_) => Err(primary_err),
                }
            }
        }
    }

    fn transport_for(&self, kind: TransportKind) -> Arc<dyn Transport> {
        match kind {
            TransportKind::Channel => self.primary.clone(),
            TransportKind::Polling => self.fallback.clone(),
        }
    }

    fn set_state(&self, next: SyncState) {
        let mut state = self.state.write();
        let current = *state;
        if current == next {
            return;
        }
        if !current.can_transition_to(next) {
            warn!(
                from = current.as_str(),
                to = next.as_str(),
                "refusing illegal state transition"
            );
            return;
        }
        *state = next;
        drop(state);

        info!(from = current.as_str(), to = next.as_str(), "sync state");
        if let Some(listener) = self.state_listener.read().as_ref() {
            listener(current, next);
        }
    }

    fn load_entity(&self, ty: EntityType, id: i64) -> SyncResult<Option<SyncableEntity>> {
        match self.store.get(ty.collection(), &id.to_string())? {
            Some(raw) => Ok(Some(serde_json::from_value(raw)?)),
            None => Ok(None),
        }
    }

    fn put_entity(&self, entity: &SyncableEntity) -> SyncResult<()> {
        let raw = serde_json::to_value(entity)?;
        self.store
            .put(entity.entity_type.collection(), &entity.storage_key(), &raw)?;
        Ok(())
    }
}
