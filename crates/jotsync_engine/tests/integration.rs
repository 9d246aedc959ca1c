//! End-to-end scenarios across the whole engine.

use jotsync_engine::{
    ChannelTransport, Clock, ConnectivityMonitor, Credentials, DuplexSocket, MockTransport,
    Probe, SocketConnector, SyncConfig, SyncError, SyncResult, SyncService, SyncState,
    Transport, TransportKind, VirtualClock,
};
use jotsync_protocol::{
    ChannelMessage, ConflictPolicy, EntityType, OperationResult, OperationStatus, OperationType,
    PollResponse, ResolutionStrategy, ServerUpdate, SyncResponse, SyncableEntity,
};
use jotsync_store::{LocalStore, MemoryStore};
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct FlagProbe(AtomicBool);

impl Probe for FlagProbe {
    fn check(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn latency_ms(&self, _target: &str) -> Option<u64> {
        Some(25)
    }
}

struct Harness {
    clock: Arc<VirtualClock>,
    store: Arc<MemoryStore>,
    monitor: Arc<ConnectivityMonitor>,
    primary: Arc<MockTransport>,
    service: SyncService,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn harness(policy: ConflictPolicy, initially_online: bool) -> Harness {
    init_tracing();
    let clock = Arc::new(VirtualClock::new(1_000_000));
    let store = Arc::new(MemoryStore::new());
    let monitor = Arc::new(ConnectivityMonitor::new(
        clock.clone(),
        Box::new(FlagProbe(AtomicBool::new(initially_online))),
        initially_online,
    ));
    let primary = Arc::new(MockTransport::new(TransportKind::Channel));
    let fallback = Arc::new(MockTransport::new(TransportKind::Polling));
    primary.set_server_time(2_000_000);
    fallback.set_server_time(2_000_000);

    let config =
        SyncConfig::new("client-1", "wss://sync.example.com", 1).with_conflict_policy(policy);
    let service = SyncService::new(
        store.clone(),
        monitor.clone(),
        primary.clone(),
        fallback,
        clock.clone(),
        config,
    );
    Harness {
        clock,
        store,
        monitor,
        primary,
        service,
    }
}

fn payload(pairs: &[(&str, Value)]) -> Map<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), v.clone()))
        .collect()
}

fn stored_note(store: &MemoryStore, id: i64) -> Option<SyncableEntity> {
    store
        .get("notes", &id.to_string())
        .unwrap()
        .map(|raw| serde_json::from_value(raw).unwrap())
}

fn put_note(store: &MemoryStore, entity: &SyncableEntity) {
    store
        .put("notes", &entity.storage_key(), &serde_json::to_value(entity).unwrap())
        .unwrap();
}

#[test]
fn offline_edit_reconnects_and_recovers() {
    let h = harness(ConflictPolicy::Suggested, false);
    assert_eq!(h.service.state(), SyncState::Offline);

    let op = h
        .service
        .record_local_create(1, EntityType::Note, payload(&[("title", json!("written offline"))]))
        .unwrap();
    assert_eq!(h.service.stats().pending_operations, 1);

    h.primary.script_sync(Ok(SyncResponse::ok(
        vec![OperationResult::success(op.operation_id.clone(), Some(42))],
        vec![],
        2_000_000,
    )));

    h.monitor.set_ambient_online(true);
    h.clock.advance(500);
    h.service.tick();

    assert_eq!(h.service.state(), SyncState::Idle);
    assert_eq!(h.service.stats().pending_operations, 0);

    let entity = stored_note(&h.store, 42).unwrap();
    assert!(!entity.dirty);
    assert_eq!(entity.field("title"), Some(&json!("written offline")));

    let done = h.service.queue().get(&op.operation_id).unwrap().unwrap();
    assert_eq!(done.status, OperationStatus::Completed);
}

#[test]
fn offline_updates_coalesce_into_one_upload() {
    let h = harness(ConflictPolicy::Suggested, false);
    put_note(
        &h.store,
        &SyncableEntity::new(7, 1, EntityType::Note, payload(&[("title", json!("v0"))]), 900_000),
    );

    h.service
        .record_local_update(1, EntityType::Note, 7, payload(&[("title", json!("v1"))]))
        .unwrap();
    h.service
        .record_local_update(
            1,
            EntityType::Note,
            7,
            payload(&[("title", json!("v2")), ("content", json!("body"))]),
        )
        .unwrap();
    assert_eq!(h.service.stats().pending_operations, 1);

    h.monitor.set_ambient_online(true);
    h.service.tick();

    let requests = h.primary.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].operations.len(), 1);
    let op = &requests[0].operations[0];
    assert_eq!(op.operation_type, OperationType::Update);
    assert_eq!(op.payload.get("title"), Some(&json!("v2")));
    assert_eq!(op.payload.get("content"), Some(&json!("body")));

    let entity = stored_note(&h.store, 7).unwrap();
    assert!(!entity.dirty);
}

#[test]
fn conflict_parks_engine_then_resolution_reuploads() {
    let h = harness(ConflictPolicy::Manual, true);
    h.store.put_meta("last_sync_time", "1400000").unwrap();

    let mut local = SyncableEntity::new(
        4,
        1,
        EntityType::Note,
        payload(&[("content", json!("my longer draft"))]),
        1_400_000,
    );
    local.apply_local_change(&Map::new(), 1_450_000);
    put_note(&h.store, &local);

    let server = SyncableEntity::new(
        4,
        1,
        EntityType::Note,
        payload(&[("content", json!("server edit"))]),
        1_460_000,
    );
    h.primary.script_fetch(Ok(PollResponse {
        success: true,
        updates: vec![ServerUpdate::upsert(server)],
        has_more: false,
        server_time: 2_000_000,
        suggested_interval: None,
    }));

    let report = h.service.sync_now().unwrap();
    assert_eq!(report.conflicts, 1);
    assert_eq!(h.service.state(), SyncState::Conflict);

    let record = &h.service.merge().conflicts()[0];
    assert!(record.conflicting_fields.contains("content"));
    assert_eq!(record.suggested_resolution, ResolutionStrategy::Merge);

    let resolved = h
        .service
        .resolve_conflict(EntityType::Note, 4, ResolutionStrategy::Merge)
        .unwrap();
    assert_eq!(resolved.field("content"), Some(&json!("my longer draft")));
    assert_eq!(h.service.state(), SyncState::Idle);

    // The merged content goes back up on the next pass
    let report = h.service.sync_now().unwrap();
    assert_eq!(report.uploaded, 1);
    let last = h.primary.requests().last().unwrap().clone();
    assert_eq!(
        last.operations[0].payload.get("content"),
        Some(&json!("my longer draft"))
    );
    assert!(!stored_note(&h.store, 4).unwrap().dirty);
}

#[test]
fn repeated_rejection_exhausts_retries_then_operator_revives() {
    let h = harness(ConflictPolicy::Suggested, true);
    let op = h
        .service
        .record_local_create(1, EntityType::Note, Map::new())
        .unwrap();

    // Default retry budget is 3
    for expected_retry in 1..=3u32 {
        h.primary.script_sync(Ok(SyncResponse::ok(
            vec![OperationResult::failure(
                op.operation_id.clone(),
                "validation failed",
            )],
            vec![],
            2_000_000,
        )
        .with_derived_status()));

        let report = h.service.sync_now().unwrap();
        assert_eq!(report.upload_failures, 1);
        let stored = h.service.queue().get(&op.operation_id).unwrap().unwrap();
        assert_eq!(stored.retry_count, expected_retry);
        if expected_retry < 3 {
            assert_eq!(stored.status, OperationStatus::Pending);
        } else {
            assert_eq!(stored.status, OperationStatus::Failed);
        }
    }

    // Terminally failed operations sit out further passes
    let report = h.service.sync_now().unwrap();
    assert_eq!(report.uploaded, 0);

    assert_eq!(h.service.queue().retry_failed(1).unwrap(), 1);
    h.primary.script_sync(Ok(SyncResponse::ok(
        vec![OperationResult::success(op.operation_id.clone(), Some(9))],
        vec![],
        2_100_000,
    )));
    let report = h.service.sync_now().unwrap();
    assert_eq!(report.uploaded, 1);
    assert!(stored_note(&h.store, 9).is_some());
}

#[test]
fn watermark_advances_only_after_successful_pass() {
    let h = harness(ConflictPolicy::Suggested, true);
    h.service.sync_now().unwrap();
    assert_eq!(
        h.store.get_meta("last_sync_time").unwrap(),
        Some("2000000".to_string())
    );

    h.service
        .record_local_create(1, EntityType::Note, Map::new())
        .unwrap();
    h.primary
        .script_sync(Err(SyncError::Network("reset".into())));
    assert!(h.service.sync_now().is_err());
    assert_eq!(
        h.store.get_meta("last_sync_time").unwrap(),
        Some("2000000".to_string())
    );
}

// A minimal in-memory sync server behind the duplex socket seam.
struct LoopbackSocket {
    clock: Arc<VirtualClock>,
    inbox: Mutex<VecDeque<ChannelMessage>>,
    next_id: Arc<AtomicI64>,
    server_time: i64,
}

impl DuplexSocket for LoopbackSocket {
    fn send(&self, frame: &ChannelMessage) -> SyncResult<()> {
        let mut inbox = self.inbox.lock();
        match frame {
            ChannelMessage::Auth { client_id, .. } => {
                inbox.push_back(ChannelMessage::Ack {
                    request_id: client_id.clone(),
                });
            }
            ChannelMessage::Sync { request } => {
                let results = request
                    .operations
                    .iter()
                    .map(|op| {
                        let assigned = match op.operation_type {
                            OperationType::Create => {
                                Some(self.next_id.fetch_add(1, Ordering::SeqCst))
                            }
                            _ => None,
                        };
                        OperationResult::success(op.operation_id.clone(), assigned)
                    })
                    .collect();
                inbox.push_back(ChannelMessage::SyncResponse {
                    request_id: request.request_id.clone(),
                    response: SyncResponse::ok(results, vec![], self.server_time),
                });
            }
            ChannelMessage::Ping { seq } => {
                inbox.push_back(ChannelMessage::Pong { seq: *seq });
            }
            _ => {}
        }
        Ok(())
    }

    fn recv_timeout(&self, timeout: Duration) -> SyncResult<Option<ChannelMessage>> {
        match self.inbox.lock().pop_front() {
            Some(frame) => Ok(Some(frame)),
            None => {
                self.clock.advance(timeout.as_millis() as i64);
                Ok(None)
            }
        }
    }
}

struct LoopbackConnector {
    clock: Arc<VirtualClock>,
    next_id: Arc<AtomicI64>,
}

impl SocketConnector for LoopbackConnector {
    type Socket = LoopbackSocket;

    fn open(&self, _url: &str) -> SyncResult<Self::Socket> {
        Ok(LoopbackSocket {
            clock: self.clock.clone(),
            inbox: Mutex::new(VecDeque::new()),
            next_id: self.next_id.clone(),
            server_time: 2_000_000,
        })
    }
}

#[test]
fn real_channel_transport_carries_a_full_pass() {
    init_tracing();
    let clock = Arc::new(VirtualClock::new(1_000_000));
    let store = Arc::new(MemoryStore::new());
    let monitor = Arc::new(ConnectivityMonitor::new(
        clock.clone(),
        Box::new(FlagProbe(AtomicBool::new(true))),
        true,
    ));
    let config = SyncConfig::new("client-1", "wss://sync.example.com", 1);

    let connector = LoopbackConnector {
        clock: clock.clone(),
        next_id: Arc::new(AtomicI64::new(100)),
    };
    let channel = Arc::new(ChannelTransport::new(
        connector,
        clock.clone(),
        config.clone(),
        Credentials::new("token-1"),
    ));
    let fallback = Arc::new(MockTransport::new(TransportKind::Polling));

    let service = SyncService::new(
        store.clone(),
        monitor,
        channel.clone(),
        fallback,
        clock.clone(),
        config,
    );

    service
        .record_local_create(1, EntityType::Note, payload(&[("title", json!("over the wire"))]))
        .unwrap();
    let report = service.sync_now().unwrap();

    assert_eq!(report.uploaded, 1);
    assert_eq!(service.state(), SyncState::Idle);
    assert_eq!(service.active_transport(), Some(TransportKind::Channel));

    let entity = stored_note(&store, 100).unwrap();
    assert_eq!(entity.field("title"), Some(&json!("over the wire")));
    assert!(!entity.dirty);

    // Heartbeats keep the loopback connection alive across quiet time
    for _ in 0..4 {
        clock.advance(30_000);
        service.tick();
        clock.advance(10_000);
        service.tick();
    }
    assert!(channel.is_connected());
}
