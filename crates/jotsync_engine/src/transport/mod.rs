//! Transport carriers for the sync protocol.
//!
//! Two carriers exist: a persistent duplex channel (preferred) and an
//! HTTP-style polling fallback. Both speak the same logical contract
//! behind the [`Transport`] trait, so the engine above never cares
//! which one is active.

mod channel;
mod polling;

pub use channel::{ChannelState, ChannelTransport, DuplexSocket, SocketConnector};
pub use polling::{PollClient, PollError, PollStatus, PollingTransport};

use crate::error::{SyncError, SyncResult};
use jotsync_protocol::{ConflictRecord, PollResponse, ServerUpdate, SyncRequest, SyncResponse};
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

/// Which carrier a transport is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Persistent duplex channel.
    Channel,
    /// HTTP polling fallback.
    Polling,
}

/// Credentials presented during the auth handshake.
#[derive(Debug, Clone)]
pub struct Credentials {
    /// Session token.
    pub token: String,
}

impl Credentials {
    /// Creates credentials from a token.
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

/// Out-of-band happenings a transport reports to the engine.
///
/// Drained on every engine tick; the transport never calls back into
/// the engine directly.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A server-side entity delta arrived outside a sync response.
    Update(ServerUpdate),
    /// The server reported a conflict outside a sync response.
    Conflict(ConflictRecord),
    /// The carrier lost its connection.
    ConnectionLost,
    /// The carrier (re)established its connection.
    ConnectionRestored,
    /// The server rejected our credentials; fatal for this carrier.
    AuthRejected,
}

/// A carrier for the sync protocol.
pub trait Transport: Send + Sync {
    /// Which carrier this is.
    fn kind(&self) -> TransportKind;

    /// Establishes the carrier (opens and authenticates a channel, or
    /// starts the polling loop).
    fn connect(&self) -> SyncResult<()>;

    /// Tears the carrier down.
    fn disconnect(&self);

    /// Returns true if the carrier is currently usable.
    fn is_connected(&self) -> bool;

    /// Performs a request/response sync round trip.
    fn sync(&self, request: &SyncRequest) -> SyncResult<SyncResponse>;

    /// Fetches server deltas since a watermark. `None` asks for
    /// everything (full fetch).
    fn fetch_updates(&self, since: Option<i64>) -> SyncResult<PollResponse>;

    /// Advances timer-driven behavior (heartbeats, reconnect backoff,
    /// the polling interval) to `now_ms`.
    fn tick(&self, now_ms: i64);

    /// Drains accumulated out-of-band events.
    fn drain_events(&self) -> Vec<TransportEvent>;
}

/// A scriptable in-memory transport for tests.
///
/// Responses are queued ahead of time; requests are recorded for
/// later inspection. With no scripted response, `sync` echoes an
/// all-success answer and `fetch_updates` comes back empty.
pub struct MockTransport {
    kind: TransportKind,
    connected: AtomicBool,
    fail_connect: AtomicBool,
    sync_script: RwLock<VecDeque<SyncResult<SyncResponse>>>,
    fetch_script: RwLock<VecDeque<SyncResult<PollResponse>>>,
    requests: RwLock<Vec<SyncRequest>>,
    fetches: RwLock<Vec<Option<i64>>>,
    events: RwLock<Vec<TransportEvent>>,
    server_time: RwLock<i64>,
}

impl MockTransport {
    /// Creates a disconnected mock of the given kind.
    pub fn new(kind: TransportKind) -> Self {
        Self {
            kind,
            connected: AtomicBool::new(false),
            fail_connect: AtomicBool::new(false),
            sync_script: RwLock::new(VecDeque::new()),
            fetch_script: RwLock::new(VecDeque::new()),
            requests: RwLock::new(Vec::new()),
            fetches: RwLock::new(Vec::new()),
            events: RwLock::new(Vec::new()),
            server_time: RwLock::new(1),
        }
    }

    /// Sets the server time used for default responses.
    pub fn set_server_time(&self, server_time: i64) {
        *self.server_time.write() = server_time;
    }

    /// Makes the next `connect` calls fail.
    pub fn fail_connections(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    /// Queues the answer for the next `sync` call.
    pub fn script_sync(&self, response: SyncResult<SyncResponse>) {
        self.sync_script.write().push_back(response);
    }

    /// Queues the answer for the next `fetch_updates` call.
    pub fn script_fetch(&self, response: SyncResult<PollResponse>) {
        self.fetch_script.write().push_back(response);
    }

    /// Injects an out-of-band event.
    pub fn push_event(&self, event: TransportEvent) {
        self.events.write().push(event);
    }

    /// The sync requests seen so far.
    pub fn requests(&self) -> Vec<SyncRequest> {
        self.requests.read().clone()
    }

    /// The `since` watermarks of fetches seen so far.
    pub fn fetches(&self) -> Vec<Option<i64>> {
        self.fetches.read().clone()
    }
}

impl Transport for MockTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn connect(&self) -> SyncResult<()> {
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(SyncError::Connection("scripted connect failure".into()));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn sync(&self, request: &SyncRequest) -> SyncResult<SyncResponse> {
        if !self.is_connected() {
            return Err(SyncError::NotConnected);
        }
        self.requests.write().push(request.clone());

        if let Some(scripted) = self.sync_script.write().pop_front() {
            return scripted;
        }

        let results = request
            .operations
            .iter()
            .map(|op| jotsync_protocol::OperationResult::success(op.operation_id.clone(), None))
            .collect();
        Ok(SyncResponse::ok(results, vec![], *self.server_time.read()))
    }

    fn fetch_updates(&self, since: Option<i64>) -> SyncResult<PollResponse> {
        if !self.is_connected() {
            return Err(SyncError::NotConnected);
        }
        self.fetches.write().push(since);

        if let Some(scripted) = self.fetch_script.write().pop_front() {
            return scripted;
        }
        Ok(PollResponse::empty(*self.server_time.read()))
    }

    fn tick(&self, _now_ms: i64) {}

    fn drain_events(&self) -> Vec<TransportEvent> {
        std::mem::take(&mut *self.events.write())
    }
}
