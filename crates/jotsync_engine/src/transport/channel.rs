//! Persistent duplex-channel transport.
//!
//! Maintains one long-lived authenticated socket. Liveness is
//! heartbeat-based: pings go out on an interval, and enough
//! consecutive missed pongs force a reconnect even though the socket
//! still looks open. Reconnects back off exponentially with jitter.

use crate::clock::{Clock, Timer};
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::transport::{Credentials, Transport, TransportEvent, TransportKind};
use jotsync_protocol::{ChannelMessage, PollResponse, SyncRequest, SyncResponse};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, info, warn};

/// A bidirectional framed socket.
///
/// Implementations wrap a websocket or similar. `recv_timeout` with a
/// zero timeout must act as a non-blocking drain.
pub trait DuplexSocket: Send + Sync {
    /// Sends one frame.
    fn send(&self, frame: &ChannelMessage) -> SyncResult<()>;

    /// Waits up to `timeout` for one frame. `Ok(None)` means the
    /// timeout elapsed quietly; `Err` means the socket is dead.
    fn recv_timeout(&self, timeout: Duration) -> SyncResult<Option<ChannelMessage>>;
}

/// Opens sockets to the sync server.
pub trait SocketConnector: Send + Sync {
    /// The socket type produced.
    type Socket: DuplexSocket;

    /// Opens a socket to `url`.
    fn open(&self, url: &str) -> SyncResult<Self::Socket>;
}

/// Lifecycle of the channel carrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// No socket, and no reconnect scheduled.
    Disconnected,
    /// Socket open and authenticated.
    Connected,
    /// Socket lost; a backoff timer is running toward the next
    /// connection attempt.
    Reconnecting,
}

struct Inner<S: DuplexSocket> {
    socket: Option<S>,
    state: ChannelState,
    next_seq: u64,
    outstanding_ping: Option<(u64, i64)>,
    missed_pongs: u32,
    heartbeat: Timer,
    reconnect: Timer,
    reconnect_attempt: u32,
    events: VecDeque<TransportEvent>,
}

impl<S: DuplexSocket> Inner<S> {
    fn new() -> Self {
        Self {
            socket: None,
            state: ChannelState::Disconnected,
            next_seq: 0,
            outstanding_ping: None,
            missed_pongs: 0,
            heartbeat: Timer::idle(),
            reconnect: Timer::idle(),
            reconnect_attempt: 0,
            events: VecDeque::new(),
        }
    }
}

/// The duplex-channel carrier.
pub struct ChannelTransport<C: SocketConnector> {
    connector: C,
    clock: std::sync::Arc<dyn Clock>,
    config: SyncConfig,
    credentials: Credentials,
    inner: Mutex<Inner<C::Socket>>,
}

impl<C: SocketConnector> ChannelTransport<C> {
    /// Creates a disconnected channel transport.
    pub fn new(
        connector: C,
        clock: std::sync::Arc<dyn Clock>,
        config: SyncConfig,
        credentials: Credentials,
    ) -> Self {
        Self {
            connector,
            clock,
            config,
            credentials,
            inner: Mutex::new(Inner::new()),
        }
    }

    /// The current channel lifecycle state.
    pub fn state(&self) -> ChannelState {
        self.inner.lock().state
    }

    /// Opens a socket and runs the auth handshake.
    ///
    /// Frames that arrive before the auth answer (pushed updates from
    /// a previous session) are dispatched normally, not dropped.
    fn establish(&self, inner: &mut Inner<C::Socket>) -> SyncResult<()> {
        let socket = self.connector.open(&self.config.server_url)?;

        socket.send(&ChannelMessage::Auth {
            client_id: self.config.client_id.clone(),
            token: self.credentials.token.clone(),
        })?;

        let deadline = self.clock.now_ms() + self.config.auth_timeout.as_millis() as i64;
        loop {
            let remaining = deadline - self.clock.now_ms();
            if remaining <= 0 {
                return Err(SyncError::Timeout("auth acknowledgment".into()));
            }

            match socket.recv_timeout(Duration::from_millis(remaining as u64))? {
                Some(ChannelMessage::Ack { .. }) => break,
                Some(ChannelMessage::Error { code, message }) if code == "auth_failed" => {
                    inner.events.push_back(TransportEvent::AuthRejected);
                    return Err(SyncError::Auth(message));
                }
                Some(frame) => {
                    // No socket stored yet, so pongs are answered here
                    if let ChannelMessage::Ping { seq } = frame {
                        socket.send(&ChannelMessage::Pong { seq })?;
                    } else {
                        self.buffer_passive(inner, frame);
                    }
                }
                None => {}
            }
        }

        let now = self.clock.now_ms();
        inner.socket = Some(socket);
        inner.state = ChannelState::Connected;
        inner.outstanding_ping = None;
        inner.missed_pongs = 0;
        inner.reconnect_attempt = 0;
        inner.reconnect.cancel();
        inner
            .heartbeat
            .schedule(now + self.config.heartbeat.interval.as_millis() as i64);
        inner.events.push_back(TransportEvent::ConnectionRestored);
        info!(client_id = %self.config.client_id, "channel connected");
        Ok(())
    }

    /// Handles a frame that is not the answer being waited for.
    fn dispatch(&self, inner: &mut Inner<C::Socket>, frame: ChannelMessage) -> SyncResult<()> {
        match frame {
            ChannelMessage::Ping { seq } => {
                if let Some(socket) = &inner.socket {
                    socket.send(&ChannelMessage::Pong { seq })?;
                }
            }
            ChannelMessage::Pong { seq } => {
                if inner.outstanding_ping.map(|(s, _)| s) == Some(seq) {
                    inner.outstanding_ping = None;
                    inner.missed_pongs = 0;
                }
            }
            ChannelMessage::Error { code, message } if code == "auth_failed" => {
                inner.events.push_back(TransportEvent::AuthRejected);
                return Err(SyncError::Auth(message));
            }
            other => self.buffer_passive(inner, other),
        }
        Ok(())
    }

    /// Frames that carry data rather than demand a reply.
    fn buffer_passive(&self, inner: &mut Inner<C::Socket>, frame: ChannelMessage) {
        match frame {
            ChannelMessage::ServerUpdate { update } => {
                inner.events.push_back(TransportEvent::Update(update));
            }
            ChannelMessage::Conflict { conflict } => {
                inner.events.push_back(TransportEvent::Conflict(conflict));
            }
            ChannelMessage::StatusChange { status } => {
                debug!(status, "server status change");
            }
            other => {
                warn!(tag = other.tag(), "unexpected frame; dropping");
            }
        }
    }

    /// Tears the connection down and schedules a backoff reconnect.
    fn drop_connection(&self, inner: &mut Inner<C::Socket>) {
        inner.socket = None;
        inner.outstanding_ping = None;
        inner.heartbeat.cancel();

        if inner.state == ChannelState::Connected {
            inner.events.push_back(TransportEvent::ConnectionLost);
        }

        if self.config.retry.allows_attempt(inner.reconnect_attempt) {
            let delay = self
                .config
                .retry
                .delay_for_attempt(inner.reconnect_attempt);
            inner.reconnect_attempt += 1;
            inner.state = ChannelState::Reconnecting;
            inner
                .reconnect
                .schedule(self.clock.now_ms() + delay.as_millis() as i64);
            info!(
                attempt = inner.reconnect_attempt,
                delay_ms = delay.as_millis() as u64,
                "channel lost; reconnect scheduled"
            );
        } else {
            inner.state = ChannelState::Disconnected;
            inner.reconnect.cancel();
            warn!("channel lost and reconnect attempts exhausted");
        }
    }

    fn drain_socket(&self, inner: &mut Inner<C::Socket>) {
        loop {
            let received = match &inner.socket {
                Some(socket) => socket.recv_timeout(Duration::ZERO),
                None => return,
            };
            match received {
                Ok(Some(frame)) => {
                    if self.dispatch(inner, frame).is_err() {
                        self.drop_connection(inner);
                        return;
                    }
                }
                Ok(None) => return,
                Err(_) => {
                    self.drop_connection(inner);
                    return;
                }
            }
        }
    }

    fn heartbeat_tick(&self, inner: &mut Inner<C::Socket>, now: i64) {
        if let Some((_, deadline)) = inner.outstanding_ping {
            if now >= deadline {
                inner.outstanding_ping = None;
                inner.missed_pongs += 1;
                warn!(missed = inner.missed_pongs, "heartbeat pong missed");

                if inner.missed_pongs >= self.config.heartbeat.max_missed {
                    // The socket looks open but the peer is gone
                    self.drop_connection(inner);
                    return;
                }
            }
        }

        if inner.heartbeat.fire_if_due(now) {
            let seq = inner.next_seq;
            inner.next_seq += 1;

            let sent = match &inner.socket {
                Some(socket) => socket.send(&ChannelMessage::Ping { seq }),
                None => Err(SyncError::NotConnected),
            };
            if sent.is_err() {
                self.drop_connection(inner);
                return;
            }

            inner.outstanding_ping =
                Some((seq, now + self.config.heartbeat.timeout.as_millis() as i64));
            inner
                .heartbeat
                .schedule(now + self.config.heartbeat.interval.as_millis() as i64);
        }
    }
}

impl<C: SocketConnector> Transport for ChannelTransport<C> {
    fn kind(&self) -> TransportKind {
        TransportKind::Channel
    }

    fn connect(&self) -> SyncResult<()> {
        let mut inner = self.inner.lock();
        if inner.state == ChannelState::Connected {
            return Ok(());
        }
        self.establish(&mut inner)
    }

    fn disconnect(&self) {
        let mut inner = self.inner.lock();
        let was_connected = inner.state == ChannelState::Connected;
        inner.socket = None;
        inner.state = ChannelState::Disconnected;
        inner.outstanding_ping = None;
        inner.heartbeat.cancel();
        inner.reconnect.cancel();
        inner.reconnect_attempt = 0;
        if was_connected {
            inner.events.push_back(TransportEvent::ConnectionLost);
        }
    }

    fn is_connected(&self) -> bool {
        self.inner.lock().state == ChannelState::Connected
    }

    fn sync(&self, request: &SyncRequest) -> SyncResult<SyncResponse> {
        let mut inner = self.inner.lock();
        if inner.state != ChannelState::Connected {
            return Err(SyncError::NotConnected);
        }

        let send_result = match &inner.socket {
            Some(socket) => socket.send(&ChannelMessage::Sync {
                request: request.clone(),
            }),
            None => Err(SyncError::NotConnected),
        };
        if send_result.is_err() {
            self.drop_connection(&mut inner);
            return Err(SyncError::ConnectionClosed);
        }

        let deadline = self.clock.now_ms() + self.config.request_timeout.as_millis() as i64;
        loop {
            let remaining = deadline - self.clock.now_ms();
            if remaining <= 0 {
                return Err(SyncError::Timeout("sync response".into()));
            }

            let received = match &inner.socket {
                Some(socket) => socket.recv_timeout(Duration::from_millis(remaining as u64)),
                None => return Err(SyncError::ConnectionClosed),
            };

            match received {
                Ok(Some(ChannelMessage::SyncResponse {
                    request_id,
                    response,
                })) if request_id == request.request_id => return Ok(response),
                Ok(Some(frame)) => {
                    if let Err(err) = self.dispatch(&mut inner, frame) {
                        self.drop_connection(&mut inner);
                        return Err(err);
                    }
                }
                Ok(None) => {}
                Err(_) => {
                    // The in-flight request dies with the connection;
                    // it stays queued and is retried after reconnect
                    self.drop_connection(&mut inner);
                    return Err(SyncError::ConnectionClosed);
                }
            }
        }
    }

    fn fetch_updates(&self, since: Option<i64>) -> SyncResult<PollResponse> {
        // The channel has no dedicated download call; an empty sync
        // request returns deltas since the given watermark.
        let request = SyncRequest::new(
            &self.config.client_id,
            jotsync_protocol::ClientState {
                last_sync_time: since.unwrap_or(0),
                pending_operations: 0,
            },
            vec![],
        );
        let response = self.sync(&request)?;
        Ok(PollResponse {
            success: true,
            updates: response.server_updates,
            has_more: false,
            server_time: response.server_time,
            suggested_interval: None,
        })
    }

    fn tick(&self, now_ms: i64) {
        let mut inner = self.inner.lock();
        match inner.state {
            ChannelState::Connected => {
                self.drain_socket(&mut inner);
                if inner.state == ChannelState::Connected {
                    self.heartbeat_tick(&mut inner, now_ms);
                }
            }
            ChannelState::Reconnecting => {
                if inner.reconnect.fire_if_due(now_ms) {
                    match self.establish(&mut inner) {
                        Ok(()) => {}
                        Err(SyncError::Auth(_)) => {
                            inner.state = ChannelState::Disconnected;
                            inner.reconnect.cancel();
                        }
                        Err(err) => {
                            debug!(%err, "reconnect attempt failed");
                            self.drop_connection(&mut inner);
                        }
                    }
                }
            }
            ChannelState::Disconnected => {}
        }
    }

    fn drain_events(&self) -> Vec<TransportEvent> {
        self.inner.lock().events.drain(..).collect()
    }
}
