//! HTTP polling fallback transport.
//!
//! Used when the duplex channel cannot be established. Polls the
//! server on a self-tuning interval: updates shrink it, quiet polls
//! grow it, and it always stays inside the configured clamp. The
//! server may also suggest an interval, which is clamped the same
//! way.

use crate::clock::{Clock, Timer};
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::transport::{Transport, TransportEvent, TransportKind};
use jotsync_protocol::{PollRequest, PollResponse, SyncRequest, SyncResponse};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// A transport-level polling failure.
#[derive(Debug, Clone)]
pub struct PollError {
    /// HTTP status, if the request reached the server.
    pub status: Option<u16>,
    /// Failure detail.
    pub message: String,
    /// Server-requested delay before the next attempt (429).
    pub retry_after: Option<Duration>,
}

impl PollError {
    /// A failure below the HTTP layer (DNS, connect, reset).
    pub fn network(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
            retry_after: None,
        }
    }

    /// An HTTP error status.
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            message: message.into(),
            retry_after: None,
        }
    }

    /// Attaches a Retry-After delay.
    pub fn with_retry_after(mut self, delay: Duration) -> Self {
        self.retry_after = Some(delay);
        self
    }
}

/// The HTTP client seam for the polling carrier.
pub trait PollClient: Send + Sync {
    /// GET-style delta poll.
    fn poll(&self, request: &PollRequest) -> Result<PollResponse, PollError>;

    /// POST-style sync request.
    fn push(&self, request: &SyncRequest) -> Result<SyncResponse, PollError>;
}

/// Lifecycle of the polling carrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStatus {
    /// Not polling.
    Idle,
    /// Background polls are scheduled.
    Polling,
    /// Gave up after repeated failures or an auth rejection.
    Error,
}

struct PollInner {
    status: PollStatus,
    interval: Duration,
    failures: u32,
    timer: Timer,
    watermark: Option<i64>,
    events: VecDeque<TransportEvent>,
}

/// The polling carrier.
pub struct PollingTransport<C: PollClient> {
    client: C,
    clock: Arc<dyn Clock>,
    config: SyncConfig,
    inner: Mutex<PollInner>,
}

impl<C: PollClient> PollingTransport<C> {
    /// Creates an idle polling transport.
    pub fn new(client: C, clock: Arc<dyn Clock>, config: SyncConfig) -> Self {
        let interval = config.poll.initial_interval;
        Self {
            client,
            clock,
            config,
            inner: Mutex::new(PollInner {
                status: PollStatus::Idle,
                interval,
                failures: 0,
                timer: Timer::idle(),
                watermark: None,
                events: VecDeque::new(),
            }),
        }
    }

    /// The current carrier status.
    pub fn status(&self) -> PollStatus {
        self.inner.lock().status
    }

    /// The current poll interval.
    pub fn interval(&self) -> Duration {
        self.inner.lock().interval
    }

    /// Seeds the watermark used for background polls.
    pub fn set_watermark(&self, since: Option<i64>) {
        self.inner.lock().watermark = since;
    }

    fn classify(err: PollError) -> SyncError {
        match err.status {
            Some(401) | Some(403) => SyncError::Auth(err.message),
            Some(429) => SyncError::RateLimited {
                retry_after_ms: err.retry_after.map(|d| d.as_millis() as u64),
            },
            Some(status) if status >= 500 => {
                SyncError::Network(format!("server error {status}: {}", err.message))
            }
            Some(status) => {
                SyncError::Protocol(format!("unexpected status {status}: {}", err.message))
            }
            None => SyncError::Network(err.message),
        }
    }

    fn poll_once(&self, inner: &mut PollInner, now: i64) {
        let request = PollRequest {
            client_id: self.config.client_id.clone(),
            since: inner.watermark,
        };

        match self.client.poll(&request) {
            Ok(response) if response.success => self.apply_success(inner, now, response),
            Ok(_) => self.apply_failure(inner, now, "poll reported failure"),
            Err(err) => match err.status {
                Some(401) | Some(403) => {
                    // Credentials are bad; retrying cannot help
                    warn!("poll rejected with auth failure; stopping");
                    inner.status = PollStatus::Error;
                    inner.timer.cancel();
                    inner.events.push_back(TransportEvent::AuthRejected);
                }
                Some(429) => {
                    let delay = err
                        .retry_after
                        .unwrap_or(self.config.poll.max_interval);
                    debug!(delay_ms = delay.as_millis() as u64, "rate limited; honoring retry-after");
                    inner.timer.schedule(now + delay.as_millis() as i64);
                }
                _ => self.apply_failure(inner, now, &err.message),
            },
        }
    }

    fn apply_success(&self, inner: &mut PollInner, now: i64, response: PollResponse) {
        inner.failures = 0;
        inner.watermark = Some(response.server_time);

        let had_updates = !response.updates.is_empty();
        for update in response.updates {
            inner.events.push_back(TransportEvent::Update(update));
        }

        let next = if let Some(suggested) = response.suggested_interval {
            Duration::from_millis(suggested)
        } else if had_updates || response.has_more {
            inner.interval.mul_f64(self.config.poll.speed_up)
        } else {
            inner.interval.mul_f64(self.config.poll.slow_down)
        };
        inner.interval = self.config.poll.clamp(next);
        inner.timer.schedule(now + inner.interval.as_millis() as i64);
    }

    fn apply_failure(&self, inner: &mut PollInner, now: i64, message: &str) {
        inner.failures += 1;
        warn!(failures = inner.failures, message, "poll failed");

        if inner.failures >= self.config.poll.max_failures {
            inner.status = PollStatus::Error;
            inner.timer.cancel();
            inner.events.push_back(TransportEvent::ConnectionLost);
            return;
        }

        inner.interval = self
            .config
            .poll
            .clamp(inner.interval.mul_f64(self.config.poll.slow_down));
        inner.timer.schedule(now + inner.interval.as_millis() as i64);
    }
}

impl<C: PollClient> Transport for PollingTransport<C> {
    fn kind(&self) -> TransportKind {
        TransportKind::Polling
    }

    fn connect(&self) -> SyncResult<()> {
        let mut inner = self.inner.lock();
        inner.status = PollStatus::Polling;
        inner.failures = 0;
        inner.interval = self.config.poll.initial_interval;
        inner.timer.schedule(self.clock.now_ms());
        Ok(())
    }

    fn disconnect(&self) {
        let mut inner = self.inner.lock();
        inner.status = PollStatus::Idle;
        inner.timer.cancel();
    }

    fn is_connected(&self) -> bool {
        self.inner.lock().status == PollStatus::Polling
    }

    fn sync(&self, request: &SyncRequest) -> SyncResult<SyncResponse> {
        self.client.push(request).map_err(Self::classify)
    }

    fn fetch_updates(&self, since: Option<i64>) -> SyncResult<PollResponse> {
        let request = PollRequest {
            client_id: self.config.client_id.clone(),
            since,
        };
        let response = self.client.poll(&request).map_err(Self::classify)?;
        if response.success {
            self.inner.lock().watermark = Some(response.server_time);
        }
        Ok(response)
    }

    fn tick(&self, now_ms: i64) {
        let mut inner = self.inner.lock();
        if inner.status != PollStatus::Polling {
            return;
        }
        if inner.timer.fire_if_due(now_ms) {
            self.poll_once(&mut inner, now_ms);
        }
    }

    fn drain_events(&self) -> Vec<TransportEvent> {
        self.inner.lock().events.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::VirtualClock;
    use jotsync_protocol::{EntityType, ServerUpdate, SyncableEntity};
    use serde_json::Map;

    struct ScriptedClient {
        polls: Mutex<VecDeque<Result<PollResponse, PollError>>>,
        pushes: Mutex<VecDeque<Result<SyncResponse, PollError>>>,
        seen: Mutex<Vec<PollRequest>>,
    }

    impl ScriptedClient {
        fn new() -> Self {
            Self {
                polls: Mutex::new(VecDeque::new()),
                pushes: Mutex::new(VecDeque::new()),
                seen: Mutex::new(Vec::new()),
            }
        }

        fn script_poll(&self, result: Result<PollResponse, PollError>) {
            self.polls.lock().push_back(result);
        }
    }

    impl PollClient for &ScriptedClient {
        fn poll(&self, request: &PollRequest) -> Result<PollResponse, PollError> {
            self.seen.lock().push(request.clone());
            self.polls
                .lock()
                .pop_front()
                .unwrap_or_else(|| Ok(PollResponse::empty(1)))
        }

        fn push(&self, _request: &SyncRequest) -> Result<SyncResponse, PollError> {
            self.pushes
                .lock()
                .pop_front()
                .unwrap_or_else(|| Ok(SyncResponse::ok(vec![], vec![], 1)))
        }
    }

    fn update() -> ServerUpdate {
        ServerUpdate::upsert(SyncableEntity::new(
            7,
            1,
            EntityType::Note,
            Map::new(),
            100,
        ))
    }

    fn with_updates(server_time: i64) -> PollResponse {
        PollResponse {
            success: true,
            updates: vec![update()],
            has_more: false,
            server_time,
            suggested_interval: None,
        }
    }

    fn transport(client: &ScriptedClient) -> (Arc<VirtualClock>, PollingTransport<&ScriptedClient>) {
        let clock = Arc::new(VirtualClock::new(0));
        let config = SyncConfig::new("client-1", "https://sync.example.com", 1);
        (clock.clone(), PollingTransport::new(client, clock, config))
    }

    #[test]
    fn connect_schedules_an_immediate_poll() {
        let client = ScriptedClient::new();
        client.script_poll(Ok(with_updates(500)));
        let (clock, t) = transport(&client);

        t.connect().unwrap();
        assert!(t.is_connected());
        t.tick(clock.now_ms());

        let events = t.drain_events();
        assert!(matches!(&events[0], TransportEvent::Update(u) if u.entity_id == 7));
    }

    #[test]
    fn interval_speeds_up_on_updates_and_slows_when_quiet() {
        let client = ScriptedClient::new();
        let (clock, t) = transport(&client);
        t.connect().unwrap();

        // Empty poll: 15s * 1.5 = 22.5s
        t.tick(clock.now_ms());
        assert_eq!(t.interval(), Duration::from_millis(22_500));

        // Poll with updates: 22.5s * 0.5 = 11.25s
        client.script_poll(Ok(with_updates(600)));
        clock.advance(22_500);
        t.tick(clock.now_ms());
        assert_eq!(t.interval(), Duration::from_millis(11_250));
    }

    #[test]
    fn interval_clamps_at_both_bounds() {
        let client = ScriptedClient::new();
        let (clock, t) = transport(&client);
        t.connect().unwrap();

        // Quiet polls push toward the 120s ceiling
        for _ in 0..12 {
            t.tick(clock.now_ms());
            clock.advance(t.interval().as_millis() as i64);
        }
        assert_eq!(t.interval(), Duration::from_secs(120));

        // Busy polls push toward the 5s floor
        for _ in 0..12 {
            client.script_poll(Ok(with_updates(700)));
            t.tick(clock.now_ms());
            clock.advance(t.interval().as_millis() as i64);
        }
        assert_eq!(t.interval(), Duration::from_secs(5));
    }

    #[test]
    fn server_suggested_interval_is_clamped() {
        let client = ScriptedClient::new();
        client.script_poll(Ok(PollResponse {
            suggested_interval: Some(1_000),
            ..PollResponse::empty(100)
        }));
        let (clock, t) = transport(&client);
        t.connect().unwrap();

        t.tick(clock.now_ms());
        // 1s suggestion clamps up to the 5s floor
        assert_eq!(t.interval(), Duration::from_secs(5));
    }

    #[test]
    fn watermark_advances_with_server_time() {
        let client = ScriptedClient::new();
        client.script_poll(Ok(with_updates(900)));
        let (clock, t) = transport(&client);
        t.connect().unwrap();

        t.tick(clock.now_ms());
        clock.advance(t.interval().as_millis() as i64);
        t.tick(clock.now_ms());

        let seen = client.seen.lock();
        assert_eq!(seen[0].since, None);
        assert_eq!(seen[1].since, Some(900));
    }

    #[test]
    fn auth_rejection_stops_polling() {
        let client = ScriptedClient::new();
        client.script_poll(Err(PollError::http(401, "expired")));
        let (clock, t) = transport(&client);
        t.connect().unwrap();

        t.tick(clock.now_ms());
        assert_eq!(t.status(), PollStatus::Error);
        assert!(t.drain_events().contains(&TransportEvent::AuthRejected));

        // No more polls happen
        clock.advance(1_000_000);
        t.tick(clock.now_ms());
        assert_eq!(client.seen.lock().len(), 1);
    }

    #[test]
    fn rate_limit_honors_retry_after() {
        let client = ScriptedClient::new();
        client.script_poll(Err(
            PollError::http(429, "slow down").with_retry_after(Duration::from_secs(42))
        ));
        let (clock, t) = transport(&client);
        t.connect().unwrap();

        t.tick(clock.now_ms());
        assert_eq!(t.status(), PollStatus::Polling);

        // Just before the retry-after delay: nothing
        clock.advance(41_999);
        t.tick(clock.now_ms());
        assert_eq!(client.seen.lock().len(), 1);

        clock.advance(1);
        t.tick(clock.now_ms());
        assert_eq!(client.seen.lock().len(), 2);
    }

    #[test]
    fn repeated_failures_back_off_then_give_up() {
        let client = ScriptedClient::new();
        let (clock, t) = transport(&client);
        t.connect().unwrap();

        // max_failures is 5
        for i in 0..5 {
            client.script_poll(Err(PollError::network("reset")));
            t.tick(clock.now_ms());
            if i < 4 {
                assert_eq!(t.status(), PollStatus::Polling);
                clock.advance(t.interval().as_millis() as i64);
            }
        }

        assert_eq!(t.status(), PollStatus::Error);
        assert!(t.drain_events().contains(&TransportEvent::ConnectionLost));
    }

    #[test]
    fn success_resets_the_failure_count() {
        let client = ScriptedClient::new();
        let (clock, t) = transport(&client);
        t.connect().unwrap();

        for _ in 0..3 {
            client.script_poll(Err(PollError::network("reset")));
            t.tick(clock.now_ms());
            clock.advance(t.interval().as_millis() as i64);
        }
        // A success wipes the slate
        t.tick(clock.now_ms());
        clock.advance(t.interval().as_millis() as i64);

        for _ in 0..3 {
            client.script_poll(Err(PollError::network("reset")));
            t.tick(clock.now_ms());
            clock.advance(t.interval().as_millis() as i64);
        }
        assert_eq!(t.status(), PollStatus::Polling);
    }

    #[test]
    fn fetch_and_sync_classify_errors() {
        let client = ScriptedClient::new();
        client.script_poll(Err(PollError::http(503, "maintenance")));
        let (_, t) = transport(&client);

        assert!(matches!(
            t.fetch_updates(Some(100)),
            Err(SyncError::Network(_))
        ));

        client.script_poll(Err(PollError::http(400, "bad request")));
        assert!(matches!(
            t.fetch_updates(None),
            Err(SyncError::Protocol(_))
        ));

        client
            .pushes
            .lock()
            .push_back(Err(PollError::http(429, "busy")
                .with_retry_after(Duration::from_secs(3))));
        let request = SyncRequest::new(
            "client-1",
            jotsync_protocol::ClientState {
                last_sync_time: 0,
                pending_operations: 0,
            },
            vec![],
        );
        assert!(matches!(
            t.sync(&request),
            Err(SyncError::RateLimited {
                retry_after_ms: Some(3000)
            })
        ));
    }
}
