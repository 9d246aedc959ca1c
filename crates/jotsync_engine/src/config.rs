//! Configuration for the sync engine.

use jotsync_protocol::ConflictPolicy;
use std::time::Duration;

/// Top-level configuration for the sync engine.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Stable per-device client identifier.
    pub client_id: String,
    /// Server URL (duplex endpoint; the polling endpoint derives
    /// from it).
    pub server_url: String,
    /// User whose entities and queued operations this engine syncs.
    /// Queue reads are scoped to this owner, so several engines can
    /// share one store without draining each other's queues.
    pub owner_id: i64,
    /// Maximum operations uploaded per batch.
    pub batch_size: usize,
    /// Timeout for a request/response round trip.
    pub request_timeout: Duration,
    /// Timeout for the auth handshake after a socket opens.
    pub auth_timeout: Duration,
    /// Heartbeat configuration for the duplex carrier.
    pub heartbeat: HeartbeatConfig,
    /// Reconnect backoff configuration.
    pub retry: RetryConfig,
    /// Polling carrier configuration.
    pub poll: PollConfig,
    /// Tolerance window for conflict-resolution suggestions. Edits
    /// closer together than this are treated as simultaneous (clock
    /// skew makes timestamps unreliable below it).
    pub conflict_skew_window: Duration,
    /// How conflicts from a merge pass are handled.
    pub conflict_policy: ConflictPolicy,
    /// Upload attempts per queued operation before it becomes
    /// terminally failed.
    pub queue_max_retries: u32,
    /// Completed queue items older than this are purged.
    pub completed_max_age: Duration,
}

impl SyncConfig {
    /// Creates a configuration with defaults for the given device,
    /// server, and owning user.
    pub fn new(
        client_id: impl Into<String>,
        server_url: impl Into<String>,
        owner_id: i64,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            server_url: server_url.into(),
            owner_id,
            batch_size: 50,
            request_timeout: Duration::from_secs(30),
            auth_timeout: Duration::from_secs(10),
            heartbeat: HeartbeatConfig::default(),
            retry: RetryConfig::default(),
            poll: PollConfig::default(),
            conflict_skew_window: Duration::from_secs(60),
            conflict_policy: ConflictPolicy::Suggested,
            queue_max_retries: 3,
            completed_max_age: Duration::from_secs(24 * 60 * 60),
        }
    }

    /// Sets the upload batch size.
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Sets the request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the auth handshake timeout.
    pub fn with_auth_timeout(mut self, timeout: Duration) -> Self {
        self.auth_timeout = timeout;
        self
    }

    /// Sets the heartbeat configuration.
    pub fn with_heartbeat(mut self, heartbeat: HeartbeatConfig) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    /// Sets the reconnect backoff configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the polling configuration.
    pub fn with_poll(mut self, poll: PollConfig) -> Self {
        self.poll = poll;
        self
    }

    /// Sets the conflict skew window.
    pub fn with_conflict_skew_window(mut self, window: Duration) -> Self {
        self.conflict_skew_window = window;
        self
    }

    /// Sets the conflict policy.
    pub fn with_conflict_policy(mut self, policy: ConflictPolicy) -> Self {
        self.conflict_policy = policy;
        self
    }

    /// Sets the per-operation retry limit.
    pub fn with_queue_max_retries(mut self, max: u32) -> Self {
        self.queue_max_retries = max;
        self
    }
}

/// Heartbeat configuration for the duplex carrier.
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatConfig {
    /// Interval between pings.
    pub interval: Duration,
    /// How long to wait for a pong before counting a miss.
    pub timeout: Duration,
    /// Consecutive misses that force a reconnect.
    pub max_missed: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(10),
            max_missed: 3,
        }
    }
}

/// Reconnect backoff configuration.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum reconnect attempts. Zero means unbounded.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Cap on the computed delay.
    pub max_delay: Duration,
    /// Multiplier applied per attempt.
    pub multiplier: f64,
    /// Whether to add up to 25% random jitter.
    pub jitter: bool,
}

impl RetryConfig {
    /// Creates a configuration with the given attempt bound.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true,
        }
    }

    /// Sets the base delay.
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Sets the delay cap.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Disables jitter (deterministic delays for tests).
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Returns true if another attempt is allowed after `attempt`
    /// failures.
    pub fn allows_attempt(&self, attempt: u32) -> bool {
        self.max_attempts == 0 || attempt < self.max_attempts
    }

    /// Computes the delay before attempt number `attempt`
    /// (0-indexed): `base * multiplier^attempt`, capped, plus jitter.
    ///
    /// The pre-jitter delay is monotonically non-decreasing in
    /// `attempt` and never exceeds `max_delay`; jitter adds at most
    /// 25% of the capped value.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = self.multiplier.powi(attempt.min(63) as i32);
        let raw = self.base_delay.as_secs_f64() * exp;
        let capped = raw.min(self.max_delay.as_secs_f64());

        if self.jitter {
            let jitter = capped * 0.25 * rand::random::<f64>();
            Duration::from_secs_f64(capped + jitter)
        } else {
            Duration::from_secs_f64(capped)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(10)
    }
}

/// Polling carrier configuration.
#[derive(Debug, Clone)]
pub struct PollConfig {
    /// Interval used when polling starts.
    pub initial_interval: Duration,
    /// Lower clamp; the interval never drops below this.
    pub min_interval: Duration,
    /// Upper clamp; the interval never rises above this.
    pub max_interval: Duration,
    /// Factor applied when updates were present (interval shrinks).
    pub speed_up: f64,
    /// Factor applied when a poll came back empty (interval grows).
    pub slow_down: f64,
    /// Consecutive transient failures before the carrier goes to its
    /// error state.
    pub max_failures: u32,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(15),
            min_interval: Duration::from_secs(5),
            max_interval: Duration::from_secs(120),
            speed_up: 0.5,
            slow_down: 1.5,
            max_failures: 5,
        }
    }
}

impl PollConfig {
    /// Clamps an interval to the configured bounds.
    pub fn clamp(&self, interval: Duration) -> Duration {
        interval.max(self.min_interval).min(self.max_interval)
    }
}
