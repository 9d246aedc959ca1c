//! Connectivity monitoring.
//!
//! Tracks reachability for the rest of the engine. Two signals feed
//! it: the ambient online flag reported by the platform, and an
//! active probe. The probe wins — platforms routinely report
//! "online" for a link that cannot reach the sync server, and that
//! discrepancy is exactly what triggers the fallback to a degraded
//! transport.

use crate::clock::Clock;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// An active reachability probe.
///
/// Implementations hit a known endpoint (HEAD request, TCP connect)
/// rather than trusting the platform's reachability flag.
pub trait Probe: Send + Sync {
    /// Returns true if the network is actually reachable.
    fn check(&self) -> bool;

    /// Measures round-trip latency to a target, if reachable.
    fn latency_ms(&self, target: &str) -> Option<u64>;
}

/// Identifier handed out by [`ConnectivityMonitor::subscribe`].
pub type SubscriptionId = u64;

type ConnectivityCallback = Arc<dyn Fn(bool) + Send + Sync>;

/// Tracks reachability and broadcasts transitions.
///
/// Broadcast is edge-triggered: subscribers hear about each
/// transition exactly once, no matter how often the current state is
/// re-reported.
pub struct ConnectivityMonitor {
    clock: Arc<dyn Clock>,
    probe: Box<dyn Probe>,
    online: AtomicBool,
    last_online_at: AtomicI64,
    last_offline_at: AtomicI64,
    next_subscription: AtomicU64,
    subscribers: RwLock<Vec<(SubscriptionId, ConnectivityCallback)>>,
}

impl ConnectivityMonitor {
    /// Creates a monitor with the given initial state.
    pub fn new(clock: Arc<dyn Clock>, probe: Box<dyn Probe>, initially_online: bool) -> Self {
        Self {
            clock,
            probe,
            online: AtomicBool::new(initially_online),
            last_online_at: AtomicI64::new(0),
            last_offline_at: AtomicI64::new(0),
            next_subscription: AtomicU64::new(1),
            subscribers: RwLock::new(Vec::new()),
        }
    }

    /// The currently perceived connectivity.
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// When the monitor last transitioned to online (unix ms, 0 if
    /// never).
    pub fn last_online_at(&self) -> i64 {
        self.last_online_at.load(Ordering::SeqCst)
    }

    /// When the monitor last transitioned to offline (unix ms, 0 if
    /// never).
    pub fn last_offline_at(&self) -> i64 {
        self.last_offline_at.load(Ordering::SeqCst)
    }

    /// Registers a callback invoked once per connectivity transition
    /// with the new state.
    pub fn subscribe(&self, callback: impl Fn(bool) + Send + Sync + 'static) -> SubscriptionId {
        let id = self.next_subscription.fetch_add(1, Ordering::SeqCst);
        self.subscribers.write().push((id, Arc::new(callback)));
        id
    }

    /// Removes a subscription. Returns true if it existed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.write();
        let before = subscribers.len();
        subscribers.retain(|(sub_id, _)| *sub_id != id);
        subscribers.len() != before
    }

    /// Feeds the platform's ambient online/offline flag.
    pub fn set_ambient_online(&self, ambient_online: bool) {
        self.transition_to(ambient_online);
    }

    /// Runs the active probe and reconciles perceived connectivity.
    ///
    /// A failed probe downgrades connectivity even if the platform
    /// still reports online; the discrepancy is logged, never
    /// silently ignored, because it is the trigger for the degraded
    /// transport.
    pub fn check_connectivity(&self) -> bool {
        let reachable = self.probe.check();
        let perceived = self.is_online();

        if perceived && !reachable {
            warn!("platform reports online but active probe failed; downgrading connectivity");
        } else if !perceived && reachable {
            info!("active probe succeeded while perceived offline; upgrading connectivity");
        }

        self.transition_to(reachable);
        reachable
    }

    /// Measures round-trip latency to a target.
    pub fn measure_latency(&self, target: &str) -> Option<Duration> {
        let latency = self.probe.latency_ms(target).map(Duration::from_millis);
        debug!(target, ?latency, "latency probe");
        latency
    }

    fn transition_to(&self, online: bool) {
        let previous = self.online.swap(online, Ordering::SeqCst);
        if previous == online {
            return;
        }

        let now = self.clock.now_ms();
        if online {
            self.last_online_at.store(now, Ordering::SeqCst);
            info!("connectivity restored");
        } else {
            self.last_offline_at.store(now, Ordering::SeqCst);
            info!("connectivity lost");
        }

        // Snapshot before invoking: a callback may subscribe or
        // unsubscribe, and the lock is not reentrant
        let callbacks: Vec<ConnectivityCallback> = self
            .subscribers
            .read()
            .iter()
            .map(|(_, callback)| callback.clone())
            .collect();
        for callback in callbacks {
            callback(online);
        }
    }
}
