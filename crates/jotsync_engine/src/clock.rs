//! Injectable time source and deadline timers.
//!
//! All timer-driven behavior in the engine (heartbeat, polling
//! interval, reconnect backoff) is deadline-based: a component stores
//! the instant its next action is due and advances on `tick(now)`.
//! Tests inject a [`VirtualClock`] and step time explicitly, so every
//! timing path runs deterministically.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// A source of wall-clock time in unix milliseconds.
pub trait Clock: Send + Sync {
    /// The current time (unix ms).
    fn now_ms(&self) -> i64;
}

/// The real system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64
    }
}

/// A manually advanced clock for deterministic tests.
#[derive(Debug, Default)]
pub struct VirtualClock {
    now: AtomicI64,
}

impl VirtualClock {
    /// Creates a clock starting at the given time.
    pub fn new(start_ms: i64) -> Self {
        Self {
            now: AtomicI64::new(start_ms),
        }
    }

    /// Moves time forward.
    pub fn advance(&self, ms: i64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }

    /// Sets the absolute time.
    pub fn set(&self, ms: i64) {
        self.now.store(ms, Ordering::SeqCst);
    }
}

impl Clock for VirtualClock {
    fn now_ms(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// A cancellable deadline owned by the component that scheduled it.
#[derive(Debug, Default, Clone, Copy)]
pub struct Timer {
    deadline_ms: Option<i64>,
}

impl Timer {
    /// An unscheduled timer.
    pub fn idle() -> Self {
        Self { deadline_ms: None }
    }

    /// Schedules the timer for an absolute instant.
    pub fn schedule(&mut self, at_ms: i64) {
        self.deadline_ms = Some(at_ms);
    }

    /// Cancels the timer.
    pub fn cancel(&mut self) {
        self.deadline_ms = None;
    }

    /// Returns true if the timer is scheduled.
    pub fn is_scheduled(&self) -> bool {
        self.deadline_ms.is_some()
    }

    /// Returns the scheduled instant, if any.
    pub fn deadline(&self) -> Option<i64> {
        self.deadline_ms
    }

    /// Returns true if the timer is scheduled and due at `now`.
    pub fn is_due(&self, now_ms: i64) -> bool {
        self.deadline_ms.is_some_and(|at| now_ms >= at)
    }

    /// Cancels and returns true if the timer was due; leaves it
    /// untouched otherwise. The usual `tick()` pattern:
    ///
    /// ```rust
    /// # use jotsync_engine::Timer;
    /// # let mut timer = Timer::idle();
    /// # let now = 100;
    /// if timer.fire_if_due(now) {
    ///     // perform the action, reschedule if periodic
    /// }
    /// ```
    pub fn fire_if_due(&mut self, now_ms: i64) -> bool {
        if self.is_due(now_ms) {
            self.deadline_ms = None;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_clock_is_monotonic_enough() {
        let clock = SystemClock;
        let a = clock.now_ms();
        let b = clock.now_ms();
        assert!(b >= a);
        assert!(a > 1_600_000_000_000); // after Sep 2020, sanity
    }

    #[test]
    fn virtual_clock_advances() {
        let clock = VirtualClock::new(1000);
        assert_eq!(clock.now_ms(), 1000);

        clock.advance(250);
        assert_eq!(clock.now_ms(), 1250);

        clock.set(5000);
        assert_eq!(clock.now_ms(), 5000);
    }

    #[test]
    fn timer_lifecycle() {
        let mut timer = Timer::idle();
        assert!(!timer.is_scheduled());
        assert!(!timer.is_due(i64::MAX));

        timer.schedule(100);
        assert!(timer.is_scheduled());
        assert!(!timer.is_due(99));
        assert!(timer.is_due(100));
        assert!(timer.is_due(101));

        timer.cancel();
        assert!(!timer.is_due(101));
    }

    #[test]
    fn fire_if_due_consumes_once() {
        let mut timer = Timer::idle();
        timer.schedule(100);

        assert!(!timer.fire_if_due(50));
        assert!(timer.is_scheduled());

        assert!(timer.fire_if_due(150));
        assert!(!timer.is_scheduled());
        assert!(!timer.fire_if_due(150));
    }
}
