//! Time utilities for Cast Streaming
//!
//! Provides the clock abstraction the protocol engine reads "now" from, and
//! the alarm deadline type components use to schedule their own wake-ups.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Source of monotonic time
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// The operating system's monotonic clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    #[inline]
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A clock that only moves when told to
///
/// Clones share the same time, so a test can hold one handle while the
/// components under test read from another.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<Instant>>,
}

impl ManualClock {
    pub fn new(start: Instant) -> Self {
        ManualClock {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by;
    }

    /// Jump to `to`; never moves backward
    pub fn set(&self, to: Instant) {
        let mut now = self.now.lock();
        if to > *now {
            *now = to;
        }
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Instant::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock()
    }
}

/// A single cancelable deadline
///
/// An alarm does not call anything by itself. Its owner reports the deadline
/// to whoever drives the event loop and checks `take_if_due` when woken, so
/// disarming the owner disarms the alarm with it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Alarm {
    deadline: Option<Instant>,
}

impl Alarm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm (or re-arm) the alarm for `deadline`
    pub fn schedule(&mut self, deadline: Instant) {
        self.deadline = Some(deadline);
    }

    /// Arm for `deadline` unless already armed for something earlier
    pub fn schedule_no_later_than(&mut self, deadline: Instant) {
        match self.deadline {
            Some(current) if current <= deadline => {}
            _ => self.deadline = Some(deadline),
        }
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Disarm and return true if the deadline has been reached
    pub fn take_if_due(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if deadline <= now => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }

    /// Time left until the deadline, zero if already due
    pub fn time_until(&self, now: Instant) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_monotonic() {
        let clock = SystemClock;
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }

    #[test]
    fn test_manual_clock_shared() {
        let start = Instant::now();
        let clock = ManualClock::new(start);
        let handle = clock.clone();
        handle.advance(Duration::from_millis(25));
        assert_eq!(clock.now(), start + Duration::from_millis(25));

        clock.set(start);
        assert_eq!(handle.now(), start + Duration::from_millis(25));
        clock.set(start + Duration::from_secs(1));
        assert_eq!(handle.now(), start + Duration::from_secs(1));
    }

    #[test]
    fn test_alarm_lifecycle() {
        let now = Instant::now();
        let mut alarm = Alarm::new();
        assert!(!alarm.is_armed());
        assert!(!alarm.take_if_due(now));

        alarm.schedule(now + Duration::from_millis(10));
        assert_eq!(alarm.time_until(now), Some(Duration::from_millis(10)));
        assert!(!alarm.take_if_due(now));
        assert!(alarm.take_if_due(now + Duration::from_millis(10)));
        assert!(!alarm.is_armed());

        alarm.schedule(now);
        alarm.cancel();
        assert!(!alarm.take_if_due(now + Duration::from_secs(1)));
    }

    #[test]
    fn test_alarm_no_later_than() {
        let now = Instant::now();
        let mut alarm = Alarm::new();
        alarm.schedule_no_later_than(now + Duration::from_millis(50));
        alarm.schedule_no_later_than(now + Duration::from_millis(80));
        assert_eq!(alarm.deadline(), Some(now + Duration::from_millis(50)));
        alarm.schedule_no_later_than(now + Duration::from_millis(20));
        assert_eq!(alarm.deadline(), Some(now + Duration::from_millis(20)));
    }
}
