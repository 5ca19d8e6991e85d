//! Injectable time source.
//!
//! The cache, the registry, and the agent state model all read time through
//! [`Clock`] so tests can drive expiry and throttling without sleeping.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A monotonic-enough time source measured from an arbitrary epoch.
pub trait Clock: Send + Sync {
    fn now(&self) -> Duration;

    fn now_millis(&self) -> u64 {
        self.now().as_millis() as u64
    }
}

/// A clock that can also wait, used for fixed retry delays.
pub trait Timer: Clock {
    fn sleep(&self, duration: Duration);
}

/// Wall clock measured from the UNIX epoch.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
    }
}

impl Timer for SystemClock {
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Manually advanced clock for tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    millis: AtomicU64,
}

impl ManualClock {
    pub fn new(start: Duration) -> Self {
        Self {
            millis: AtomicU64::new(start.as_millis() as u64),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.millis.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set(&self, to: Duration) {
        self.millis.store(to.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_millis(self.millis.load(Ordering::SeqCst))
    }
}

impl Timer for ManualClock {
    /// Sleeping advances the clock instead of blocking.
    fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(Duration::from_secs(1));
        assert_eq!(clock.now_millis(), 1000);
        clock.advance(Duration::from_millis(250));
        assert_eq!(clock.now_millis(), 1250);
        clock.sleep(Duration::from_millis(750));
        assert_eq!(clock.now_millis(), 2000);
        clock.set(Duration::ZERO);
        assert_eq!(clock.now(), Duration::ZERO);
    }

    #[test]
    fn system_clock_is_after_epoch() {
        assert!(SystemClock.now() > Duration::from_secs(1_600_000_000));
    }
}
