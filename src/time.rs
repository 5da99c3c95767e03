use std::time::{Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

/// Wall-clock epoch milliseconds, used for persisted timestamps.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Monotonic clock in fractional seconds.
///
/// The rate limiter takes the clock as a trait object so bucket refill can be
/// driven by a controlled timeline in tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> f64;
}

/// Process clock anchored at construction.
pub struct SystemClock {
    anchor: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            anchor: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        self.anchor.elapsed().as_secs_f64()
    }
}

/// Clock advanced by hand.
pub struct ManualClock {
    now: Mutex<f64>,
}

impl ManualClock {
    pub fn new(start: f64) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, secs: f64) {
        *self.now.lock() += secs;
    }

    pub fn set(&self, secs: f64) {
        *self.now.lock() = secs;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> f64 {
        *self.now.lock()
    }
}
