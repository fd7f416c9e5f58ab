//! Monotonic time source shared by the probe and the monitor.
//!
//! All timestamps in this crate are offsets from a fixed per-clock anchor,
//! never wall-clock readings.  Wall-clock adjustments (NTP slew, manual
//! changes) therefore cannot produce false stall detections.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// A non-decreasing time source, immune to system-time adjustments.
///
/// `now()` returns the elapsed time since the clock's anchor.  Readings from
/// the same clock instance are directly comparable; readings from different
/// instances are not.
pub trait MonotonicClock: std::fmt::Debug + Send + Sync + 'static {
    /// Current offset from the clock's anchor.
    fn now(&self) -> Duration;
}

/// Production clock backed by [`Instant`], anchored at construction.
#[derive(Debug)]
pub struct SystemClock {
    anchor: Instant,
}

impl SystemClock {
    #[must_use]
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

impl MonotonicClock for SystemClock {
    fn now(&self) -> Duration {
        self.anchor.elapsed()
    }
}

/// Manually advanced clock for deterministic tests.
///
/// Starts at zero and only moves when told to.  Thread-safe, so a test can
/// advance time while a monitor thread is polling.
#[derive(Debug, Default)]
pub struct ManualClock {
    micros: AtomicU64,
}

impl ManualClock {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Move the clock forward by `delta`.
    pub fn advance(&self, delta: Duration) {
        self.micros
            .fetch_add(delta.as_micros() as u64, Ordering::SeqCst);
    }

    /// Jump the clock to an absolute offset.  Never moves backwards.
    pub fn set(&self, offset: Duration) {
        self.micros
            .fetch_max(offset.as_micros() as u64, Ordering::SeqCst);
    }
}

impl MonotonicClock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_micros(self.micros.load(Ordering::SeqCst))
    }
}
