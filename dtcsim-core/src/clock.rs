use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Instant;

/// A monotonic millisecond time source. Release times, idle timeouts, and
/// keepalive deadlines are all expressed against this clock rather than wall
/// time, so a test can advance it without sleeping.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

/// The real clock, backed by [`Instant`] so it is immune to wall-clock
/// adjustments (NTP steps, DST, user changing the system time).
pub struct SystemClock {
    epoch: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        self.epoch.elapsed().as_millis() as i64
    }
}

/// A test double whose time only moves when told to. Used by unit tests that
/// need deterministic scheduling (percentile sampling, idle-timeout sweeps)
/// without real sleeps.
pub struct ManualClock {
    now_ms: AtomicI64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now_ms: AtomicI64::new(0),
        }
    }

    pub fn advance(&self, ms: i64) {
        self.now_ms.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn set(&self, ms: i64) {
        self.now_ms.store(ms, Ordering::SeqCst);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}
