//! Testability seam for time (§9.1)
//!
//! `Core` takes a `Clock` rather than calling `SystemTime::now()` /
//! `Instant::now()` inline, so tests can drive deterministic time.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

pub trait Clock: Send + Sync {
    fn now_secs(&self) -> u64;
    fn now(&self) -> Instant;
}

#[derive(Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_secs(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }

    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Deterministic clock for tests: `now_secs` is a settable counter,
/// `now()` still reflects wall-clock `Instant` since `Instant` cannot
/// be fabricated, but callers needing pure determinism should prefer
/// `now_secs` based assertions.
pub struct FakeClock {
    secs: AtomicU64,
    epoch: Instant,
}

impl FakeClock {
    pub fn new(start_secs: u64) -> Self {
        Self { secs: AtomicU64::new(start_secs), epoch: Instant::now() }
    }

    pub fn advance(&self, delta_secs: u64) {
        self.secs.fetch_add(delta_secs, Ordering::SeqCst);
    }

    pub fn set(&self, secs: u64) {
        self.secs.store(secs, Ordering::SeqCst);
    }
}

impl Clock for FakeClock {
    fn now_secs(&self) -> u64 {
        self.secs.load(Ordering::SeqCst)
    }

    fn now(&self) -> Instant {
        self.epoch
    }
}
