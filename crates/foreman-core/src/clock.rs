//! Clock abstraction.
//!
//! Every time-based policy (retry delay, disable window, worker liveness,
//! eviction) reads time through [`Clock`], so tests can drive the pruner and
//! failure policy deterministically instead of sleeping.

use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::atomic::{AtomicU64, Ordering};

/// Source of the current instant.
pub trait Clock: Send + Sync {
    /// The current time.
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Simulated clock for deterministic tests. Time only moves when advanced.
#[derive(Debug)]
pub struct SimulatedClock {
    /// Base time (start of simulation).
    base: DateTime<Utc>,
    /// Elapsed milliseconds since base.
    elapsed_ms: AtomicU64,
}

impl SimulatedClock {
    /// Creates a simulated clock starting at the given time.
    pub fn new(base: DateTime<Utc>) -> Self {
        Self {
            base,
            elapsed_ms: AtomicU64::new(0),
        }
    }

    /// Creates a clock anchored at a fixed, readable epoch.
    pub fn deterministic() -> Self {
        Self::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())
    }

    /// Advances the clock by the given duration.
    pub fn advance(&self, duration: Duration) {
        let ms = duration.num_milliseconds().max(0) as u64;
        self.elapsed_ms.fetch_add(ms, Ordering::Relaxed);
    }

    /// Elapsed simulated time since the base instant.
    pub fn elapsed(&self) -> Duration {
        Duration::milliseconds(self.elapsed_ms.load(Ordering::Relaxed) as i64)
    }
}

impl Clock for SimulatedClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = self.elapsed_ms.load(Ordering::Relaxed);
        self.base + Duration::milliseconds(elapsed as i64)
    }
}
