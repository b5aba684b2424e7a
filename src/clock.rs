//! Time sources.
//!
//! Timers are driven from a monotonic [`Instant`]; timestamps that leave the
//! process (telemetry events, summary `updated_at`) come from the wall clock.
//! Both are read through [`Clock`] so tests can advance time by hand.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub trait Clock: Send + Sync {
    /// Monotonic time used for flush deadlines.
    fn now(&self) -> Instant;
    /// Wall-clock time used for emitted timestamps.
    fn wall(&self) -> DateTime<Utc>;

    /// Wall-clock time in milliseconds since the Unix epoch.
    fn wall_millis(&self) -> i64 {
        self.wall().timestamp_millis()
    }
}

/// The real clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn wall(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    base_instant: Instant,
    base_wall: DateTime<Utc>,
    elapsed: Mutex<Duration>,
}

impl ManualClock {
    pub fn new(base_wall: DateTime<Utc>) -> Self {
        Self {
            base_instant: Instant::now(),
            base_wall,
            elapsed: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut elapsed) = self.elapsed.lock() {
            *elapsed += by;
        }
    }

    fn elapsed(&self) -> Duration {
        self.elapsed.lock().map(|e| *e).unwrap_or_default()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(DateTime::<Utc>::UNIX_EPOCH)
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base_instant + self.elapsed()
    }

    fn wall(&self) -> DateTime<Utc> {
        let elapsed = ChronoDuration::from_std(self.elapsed()).unwrap_or(ChronoDuration::zero());
        self.base_wall + elapsed
    }
}
