//! Clock & ID generation (§4.A).
//!
//! Every timestamp-bearing piece of logic in this crate routes through a
//! [`Clock`] so tests can inject a fake one instead of racing the wall clock.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, Ordering};
use uuid::Uuid;

/// Abstracts "what time is it" so the engine is deterministically testable.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Current UTC wall-clock time.
    fn now(&self) -> DateTime<Utc>;
}

/// Production clock: the real system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A manually advanceable clock for deterministic tests.
#[derive(Debug)]
pub struct FakeClock {
    // Stored as millis-since-epoch so the clock is `Sync` without a mutex.
    millis: AtomicI64,
}

impl FakeClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            millis: AtomicI64::new(start.timestamp_millis()),
        }
    }

    pub fn advance(&self, delta: chrono::Duration) {
        self.millis.fetch_add(delta.num_milliseconds(), Ordering::SeqCst);
    }

    pub fn set(&self, to: DateTime<Utc>) {
        self.millis.store(to.timestamp_millis(), Ordering::SeqCst);
    }
}

impl Clock for FakeClock {
    fn now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.millis.load(Ordering::SeqCst))
            .expect("fake clock millis always in range")
    }
}

/// Resolve an IANA timezone name, surfacing a clear error for bad input.
pub fn load_location(tz_name: &str) -> Result<Tz, String> {
    Tz::from_str(tz_name).map_err(|_| format!("unknown IANA timezone `{tz_name}`"))
}

/// Generate a unique, time-and-random job-run ID component.
///
/// Used wherever spec.md calls for "time-and-random" IDs that aren't the
/// `{scheduleID}-{unixSeconds}` run-ID format (§3 JobRun).
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}
