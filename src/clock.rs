//! Injectable time source.
//!
//! The queue and scheduler never call [`Utc::now`] directly; they read time
//! through a [`Clock`] so that timing-sensitive behaviour (delayed dispatch,
//! retry backoff, recurrence evaluation) can be tested deterministically with
//! a [`ManualClock`] instead of wall-clock waits.

use std::sync::{Arc, RwLock};

use chrono::{DateTime, TimeDelta, Utc};

/// A monotone source of the current time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The wall clock. Used unless a test clock is injected.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A manually advanced clock for deterministic tests.
///
/// Clones share the same underlying instant, so a clock handed to a
/// [`crate::JobQueue`] can still be advanced from the test body.
///
/// # Example
///
/// ```
/// use taskmill::clock::{Clock, ManualClock};
/// use chrono::{TimeDelta, Utc};
///
/// let clock = ManualClock::at(Utc::now());
/// let start = clock.now();
/// clock.advance(TimeDelta::seconds(60));
/// assert_eq!(clock.now() - start, TimeDelta::seconds(60));
/// ```
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<RwLock<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(RwLock::new(now)),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        if let Ok(mut guard) = self.now.write() {
            *guard = now;
        }
    }

    pub fn advance(&self, delta: TimeDelta) {
        if let Ok(mut guard) = self.now.write() {
            *guard += delta;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.read().map(|now| *now).unwrap_or_else(|_| Utc::now())
    }
}
