//! Event timestamps and the clocks that produce them.

use std::{
    fmt,
    ops::{Add, Sub},
    sync::atomic::{AtomicI64, Ordering},
};

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Microseconds since the Unix epoch.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Smallest representable step.
    pub const TICK: i64 = 1;

    /// Raw microsecond count.
    #[must_use]
    pub const fn micros(self) -> i64 {
        self.0
    }

    /// Converts to a UTC date-time, if representable.
    #[must_use]
    pub fn to_datetime(self) -> Option<DateTime<Utc>> {
        Utc.timestamp_micros(self.0).single()
    }
}

impl Add<i64> for Timestamp {
    type Output = Self;

    fn add(self, rhs: i64) -> Self {
        Self(self.0.saturating_add(rhs))
    }
}

impl Sub<i64> for Timestamp {
    type Output = Self;

    fn sub(self, rhs: i64) -> Self {
        Self(self.0.saturating_sub(rhs))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_datetime() {
            Some(at) => write!(f, "{}", at.format("%H:%M:%S%.6f")),
            None => write!(f, "{}us", self.0),
        }
    }
}

/// Source of event timestamps.
pub trait Clock: Send + Sync {
    /// Returns the current instant. Successive calls never go backwards.
    fn now(&self) -> Timestamp;
}

/// Wall clock that never hands out the same tick twice.
#[derive(Debug, Default)]
pub struct SystemClock {
    last: AtomicI64,
}

impl SystemClock {
    /// Creates a clock.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            last: AtomicI64::new(0),
        }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        let wall = Utc::now().timestamp_micros();
        let previous = self
            .last
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| {
                Some(wall.max(last + Timestamp::TICK))
            })
            .unwrap_or_else(|last| last);
        Timestamp(wall.max(previous + Timestamp::TICK))
    }
}

/// Deterministic clock advancing by one tick on every read.
#[derive(Debug)]
pub struct ManualClock {
    current: AtomicI64,
}

impl ManualClock {
    /// Starts at `start`.
    #[must_use]
    pub const fn starting_at(start: i64) -> Self {
        Self {
            current: AtomicI64::new(start),
        }
    }

    /// Jumps forward without producing a reading.
    pub fn advance(&self, delta: i64) {
        self.current.fetch_add(delta, Ordering::AcqRel);
    }

    /// Value the next reading will return.
    #[must_use]
    pub fn peek(&self) -> Timestamp {
        Timestamp(self.current.load(Ordering::Acquire))
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::starting_at(1_000)
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        Timestamp(self.current.fetch_add(Timestamp::TICK, Ordering::AcqRel))
    }
}
