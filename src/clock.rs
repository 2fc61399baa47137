//! Monotonic point-in-time values and an injectable clock.
//!
//! Production code reads the wall clock through [`SystemClock`]; tests swap
//! in [`TestClock`] so scenarios that depend on elapsed time (scheduled
//! deferred updates, memory-limit retries under load) are deterministic.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use time::OffsetDateTime;

/// A point in time with nanosecond resolution, monotonically comparable.
///
/// `Timestamp` does not carry a timezone; it is an opaque instant used only
/// for ordering and interval arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(i64);

impl Timestamp {
    /// Build a timestamp from raw nanoseconds since the Unix epoch.
    pub const fn from_nanos(nanos: i64) -> Self {
        Self(nanos)
    }

    /// Raw nanoseconds since the Unix epoch.
    pub const fn as_nanos(self) -> i64 {
        self.0
    }

    /// The next representable instant strictly after this one.
    pub fn after(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// The previous representable instant strictly before this one.
    pub fn before(self) -> Self {
        Self(self.0.saturating_sub(1))
    }

    /// The smallest representable timestamp.
    pub const MIN: Self = Self(i64::MIN);
    /// The largest representable timestamp.
    pub const MAX: Self = Self(i64::MAX);
}

/// Supplies the current instant. Implementations must be cheap and
/// thread-safe; the processor loop calls this on every batch and every
/// deferred-update check.
pub trait Clock: Send + Sync {
    /// The current instant.
    fn now(&self) -> Timestamp;
}

/// Wall-clock implementation backed by [`time::OffsetDateTime`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        let now = OffsetDateTime::now_utc();
        Timestamp::from_nanos(now.unix_timestamp_nanos() as i64)
    }
}

/// A settable clock for deterministic tests.
///
/// ```
/// use derived_values_engine::clock::{Clock, TestClock, Timestamp};
///
/// let clock = TestClock::new(Timestamp::from_nanos(0));
/// assert_eq!(clock.now(), Timestamp::from_nanos(0));
/// clock.advance_nanos(2_000_000_000);
/// assert_eq!(clock.now(), Timestamp::from_nanos(2_000_000_000));
/// ```
#[derive(Debug, Clone)]
pub struct TestClock {
    nanos: Arc<AtomicI64>,
}

impl TestClock {
    /// Create a clock fixed at `start`.
    pub fn new(start: Timestamp) -> Self {
        Self {
            nanos: Arc::new(AtomicI64::new(start.as_nanos())),
        }
    }

    /// Move the clock forward by `delta` nanoseconds.
    pub fn advance_nanos(&self, delta: i64) {
        self.nanos.fetch_add(delta, Ordering::SeqCst);
    }

    /// Set the clock to an explicit instant.
    pub fn set(&self, at: Timestamp) {
        self.nanos.store(at.as_nanos(), Ordering::SeqCst);
    }
}

impl Clock for TestClock {
    fn now(&self) -> Timestamp {
        Timestamp::from_nanos(self.nanos.load(Ordering::SeqCst))
    }
}

/// A half-open-or-instant span of time used to bound range queries.
///
/// `after` and `before` are exclusive bounds; `None` means unbounded on that
/// side. An interval where `after.after() == before` denotes a single instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interval {
    /// Exclusive lower bound, or unbounded below.
    pub after: Option<Timestamp>,
    /// Exclusive upper bound, or unbounded above.
    pub before: Option<Timestamp>,
}

impl Interval {
    /// The interval `(-inf, +inf)`.
    pub const UNBOUNDED: Self = Self {
        after: None,
        before: None,
    };

    /// An interval covering exactly one instant.
    pub fn instant(stamp: Timestamp) -> Self {
        Self {
            after: Some(stamp.before()),
            before: Some(stamp.after()),
        }
    }

    /// True if this interval denotes a single instant.
    pub fn is_instant(&self) -> bool {
        matches!((self.after, self.before), (Some(a), Some(b)) if a.after() == b.before())
    }

    /// The single instant this interval denotes, if any.
    pub fn instant_value(&self) -> Option<Timestamp> {
        self.is_instant().then(|| self.after.unwrap().after())
    }

    /// True if `stamp` lies strictly within this interval's bounds.
    pub fn contains(&self, stamp: Timestamp) -> bool {
        self.after.map_or(true, |a| stamp > a) && self.before.map_or(true, |b| stamp < b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_successor_predecessor() {
        let t = Timestamp::from_nanos(10);
        assert_eq!(t.after(), Timestamp::from_nanos(11));
        assert_eq!(t.before(), Timestamp::from_nanos(9));
    }

    #[test]
    fn interval_instant_round_trip() {
        let t = Timestamp::from_nanos(500);
        let iv = Interval::instant(t);
        assert!(iv.is_instant());
        assert_eq!(iv.instant_value(), Some(t));
        assert!(iv.contains(t));
        assert!(!iv.contains(t.after()));
    }

    #[test]
    fn test_clock_advances() {
        let clock = TestClock::new(Timestamp::from_nanos(0));
        assert_eq!(clock.now(), Timestamp::from_nanos(0));
        clock.advance_nanos(5);
        assert_eq!(clock.now(), Timestamp::from_nanos(5));
        clock.set(Timestamp::from_nanos(100));
        assert_eq!(clock.now(), Timestamp::from_nanos(100));
    }
}
