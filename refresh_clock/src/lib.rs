//! Wall-clock timing utilities for expiring values
//!
//! Credentials and tokens carry absolute, wall-clock expirations. The types in
//! this crate represent those instants at millisecond resolution and allow the
//! source of "now" to be swapped out, so that code making decisions based on
//! the current time can be tested without sleeping.

#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    missing_copy_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unused_must_use
)]
#![forbid(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_cfg))]

use std::{
    fmt, ops,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, SystemTime},
};

#[cfg(feature = "serde")]
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Unix time with millisecond resolution
///
/// Represented as the number of milliseconds elapsed since the beginning of
/// the Unix epoch on 1970/01/01 at 00:00:00 UTC. Arithmetic saturates rather
/// than wrapping, so subtracting a later time yields the epoch or a zero
/// duration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Ord, PartialOrd, Hash)]
#[repr(transparent)]
pub struct UnixTime(pub u64);

impl UnixTime {
    /// The beginning of the Unix epoch
    pub const EPOCH: UnixTime = UnixTime(0);

    /// Constructs a time from whole seconds since the epoch
    #[inline]
    pub const fn from_secs(secs: u64) -> Self {
        Self(secs.saturating_mul(1000))
    }

    /// Milliseconds since the epoch
    #[inline]
    pub const fn as_millis(self) -> u64 {
        self.0
    }

    /// Whole seconds since the epoch
    #[inline]
    pub const fn as_secs(self) -> u64 {
        self.0 / 1000
    }

    /// The amount of time from `earlier` until `self`, or zero if `earlier` is
    /// actually later
    #[inline]
    pub fn saturating_duration_since(self, earlier: UnixTime) -> Duration {
        Duration::from_millis(self.0.saturating_sub(earlier.0))
    }

    /// The amount of time from `earlier` until `self`, or `None` if `earlier`
    /// is later than `self`
    #[inline]
    pub fn checked_duration_since(self, earlier: UnixTime) -> Option<Duration> {
        self.0.checked_sub(earlier.0).map(Duration::from_millis)
    }
}

fn duration_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl ops::Add<Duration> for UnixTime {
    type Output = UnixTime;

    #[inline]
    fn add(self, rhs: Duration) -> Self::Output {
        UnixTime(self.0.saturating_add(duration_millis(rhs)))
    }
}

impl ops::AddAssign<Duration> for UnixTime {
    #[inline]
    fn add_assign(&mut self, rhs: Duration) {
        *self = *self + rhs;
    }
}

impl ops::Sub<Duration> for UnixTime {
    type Output = UnixTime;

    #[inline]
    fn sub(self, rhs: Duration) -> Self::Output {
        UnixTime(self.0.saturating_sub(duration_millis(rhs)))
    }
}

impl ops::Sub for UnixTime {
    type Output = Duration;

    #[inline]
    fn sub(self, rhs: UnixTime) -> Self::Output {
        self.saturating_duration_since(rhs)
    }
}

impl From<SystemTime> for UnixTime {
    #[inline]
    fn from(t: SystemTime) -> Self {
        let since_epoch = t
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);

        UnixTime(duration_millis(since_epoch))
    }
}

impl From<UnixTime> for SystemTime {
    #[inline]
    fn from(t: UnixTime) -> Self {
        SystemTime::UNIX_EPOCH + Duration::from_millis(t.0)
    }
}

impl fmt::Display for UnixTime {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{:03}", self.0 / 1000, self.0 % 1000)
    }
}

#[cfg(feature = "serde")]
#[cfg_attr(docsrs, doc(cfg(feature = "serde")))]
impl Serialize for UnixTime {
    #[inline]
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

#[cfg(feature = "serde")]
#[cfg_attr(docsrs, doc(cfg(feature = "serde")))]
impl<'de> Deserialize<'de> for UnixTime {
    #[inline]
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let ms = u64::deserialize(deserializer)?;
        Ok(Self(ms))
    }
}

/// Represents a clock, which can tell the current time
pub trait Clock {
    /// Gets the current time according to this clock
    fn now(&self) -> UnixTime;
}

impl<C: Clock + ?Sized> Clock for &C {
    #[inline]
    fn now(&self) -> UnixTime {
        (**self).now()
    }
}

impl<C: Clock + ?Sized> Clock for Arc<C> {
    #[inline]
    fn now(&self) -> UnixTime {
        (**self).now()
    }
}

/// The system clock as provided by `std::time::SystemTime`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct System;

impl Clock for System {
    #[inline]
    fn now(&self) -> UnixTime {
        UnixTime::from(SystemTime::now())
    }
}

/// A test clock which maintains the current time as shared internal state
///
/// Clones share the same time, so a test can keep one handle and advance it
/// while another handle is owned by the code under test.
#[derive(Clone, Debug, Default)]
pub struct TestClock(Arc<AtomicU64>);

impl Clock for TestClock {
    #[inline]
    fn now(&self) -> UnixTime {
        UnixTime(self.0.load(Ordering::SeqCst))
    }
}

impl TestClock {
    /// Creates a new test clock with the specified time
    #[inline]
    pub fn new(time: UnixTime) -> Self {
        Self(Arc::new(AtomicU64::new(time.0)))
    }

    /// Updates the clock's current time to `val`
    pub fn set(&self, val: UnixTime) {
        self.0.store(val.0, Ordering::SeqCst);
    }

    /// Advances the clock's current time by `inc`
    pub fn advance(&self, inc: Duration) {
        self.0.fetch_add(duration_millis(inc), Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subtraction_saturates_at_zero() {
        let early = UnixTime(1_000);
        let late = UnixTime(1_500);

        assert_eq!(late - early, Duration::from_millis(500));
        assert_eq!(early - late, Duration::ZERO);
        assert_eq!(early.checked_duration_since(late), None);
        assert_eq!(early - Duration::from_secs(5), UnixTime::EPOCH);
    }

    #[test]
    fn system_time_round_trips_at_millisecond_resolution() {
        let t = UnixTime(1_640_438_400_123);
        assert_eq!(UnixTime::from(SystemTime::from(t)), t);
    }

    #[test]
    fn times_before_epoch_clamp_to_epoch() {
        let before = SystemTime::UNIX_EPOCH - Duration::from_secs(10);
        assert_eq!(UnixTime::from(before), UnixTime::EPOCH);
    }

    #[test]
    fn test_clock_clones_share_time() {
        let clock = TestClock::new(UnixTime::from_secs(100));
        let handle = clock.clone();

        handle.advance(Duration::from_millis(250));
        assert_eq!(clock.now(), UnixTime(100_250));

        handle.set(UnixTime::EPOCH);
        assert_eq!(clock.now(), UnixTime::EPOCH);
    }

    #[test]
    fn display_shows_fractional_seconds() {
        assert_eq!(UnixTime(12_034).to_string(), "12.034");
    }
}
