use std::{sync::Arc, time::Duration};

use refresh_clock::{Clock, UnixTime};
use serde::{Deserialize, Serialize};

/// A value that may only be used until some point in time
///
/// The cache never looks past this trait at the payload it is holding.
pub trait Expiring {
    /// The instant after which the value must no longer be used, if known
    fn expiration(&self) -> Option<UnixTime>;
}

impl<T: Expiring + ?Sized> Expiring for Arc<T> {
    #[inline]
    fn expiration(&self) -> Option<UnixTime> {
        (**self).expiration()
    }
}

impl<T: Expiring + ?Sized> Expiring for Box<T> {
    #[inline]
    fn expiration(&self) -> Option<UnixTime> {
        (**self).expiration()
    }
}

/// An arbitrary payload paired with an optional expiration
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExpiringValue<T> {
    value: T,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expiration: Option<UnixTime>,
}

impl<T> ExpiringValue<T> {
    /// Wraps a value that expires at `expiration`
    pub fn new(value: T, expiration: UnixTime) -> Self {
        Self {
            value,
            expiration: Some(expiration),
        }
    }

    /// Wraps a value with no known expiration
    ///
    /// Such a value is always considered stale, so a cache holding it will
    /// retrieve a new one on every request.
    pub fn without_expiration(value: T) -> Self {
        Self {
            value,
            expiration: None,
        }
    }

    /// Wraps a value that expires `valid_for` from the current time on `clock`
    pub fn valid_for<C: Clock>(value: T, valid_for: Duration, clock: &C) -> Self {
        Self::new(value, clock.now() + valid_for)
    }

    /// Gets the wrapped value
    #[inline]
    pub fn value(&self) -> &T {
        &self.value
    }

    /// Unwraps the value, discarding its expiration
    #[inline]
    pub fn into_value(self) -> T {
        self.value
    }
}

impl<T> Expiring for ExpiringValue<T> {
    #[inline]
    fn expiration(&self) -> Option<UnixTime> {
        self.expiration
    }
}

/// How close a cached value is to its expiration
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Staleness {
    /// The value is valid and outside of the prefetch window
    Fresh,
    /// The value may still be handed out, but a replacement should be fetched
    /// in the background
    PrefetchEligible,
    /// The value must not be handed out until it has been replaced
    Stale,
}

/// Classifies a value expiring at `expiration` as of `now`
///
/// Values with no expiration are always stale. Otherwise, with `remaining`
/// being the time left until expiration, a value is stale when
/// `remaining <= stale`, prefetch-eligible when `remaining <= prefetch`, and
/// fresh beyond that.
pub fn staleness_at(
    now: UnixTime,
    expiration: Option<UnixTime>,
    stale: Duration,
    prefetch: Duration,
) -> Staleness {
    let expiration = match expiration {
        Some(expiration) => expiration,
        None => return Staleness::Stale,
    };

    let remaining = expiration.saturating_duration_since(now);
    if remaining <= stale {
        Staleness::Stale
    } else if remaining <= prefetch {
        Staleness::PrefetchEligible
    } else {
        Staleness::Fresh
    }
}
