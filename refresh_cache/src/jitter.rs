//! Utilities for adding a bit of jitter to reduce stampeding

use std::time::Duration;

/// A type that provides some jittering of prefetch delays
pub trait JitterSource {
    /// Jitters a delay until the next prefetch attempt
    ///
    /// The result should not exceed `delay`; refreshing a little early is
    /// harmless, refreshing late risks callers seeing a stale value.
    fn jitter(&mut self, delay: Duration) -> Duration;
}

/// A jitter source that does not do any jittering
#[derive(Debug)]
pub struct NullJitter;

impl JitterSource for NullJitter {
    #[inline]
    fn jitter(&mut self, delay: Duration) -> Duration {
        delay
    }
}

#[cfg(feature = "rand")]
mod random {
    use std::time::Duration;

    use rand::{Rng, SeedableRng};

    /// Jitters a delay earlier by a random amount
    ///
    /// Delays jittered by this type will have a value with a uniform distribution
    /// in the interval `[delay - max_jitter, delay]`, never going below zero.
    #[derive(Debug)]
    pub struct RandomEarlyJitter<R> {
        max_jitter: Duration,
        rand_source: R,
    }

    impl RandomEarlyJitter<rand::rngs::StdRng> {
        /// Constructs a new instance that will jitter delays early up to `max_jitter`.
        pub fn new(max_jitter: Duration) -> Self {
            Self::with_rng(max_jitter, rand::rngs::StdRng::from_entropy())
        }
    }

    impl<R: Rng> RandomEarlyJitter<R> {
        /// Constructs a new instance drawing from the provided random source
        pub fn with_rng(max_jitter: Duration, rand_source: R) -> Self {
            Self {
                max_jitter,
                rand_source,
            }
        }
    }

    impl<R: Rng> super::JitterSource for RandomEarlyJitter<R> {
        fn jitter(&mut self, delay: Duration) -> Duration {
            let max = self.max_jitter.min(delay);
            if max.is_zero() {
                return delay;
            }

            let early = self.rand_source.gen_range(Duration::ZERO..=max);
            delay - early
        }
    }

    #[cfg(test)]
    mod tests {
        use rand::rngs::StdRng;

        use super::*;
        use crate::jitter::JitterSource;

        #[test]
        fn never_jitters_late_or_below_zero() {
            let mut jitter =
                RandomEarlyJitter::with_rng(Duration::from_secs(5), StdRng::seed_from_u64(7));

            for _ in 0..100 {
                let delay = Duration::from_secs(3);
                let jittered = jitter.jitter(delay);
                assert!(jittered <= delay);
            }

            for _ in 0..100 {
                let delay = Duration::from_secs(60);
                let jittered = jitter.jitter(delay);
                assert!(jittered <= delay);
                assert!(jittered >= Duration::from_secs(55));
            }
        }

        #[test]
        fn zero_delay_is_left_alone() {
            let mut jitter = RandomEarlyJitter::new(Duration::from_secs(5));
            assert_eq!(jitter.jitter(Duration::ZERO), Duration::ZERO);
        }
    }
}

#[cfg(feature = "rand")]
#[cfg_attr(docsrs, doc(cfg(feature = "rand")))]
pub use random::RandomEarlyJitter;
