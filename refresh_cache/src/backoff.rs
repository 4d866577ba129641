//! Error backoff handling for background refreshes

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for how to space out background retries after an error
///
/// When serialized, delays are represented as integer milliseconds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawBackoff", into = "RawBackoff")]
pub struct ErrorBackoffConfig {
    initial_error_delay: Duration,
    max_error_delay: Duration,
    multiplier: u32,
}

impl Default for ErrorBackoffConfig {
    /// Default backoff configuration
    ///
    /// Uses an initial error delay of 100 ms with a multiplier of 2. Maximum delay is
    /// capped at 15 seconds.
    fn default() -> Self {
        Self {
            initial_error_delay: Duration::from_millis(100),
            max_error_delay: Duration::from_secs(15),
            multiplier: 2,
        }
    }
}

impl ErrorBackoffConfig {
    /// Constructs a new backoff configuration
    ///
    /// When encountering an error for the first time, the backoff will be `initial_error_delay`.
    /// On subsequent errors, the backoff is multiplied by `multiplier`, with a cap of
    /// `max_error_delay`.
    pub fn new(initial_error_delay: Duration, max_error_delay: Duration, multiplier: u32) -> Self {
        Self {
            initial_error_delay,
            max_error_delay,
            multiplier,
        }
    }

    /// The delay after the first error in a run
    pub fn initial_error_delay(&self) -> Duration {
        self.initial_error_delay
    }

    /// The largest delay that will ever be reported
    pub fn max_error_delay(&self) -> Duration {
        self.max_error_delay
    }

    /// The growth factor applied on each consecutive error
    pub fn multiplier(&self) -> u32 {
        self.multiplier
    }
}

#[derive(Serialize, Deserialize)]
struct RawBackoff {
    #[serde(default = "default_initial_ms")]
    initial_error_delay_ms: u64,
    #[serde(default = "default_max_ms")]
    max_error_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    multiplier: u32,
}

fn default_initial_ms() -> u64 {
    100
}

fn default_max_ms() -> u64 {
    15_000
}

fn default_multiplier() -> u32 {
    2
}

impl From<RawBackoff> for ErrorBackoffConfig {
    fn from(raw: RawBackoff) -> Self {
        Self::new(
            Duration::from_millis(raw.initial_error_delay_ms),
            Duration::from_millis(raw.max_error_delay_ms),
            raw.multiplier,
        )
    }
}

impl From<ErrorBackoffConfig> for RawBackoff {
    fn from(config: ErrorBackoffConfig) -> Self {
        Self {
            initial_error_delay_ms: u64::try_from(config.initial_error_delay.as_millis())
                .unwrap_or(u64::MAX),
            max_error_delay_ms: u64::try_from(config.max_error_delay.as_millis())
                .unwrap_or(u64::MAX),
            multiplier: config.multiplier,
        }
    }
}

/// Utility trait for extending types with a backoff handler
pub trait WithBackoff {
    /// The output of providing backoff
    type Output;

    /// Applies backoff to the current value
    fn with_backoff(self, handler: &mut ErrorBackoffHandler) -> Self::Output;
}

impl<T, E> WithBackoff for Result<T, E> {
    type Output = Result<T, (E, Duration)>;

    fn with_backoff(self, handler: &mut ErrorBackoffHandler) -> Self::Output {
        match self {
            Ok(ok) => {
                handler.success();
                Ok(ok)
            }
            Err(err) => Err((err, handler.error())),
        }
    }
}

/// A stateful handler that manages error backoff state
#[derive(Debug)]
pub struct ErrorBackoffHandler {
    config: ErrorBackoffConfig,
    last_delay: Option<Duration>,
}

impl ErrorBackoffHandler {
    /// Constructs a new handler from an [`ErrorBackoffConfig`].
    pub fn new(config: ErrorBackoffConfig) -> Self {
        Self {
            config,
            last_delay: None,
        }
    }

    /// Reports a success
    ///
    /// This resets the internal delay state.
    pub fn success(&mut self) {
        self.last_delay = None;
    }

    /// Reports a failure and returns the expected backoff delay
    pub fn error(&mut self) -> Duration {
        let new_delay = self
            .last_delay
            .map(|last| {
                last.saturating_mul(self.config.multiplier)
                    .min(self.config.max_error_delay)
            })
            .unwrap_or(self.config.initial_error_delay);
        self.last_delay = Some(new_delay);
        new_delay
    }
}

impl From<ErrorBackoffConfig> for ErrorBackoffHandler {
    fn from(config: ErrorBackoffConfig) -> Self {
        Self::new(config)
    }
}
