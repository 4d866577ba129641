use std::time::Duration;

use refresh_clock::UnixTime;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{backoff::ErrorBackoffConfig, staleness_at, Staleness};

const DEFAULT_POLLING_INTERVAL: Duration = Duration::from_secs(1);

/// Immutable configuration determining when a cached value is refreshed
///
/// Constructed through [`RefreshConfig::builder()`], or deserialized, in
/// which case durations are given in integer milliseconds:
///
/// ```
/// # use std::time::Duration;
/// # use refresh_cache::RefreshConfig;
/// let config: RefreshConfig = serde_json::from_str(r#"{
///     "stale_duration_ms": 60000,
///     "prefetch_duration_ms": 300000,
///     "async_refresh_enabled": true
/// }"#)?;
///
/// assert_eq!(config.prefetch_duration(), Duration::from_secs(300));
/// # Ok::<(), serde_json::Error>(())
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawRefreshConfig", into = "RawRefreshConfig")]
pub struct RefreshConfig {
    stale_duration: Duration,
    prefetch_duration: Duration,
    async_refresh_enabled: bool,
    polling_interval: Duration,
    error_backoff: ErrorBackoffConfig,
}

impl Default for RefreshConfig {
    /// A strictly synchronous configuration
    ///
    /// Values are refreshed on demand once expired and never in the background.
    /// Values without an expiration are refreshed on every request.
    fn default() -> Self {
        Self {
            stale_duration: Duration::ZERO,
            prefetch_duration: Duration::ZERO,
            async_refresh_enabled: false,
            polling_interval: DEFAULT_POLLING_INTERVAL,
            error_backoff: ErrorBackoffConfig::default(),
        }
    }
}

impl RefreshConfig {
    /// Starts building a new configuration from the defaults
    pub fn builder() -> RefreshConfigBuilder {
        RefreshConfigBuilder::default()
    }

    /// How long before expiration a value must be synchronously refreshed
    #[inline]
    pub fn stale_duration(&self) -> Duration {
        self.stale_duration
    }

    /// How long before expiration a value should be refreshed in the background
    #[inline]
    pub fn prefetch_duration(&self) -> Duration {
        self.prefetch_duration
    }

    /// Whether values are refreshed in the background
    #[inline]
    pub fn async_refresh_enabled(&self) -> bool {
        self.async_refresh_enabled
    }

    /// The background tick used when no better wake-up time is known
    #[inline]
    pub fn polling_interval(&self) -> Duration {
        self.polling_interval
    }

    /// Backoff applied between failed background refreshes
    #[inline]
    pub fn error_backoff(&self) -> &ErrorBackoffConfig {
        &self.error_backoff
    }

    /// Classifies a value expiring at `expiration` as of `now`
    #[inline]
    pub fn staleness_at(&self, now: UnixTime, expiration: Option<UnixTime>) -> Staleness {
        staleness_at(
            now,
            expiration,
            self.stale_duration,
            self.prefetch_duration,
        )
    }

    /// The instant a value expiring at `expiration` enters the prefetch window
    #[inline]
    pub fn prefetch_at(&self, expiration: Option<UnixTime>) -> Option<UnixTime> {
        expiration.map(|e| e - self.prefetch_duration)
    }
}

/// Builder for [`RefreshConfig`]
#[derive(Clone, Debug, Default)]
pub struct RefreshConfigBuilder {
    stale_duration: Duration,
    prefetch_duration: Option<Duration>,
    async_refresh_enabled: bool,
    polling_interval: Option<Duration>,
    error_backoff: ErrorBackoffConfig,
}

impl RefreshConfigBuilder {
    /// Sets how long before expiration a value is considered unusable
    pub fn stale_duration(mut self, stale_duration: Duration) -> Self {
        self.stale_duration = stale_duration;
        self
    }

    /// Sets how long before expiration a background refresh is attempted
    ///
    /// Must not be shorter than the stale duration. Defaults to the stale
    /// duration, which leaves no prefetch window at all.
    pub fn prefetch_duration(mut self, prefetch_duration: Duration) -> Self {
        self.prefetch_duration = Some(prefetch_duration);
        self
    }

    /// Enables or disables refreshing values in the background
    pub fn async_refresh_enabled(mut self, enabled: bool) -> Self {
        self.async_refresh_enabled = enabled;
        self
    }

    /// Sets the background tick used when a value has no expiration, or when
    /// a freshly retrieved value is already inside its prefetch window
    pub fn polling_interval(mut self, polling_interval: Duration) -> Self {
        self.polling_interval = Some(polling_interval);
        self
    }

    /// Sets the backoff applied between failed background refreshes
    pub fn error_backoff(mut self, error_backoff: ErrorBackoffConfig) -> Self {
        self.error_backoff = error_backoff;
        self
    }

    /// Validates and builds the configuration
    pub fn build(self) -> Result<RefreshConfig, ConfigError> {
        let prefetch_duration = self.prefetch_duration.unwrap_or(self.stale_duration);
        if prefetch_duration < self.stale_duration {
            return Err(ConfigError::PrefetchShorterThanStale {
                stale: self.stale_duration,
                prefetch: prefetch_duration,
            });
        }

        let polling_interval = self.polling_interval.unwrap_or(DEFAULT_POLLING_INTERVAL);
        if polling_interval.is_zero() {
            return Err(ConfigError::ZeroPollingInterval);
        }

        if self.error_backoff.initial_error_delay().is_zero() || self.error_backoff.multiplier() == 0 {
            return Err(ConfigError::DegenerateBackoff);
        }

        Ok(RefreshConfig {
            stale_duration: self.stale_duration,
            prefetch_duration,
            async_refresh_enabled: self.async_refresh_enabled,
            polling_interval,
            error_backoff: self.error_backoff,
        })
    }
}

/// An invalid refresh configuration
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// The prefetch window would end before the stale window begins
    #[error("prefetch duration ({prefetch:?}) must not be shorter than stale duration ({stale:?})")]
    PrefetchShorterThanStale {
        /// The configured stale duration
        stale: Duration,
        /// The configured prefetch duration
        prefetch: Duration,
    },
    /// The background tick would spin
    #[error("polling interval must be greater than zero")]
    ZeroPollingInterval,
    /// Failed background refreshes would be retried without any delay
    #[error("error backoff must start above zero and grow by a multiplier of at least one")]
    DegenerateBackoff,
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRefreshConfig {
    #[serde(default)]
    stale_duration_ms: u64,
    #[serde(default)]
    prefetch_duration_ms: Option<u64>,
    #[serde(default)]
    async_refresh_enabled: bool,
    #[serde(default)]
    polling_interval_ms: Option<u64>,
    #[serde(default)]
    error_backoff: ErrorBackoffConfig,
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl TryFrom<RawRefreshConfig> for RefreshConfig {
    type Error = ConfigError;

    fn try_from(raw: RawRefreshConfig) -> Result<Self, Self::Error> {
        let mut builder = RefreshConfig::builder()
            .stale_duration(Duration::from_millis(raw.stale_duration_ms))
            .async_refresh_enabled(raw.async_refresh_enabled)
            .error_backoff(raw.error_backoff);

        if let Some(ms) = raw.prefetch_duration_ms {
            builder = builder.prefetch_duration(Duration::from_millis(ms));
        }

        if let Some(ms) = raw.polling_interval_ms {
            builder = builder.polling_interval(Duration::from_millis(ms));
        }

        builder.build()
    }
}

impl From<RefreshConfig> for RawRefreshConfig {
    fn from(config: RefreshConfig) -> Self {
        Self {
            stale_duration_ms: millis(config.stale_duration),
            prefetch_duration_ms: Some(millis(config.prefetch_duration)),
            async_refresh_enabled: config.async_refresh_enabled,
            polling_interval_ms: Some(millis(config.polling_interval)),
            error_backoff: config.error_backoff,
        }
    }
}
