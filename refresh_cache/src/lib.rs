//! A time-aware, prefetching cache for short-lived credentials and tokens
//!
//! Clients of identity services need a valid credential or bearer token on
//! every outbound request, but obtaining one is slow, rate limited, and yields
//! a value that is only valid for a limited time. This crate caches one such
//! value and decides, on each request, whether it is fresh enough to hand out
//! without a round trip to the issuing service.
//!
//! Each cached value is classified by how much time it has left before it
//! expires:
//!
//! * _fresh_ values are returned as is;
//! * _prefetch-eligible_ values, inside the configured prefetch window, are
//!   still returned, but a background refresh is requested when async refresh
//!   is enabled;
//! * _stale_ values, inside the stale window or with no expiration at all, are
//!   never returned from the cache. The caller waits for a new value instead.
//!
//! The value handed back by a retrieval is returned to the caller that waited
//! for it as is, even if the source issued it already stale or expired (a
//! warning is logged). Only later requests see it classified as stale.
//!
//! However many callers observe a stale value at once, only one retrieval is
//! made from the underlying [source][sources::AsyncValueSource], and its result
//! is shared. If the source fails, an
//! [exception handler][fallback::ExceptionHandler] may substitute a value, such
//! as one loaded from a local token store; such a value is returned to the
//! caller but never cached.
//!
//! # General Flow
//!
//! Supply a source for new values and a configuration describing when values
//! become stale, then request values from the cache wherever they are needed.
//!
//! ```
//! use std::time::Duration;
//! use refresh_cache::{
//!     fallback::FallbackSource, sources, AccessToken, BearerToken, RefreshCache, RefreshConfig,
//! };
//!
//! # #[derive(Debug, thiserror::Error)]
//! # #[error("token exchange failed")]
//! # struct ExchangeError;
//! # async fn exchange_token() -> Result<BearerToken, ExchangeError> {
//! #     Ok(BearerToken::expires_in(
//! #         AccessToken::from_static("issued"),
//! #         Duration::from_secs(3600),
//! #         &refresh_clock::System,
//! #     ))
//! # }
//! # async fn load_from_disk() -> Result<BearerToken, ExchangeError> {
//! #     Err(ExchangeError)
//! # }
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = RefreshConfig::builder()
//!     .stale_duration(Duration::from_secs(60))
//!     .prefetch_duration(Duration::from_secs(300))
//!     .async_refresh_enabled(true)
//!     .build()?;
//!
//! let cache = RefreshCache::builder(sources::from_fn(exchange_token))
//!     .config(config)
//!     .exception_handler(FallbackSource::new("disk", sources::from_fn(load_from_disk)))
//!     .build();
//!
//! let token = cache.refresh_if_stale_and_fetch().await?;
//! tracing::info!(token = format_args!("{:#?}", token.token()), "obtained token");
//!
//! cache.close();
//! # Ok(())
//! # }
//! ```
//!
//! # Features
//!
//! * `rand` (default): Provides an implementation of
//!   [JitterSource][jitter::JitterSource] based on the random number generator
//!   provided by the [rand] crate.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

pub mod backoff;
mod braids;
mod cache;
mod config;
mod credentials;
pub mod fallback;
pub mod jitter;
mod scheduler;
pub mod sources;
mod value;

#[cfg(test)]
mod test_util;

pub use braids::*;
pub use cache::{RefreshCache, RefreshCacheBuilder};
pub use config::{ConfigError, RefreshConfig, RefreshConfigBuilder};
pub use credentials::{AwsCredentials, BearerToken};
pub use value::{staleness_at, Expiring, ExpiringValue, Staleness};
