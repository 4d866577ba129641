//! Policies for substituting a value when retrieval fails

use std::{error, fmt};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::sources::AsyncValueSource;

/// Decides what to do when the value source fails
///
/// A handler either substitutes a value, or returns an error (the original or
/// another). A substituted value is handed to the caller that triggered the
/// retrieval but is never stored in the cache, so the next request for a
/// stale value will go back to the source. If the handler itself fails, that
/// error is returned to the caller as is.
///
/// Any `Fn(E) -> Result<V, E>` closure is a handler.
#[async_trait]
pub trait ExceptionHandler<V, E>: Send + Sync
where
    V: Send + 'static,
    E: Send + 'static,
{
    /// Handles a retrieval error
    async fn handle(&self, error: E) -> Result<V, E>;
}

#[async_trait]
impl<V, E, F> ExceptionHandler<V, E> for F
where
    V: Send + 'static,
    E: Send + 'static,
    F: Fn(E) -> Result<V, E> + Send + Sync,
{
    async fn handle(&self, error: E) -> Result<V, E> {
        (self)(error)
    }
}

/// The default handler, which returns the retrieval error unchanged
#[derive(Clone, Copy, Debug, Default)]
pub struct Reraise;

#[async_trait]
impl<V, E> ExceptionHandler<V, E> for Reraise
where
    V: Send + 'static,
    E: Send + 'static,
{
    async fn handle(&self, error: E) -> Result<V, E> {
        Err(error)
    }
}

/// A handler that falls back to a secondary value source, such as a local
/// token store
///
/// If the secondary source also fails, its error is logged and the original
/// retrieval error is returned.
pub struct FallbackSource<S> {
    name: String,
    source: Mutex<S>,
}

impl<S> FallbackSource<S> {
    /// Constructs a new fallback handler over `source`
    ///
    /// `name` identifies the source in log output.
    pub fn new(name: impl Into<String>, source: S) -> Self {
        Self {
            name: name.into(),
            source: Mutex::new(source),
        }
    }
}

impl<S> fmt::Debug for FallbackSource<S> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("FallbackSource")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<S, E> ExceptionHandler<S::Value, E> for FallbackSource<S>
where
    S: AsyncValueSource,
    E: error::Error + Send + Sync + 'static,
{
    async fn handle(&self, error: E) -> Result<S::Value, E> {
        let mut source = self.source.lock().await;
        match source.retrieve().await {
            Ok(value) => {
                tracing::debug!(
                    fallback = %self.name,
                    error = (&error as &dyn error::Error),
                    "retrieval failed, substituting value from fallback"
                );
                Ok(value)
            }
            Err(fallback_error) => {
                tracing::warn!(
                    fallback = %self.name,
                    error = (&fallback_error as &dyn error::Error),
                    "fallback source also failed"
                );
                Err(error)
            }
        }
    }
}
