//! Value sources

use std::{error, fmt, future::Future};

use async_trait::async_trait;

use crate::Expiring;

/// An asynchronous source for values, such as a credentials endpoint or a
/// token exchange
///
/// The cache guarantees that at most one call to [`retrieve`][Self::retrieve]
/// is in flight at a time. Implementations are free to apply their own retry
/// policy; the cache never retries on its own.
#[async_trait]
pub trait AsyncValueSource: Send {
    /// The value produced by this source
    type Value: Expiring + Send + Sync + 'static;

    /// The error type returned in the event that retrieving a value fails
    type Error: error::Error + Send + Sync + 'static;

    /// Retrieves a new value
    async fn retrieve(&mut self) -> Result<Self::Value, Self::Error>;
}

#[async_trait]
impl<S: AsyncValueSource + ?Sized> AsyncValueSource for Box<S> {
    type Value = S::Value;
    type Error = S::Error;

    async fn retrieve(&mut self) -> Result<Self::Value, Self::Error> {
        (**self).retrieve().await
    }
}

/// A value source backed by an asynchronous closure
///
/// Created with [`from_fn`].
pub struct FnSource<F> {
    f: F,
}

/// Creates a value source from a closure returning a future
///
/// ```
/// # use refresh_cache::{sources, ExpiringValue};
/// let source = sources::from_fn(|| async {
///     Ok::<_, std::io::Error>(ExpiringValue::without_expiration("token"))
/// });
/// # drop(source);
/// ```
pub fn from_fn<F>(f: F) -> FnSource<F> {
    FnSource { f }
}

impl<F> fmt::Debug for FnSource<F> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("FnSource").finish_non_exhaustive()
    }
}

#[async_trait]
impl<F, Fut, V, E> AsyncValueSource for FnSource<F>
where
    F: FnMut() -> Fut + Send,
    Fut: Future<Output = Result<V, E>> + Send,
    V: Expiring + Send + Sync + 'static,
    E: error::Error + Send + Sync + 'static,
{
    type Value = V;
    type Error = E;

    async fn retrieve(&mut self) -> Result<V, E> {
        (self.f)().await
    }
}
