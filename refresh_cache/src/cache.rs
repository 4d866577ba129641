use std::{
    error, fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use refresh_clock::{Clock, System, UnixTime};
use tokio::{sync::Notify, task::JoinHandle};

use crate::{
    fallback::{ExceptionHandler, Reraise},
    jitter::{JitterSource, NullJitter},
    scheduler,
    sources::AsyncValueSource,
    Expiring, RefreshConfig, Staleness,
};

type Handler<S> = Box<
    dyn ExceptionHandler<<S as AsyncValueSource>::Value, <S as AsyncValueSource>::Error>,
>;

/// A cache holding one time-limited value
///
/// Requests are answered from the cached value while it is fresh enough, and
/// concurrent requests for a stale value share a single retrieval from the
/// underlying source. When async refresh is enabled, a background task
/// replaces the value once it enters its prefetch window, so that callers
/// rarely have to wait on the source at all.
///
/// Closing or dropping the cache stops the background task. Share a cache
/// between tasks by wrapping it in an [`Arc`].
///
/// ```
/// use std::time::Duration;
/// use refresh_cache::{sources, ExpiringValue, RefreshCache, RefreshConfig};
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let config = RefreshConfig::builder()
///     .stale_duration(Duration::from_secs(60))
///     .prefetch_duration(Duration::from_secs(300))
///     .async_refresh_enabled(true)
///     .build()?;
///
/// let cache = RefreshCache::builder(sources::from_fn(|| async {
///     Ok::<_, std::io::Error>(ExpiringValue::valid_for(
///         "token",
///         Duration::from_secs(3600),
///         &refresh_clock::System,
///     ))
/// }))
/// .config(config)
/// .build();
///
/// let token = cache.refresh_if_stale_and_fetch().await?;
/// assert_eq!(*token.value(), "token");
///
/// cache.close();
/// # Ok(())
/// # }
/// ```
pub struct RefreshCache<S: AsyncValueSource, C = System> {
    pub(crate) shared: Arc<Shared<S, C>>,
}

pub(crate) struct Shared<S: AsyncValueSource, C> {
    pub(crate) config: RefreshConfig,
    pub(crate) clock: C,
    pub(crate) handler: Handler<S>,
    /// Single-flight lock: holding the source is the only way to retrieve
    pub(crate) source: tokio::sync::Mutex<S>,
    pub(crate) prefetch_signal: Notify,
    closed: AtomicBool,
    state: Mutex<RefreshState<S::Value>>,
}

struct RefreshState<V> {
    current: Option<CacheEntry<V>>,
    generation: u64,
    scheduler: Option<JoinHandle<()>>,
    jitter: Option<Box<dyn JitterSource + Send>>,
}

/// A value as stored by the cache, replaced wholesale on each retrieval
pub(crate) struct CacheEntry<V> {
    pub(crate) value: Arc<V>,
    pub(crate) fetched_at: UnixTime,
    pub(crate) generation: u64,
}

impl<V> Clone for CacheEntry<V> {
    fn clone(&self) -> Self {
        Self {
            value: Arc::clone(&self.value),
            fetched_at: self.fetched_at,
            generation: self.generation,
        }
    }
}

/// Builder for a [`RefreshCache`]
pub struct RefreshCacheBuilder<S: AsyncValueSource, C = System> {
    source: S,
    config: RefreshConfig,
    handler: Handler<S>,
    jitter: Box<dyn JitterSource + Send>,
    clock: C,
}

impl<S: AsyncValueSource> RefreshCache<S, System> {
    /// Starts building a cache over `source`
    pub fn builder(source: S) -> RefreshCacheBuilder<S, System> {
        RefreshCacheBuilder {
            source,
            config: RefreshConfig::default(),
            handler: Box::new(Reraise),
            jitter: Box::new(NullJitter),
            clock: System,
        }
    }

    /// Constructs a cache over `source` using `config` and all other defaults
    pub fn new(source: S, config: RefreshConfig) -> Self {
        Self::builder(source).config(config).build()
    }
}

impl<S: AsyncValueSource, C> RefreshCacheBuilder<S, C> {
    /// Sets the refresh configuration
    pub fn config(mut self, config: RefreshConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the policy consulted when the source fails
    ///
    /// By default, errors are returned to the caller unchanged.
    pub fn exception_handler<H>(mut self, handler: H) -> Self
    where
        H: ExceptionHandler<S::Value, S::Error> + 'static,
    {
        self.handler = Box::new(handler);
        self
    }

    /// Sets the jitter applied to background prefetch delays
    pub fn jitter(mut self, jitter: impl JitterSource + Send + 'static) -> Self {
        self.jitter = Box::new(jitter);
        self
    }

    /// Sets a custom clock to be used
    ///
    /// Useful for testing purposes
    pub fn clock<D>(self, clock: D) -> RefreshCacheBuilder<S, D> {
        RefreshCacheBuilder {
            source: self.source,
            config: self.config,
            handler: self.handler,
            jitter: self.jitter,
            clock,
        }
    }

    /// Builds the cache
    ///
    /// Nothing is retrieved until the first request.
    pub fn build(self) -> RefreshCache<S, C> {
        RefreshCache {
            shared: Arc::new(Shared {
                config: self.config,
                clock: self.clock,
                handler: self.handler,
                source: tokio::sync::Mutex::new(self.source),
                prefetch_signal: Notify::new(),
                closed: AtomicBool::new(false),
                state: Mutex::new(RefreshState {
                    current: None,
                    generation: 0,
                    scheduler: None,
                    jitter: Some(self.jitter),
                }),
            }),
        }
    }
}

impl<S, C> RefreshCache<S, C>
where
    S: AsyncValueSource + 'static,
    C: Clock + Send + Sync + 'static,
{
    /// Gets the cached value, retrieving a new one first if it is stale
    ///
    /// A fresh or prefetch-eligible value is returned immediately. A stale
    /// value is replaced first; if another retrieval is already in flight,
    /// this call waits for it and returns its result instead of starting a
    /// second one. A newly retrieved value is returned even if the source
    /// issued it already expired.
    ///
    /// When the source fails, the configured exception handler decides the
    /// outcome. A substituted value is returned but not cached.
    ///
    /// With async refresh enabled, the first call starts the background
    /// prefetch task on the current tokio runtime.
    pub async fn refresh_if_stale_and_fetch(&self) -> Result<Arc<S::Value>, S::Error> {
        let result = self.shared.fetch().await;

        if self.shared.config.async_refresh_enabled() {
            self.ensure_scheduler();
        }

        result
    }

    fn ensure_scheduler(&self) {
        let mut state = self.shared.state();
        if self.shared.is_closed() {
            return;
        }

        // The loop only returns once closed, so a finished task has panicked
        if let Some(task) = &state.scheduler {
            if !task.is_finished() {
                return;
            }

            tracing::warn!("background refresh task ended unexpectedly, restarting without jitter");
        }

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(error) => {
                tracing::warn!(
                    error = (&error as &dyn error::Error),
                    "no tokio runtime available, background refresh disabled"
                );
                return;
            }
        };

        let now = self.shared.clock.now();
        let mut jitter = state
            .jitter
            .take()
            .unwrap_or_else(|| Box::new(NullJitter) as Box<dyn JitterSource + Send>);
        let first = scheduler::plan(&self.shared, now, state.current.as_ref(), &mut *jitter);

        tracing::debug!("starting background refresh");
        state.scheduler = Some(runtime.spawn(scheduler::prefetch_loop(
            Arc::clone(&self.shared),
            jitter,
            first,
        )));
    }
}

impl<S: AsyncValueSource, C: Clock> RefreshCache<S, C> {
    /// Gets the currently cached value without refreshing it
    ///
    /// The value may be stale, or even expired.
    pub fn cached(&self) -> Option<Arc<S::Value>> {
        self.shared.current().map(|entry| entry.value)
    }

    /// Classifies the currently cached value
    ///
    /// An empty cache is stale.
    pub fn staleness(&self) -> Staleness {
        self.shared.staleness_at(self.shared.clock.now())
    }

    /// Gets the refresh configuration
    pub fn config(&self) -> &RefreshConfig {
        &self.shared.config
    }

    /// Whether the cache has been closed
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Stops background refreshing
    ///
    /// Cancels any scheduled or in-flight background retrieval. Closing more
    /// than once has no further effect. A closed cache still answers
    /// requests, refreshing on demand only.
    pub fn close(&self) {
        self.shared.close();
    }
}

impl<S: AsyncValueSource, C> Drop for RefreshCache<S, C> {
    fn drop(&mut self) {
        self.shared.close();
    }
}

impl<S: AsyncValueSource, C> Shared<S, C> {
    fn state(&self) -> MutexGuard<'_, RefreshState<S::Value>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(task) = self.state().scheduler.take() {
            task.abort();
            tracing::info!("refresh cache closed, background refresh stopped");
        }
    }

    pub(crate) fn current(&self) -> Option<CacheEntry<S::Value>> {
        self.state().current.clone()
    }

    /// Replaces the current entry, returning the new one
    pub(crate) fn store(&self, value: Arc<S::Value>, fetched_at: UnixTime) -> CacheEntry<S::Value> {
        let mut state = self.state();
        state.generation += 1;

        let entry = CacheEntry {
            value,
            fetched_at,
            generation: state.generation,
        };
        state.current = Some(entry.clone());
        entry
    }
}

impl<S: AsyncValueSource, C: Clock> Shared<S, C> {
    pub(crate) fn staleness_at(&self, now: UnixTime) -> Staleness {
        match self.current() {
            Some(entry) => self.config.staleness_at(now, entry.value.expiration()),
            None => Staleness::Stale,
        }
    }

    async fn fetch(&self) -> Result<Arc<S::Value>, S::Error> {
        if let Some(value) = self.usable(Trigger::Request) {
            return Ok(value);
        }

        tracing::trace!("cached value is stale, waiting to refresh");
        let mut source = self.source.lock().await;

        // Another caller may have refreshed while we waited for the lock
        if let Some(value) = self.usable(Trigger::Recheck) {
            tracing::trace!("using value refreshed by another caller");
            return Ok(value);
        }

        tracing::debug!("retrieving new value");
        match source.retrieve().await {
            Ok(value) => {
                let now = self.clock.now();
                let entry = self.store(Arc::new(value), now);

                if let Some(expiration) = entry.value.expiration() {
                    if expiration <= now {
                        tracing::warn!(
                            expiration = expiration.0,
                            "source returned a value that has already expired"
                        );
                    }
                }

                tracing::debug!(
                    expiration = entry.value.expiration().map(|e| e.0),
                    "stored new value"
                );
                Ok(entry.value)
            }
            Err(error) => {
                drop(source);
                tracing::warn!(
                    error = (&error as &dyn error::Error),
                    "error retrieving value, consulting exception handler"
                );
                self.handler.handle(error).await.map(Arc::new)
            }
        }
    }

    /// Returns the cached value if it may be handed out without a refresh
    fn usable(&self, trigger: Trigger) -> Option<Arc<S::Value>> {
        let entry = self.current()?;
        let staleness = self
            .config
            .staleness_at(self.clock.now(), entry.value.expiration());

        match staleness {
            Staleness::Fresh => Some(entry.value),
            Staleness::PrefetchEligible => {
                if trigger == Trigger::Request && self.config.async_refresh_enabled() {
                    tracing::trace!("cached value is prefetch eligible, signalling background refresh");
                    self.prefetch_signal.notify_one();
                }
                Some(entry.value)
            }
            Staleness::Stale => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Trigger {
    Request,
    Recheck,
}

impl<S, C> fmt::Debug for RefreshCache<S, C>
where
    S: AsyncValueSource,
    C: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let state = self.shared.state();
        f.debug_struct("RefreshCache")
            .field("config", &self.shared.config)
            .field("clock", &self.shared.clock)
            .field(
                "expiration",
                &state
                    .current
                    .as_ref()
                    .map(|entry| entry.value.expiration()),
            )
            .field(
                "fetched_at",
                &state.current.as_ref().map(|entry| entry.fetched_at),
            )
            .field("background_refresh", &state.scheduler.is_some())
            .field("closed", &self.shared.is_closed())
            .finish_non_exhaustive()
    }
}

impl<S, C> fmt::Debug for RefreshCacheBuilder<S, C>
where
    S: AsyncValueSource + fmt::Debug,
    C: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("RefreshCacheBuilder")
            .field("source", &self.source)
            .field("config", &self.config)
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::atomic::Ordering, time::Duration};

    use super::*;
    use crate::{
        test_util::{ScriptedSource, Step, TestError, TestValue, TokioClock},
        ExpiringValue,
    };

    fn cache_with(
        clock: TokioClock,
        source: ScriptedSource,
        config: RefreshConfig,
    ) -> RefreshCache<ScriptedSource, TokioClock> {
        RefreshCache::builder(source)
            .config(config)
            .clock(clock)
            .build()
    }

    fn stale_after(stale: Duration) -> RefreshConfig {
        RefreshConfig::builder()
            .stale_duration(stale)
            .build()
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn values_without_expiration_are_retrieved_every_time() {
        let clock = TokioClock::start();
        let source = ScriptedSource::new(clock, [Step::Forever("A"), Step::Forever("B")]);
        let calls = source.calls();
        let cache = cache_with(clock, source, RefreshConfig::default());

        let first = cache.refresh_if_stale_and_fetch().await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = cache.refresh_if_stale_and_fetch().await.unwrap();

        assert_eq!(*first.value(), "A");
        assert_eq!(*second.value(), "B");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn value_outside_stale_window_is_reused() {
        let clock = TokioClock::start();
        let source = ScriptedSource::new(
            clock,
            [Step::Expires("token1", 10_000), Step::Expires("token2", 900)],
        );
        let calls = source.calls();
        let cache = cache_with(clock, source, stale_after(Duration::from_millis(99)));

        let first = cache.refresh_if_stale_and_fetch().await.unwrap();
        let second = cache.refresh_if_stale_and_fetch().await.unwrap();

        assert_eq!(*first.value(), "token1");
        assert_eq!(*second.value(), "token1");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_value_triggers_refresh() {
        let clock = TokioClock::start();
        let source = ScriptedSource::new(
            clock,
            [Step::Expires("token1", -1), Step::Expires("token2", 10_000)],
        );
        let calls = source.calls();
        let cache = cache_with(clock, source, stale_after(Duration::from_millis(99)));

        let first = cache.refresh_if_stale_and_fetch().await.unwrap();
        let second = cache.refresh_if_stale_and_fetch().await.unwrap();

        assert_eq!(*first.value(), "token1");
        assert!(first.expiration().unwrap() < clock.now());
        assert_eq!(*second.value(), "token2");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn value_entering_stale_window_is_replaced() {
        let clock = TokioClock::start();
        let source = ScriptedSource::new(
            clock,
            [Step::Expires("token1", 1_000), Step::Expires("token2", 1_000)],
        );
        let cache = cache_with(clock, source, stale_after(Duration::from_millis(100)));

        assert_eq!(*cache.refresh_if_stale_and_fetch().await.unwrap().value(), "token1");

        tokio::time::sleep(Duration::from_millis(899)).await;
        assert_eq!(*cache.refresh_if_stale_and_fetch().await.unwrap().value(), "token1");

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(cache.staleness(), Staleness::Stale);
        assert_eq!(*cache.refresh_if_stale_and_fetch().await.unwrap().value(), "token2");
    }

    #[tokio::test(start_paused = true)]
    async fn returned_values_never_expired_when_cached() {
        let clock = TokioClock::start();
        let source = ScriptedSource::new(clock, [Step::Expires("short", 250)]);
        let cache = cache_with(clock, source, stale_after(Duration::from_millis(10)));

        for _ in 0..50 {
            let value = cache.refresh_if_stale_and_fetch().await.unwrap();
            let expiration = value.expiration().unwrap();
            assert!(clock.now() < expiration);
            tokio::time::sleep(Duration::from_millis(37)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_stale_requests_share_one_retrieval() {
        let clock = TokioClock::start();
        let source = ScriptedSource::new(clock, [Step::Expires("shared", 10_000)])
            .with_latency(Duration::from_millis(100));
        let calls = source.calls();
        let cache = Arc::new(cache_with(
            clock,
            source,
            stale_after(Duration::from_millis(100)),
        ));

        let tasks: Vec<_> = (0..10)
            .map(|_| {
                let cache = Arc::clone(&cache);
                tokio::spawn(async move { cache.refresh_if_stale_and_fetch().await })
            })
            .collect();

        let mut values = Vec::new();
        for task in tasks {
            values.push(task.await.unwrap().unwrap());
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(values.iter().all(|v| Arc::ptr_eq(v, &values[0])));
        assert_eq!(*values[0].value(), "shared");
    }

    #[tokio::test(start_paused = true)]
    async fn prefetch_eligible_value_is_returned_without_retrieval_when_synchronous() {
        let clock = TokioClock::start();
        let source = ScriptedSource::new(clock, [Step::Expires("token", 1_000)]);
        let calls = source.calls();
        let config = RefreshConfig::builder()
            .stale_duration(Duration::from_millis(100))
            .prefetch_duration(Duration::from_millis(5_000))
            .build()
            .unwrap();
        let cache = cache_with(clock, source, config);

        cache.refresh_if_stale_and_fetch().await.unwrap();
        assert_eq!(cache.staleness(), Staleness::PrefetchEligible);

        tokio::time::sleep(Duration::from_millis(500)).await;
        let value = cache.refresh_if_stale_and_fetch().await.unwrap();

        assert_eq!(*value.value(), "token");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exception_handler_substitutes_without_caching() {
        let clock = TokioClock::start();
        let source = ScriptedSource::new(clock, [Step::Fail("service unavailable")]);
        let calls = source.calls();
        let cache = RefreshCache::builder(source)
            .clock(clock)
            .exception_handler(|_: TestError| -> Result<TestValue, TestError> {
                Ok(ExpiringValue::without_expiration("fallback"))
            })
            .build();

        let value = cache.refresh_if_stale_and_fetch().await.unwrap();
        assert_eq!(*value.value(), "fallback");
        assert!(cache.cached().is_none());

        let value = cache.refresh_if_stale_and_fetch().await.unwrap();
        assert_eq!(*value.value(), "fallback");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn exception_handler_failure_propagates() {
        let clock = TokioClock::start();
        let source = ScriptedSource::new(clock, [Step::Fail("service unavailable")]);
        let cache = RefreshCache::builder(source)
            .clock(clock)
            .exception_handler(|_: TestError| -> Result<TestValue, TestError> {
                Err(TestError("no local token"))
            })
            .build();

        let err = cache.refresh_if_stale_and_fetch().await.unwrap_err();
        assert_eq!(err, TestError("no local token"));
    }

    #[tokio::test(start_paused = true)]
    async fn default_handler_reraises() {
        let clock = TokioClock::start();
        let source = ScriptedSource::new(clock, [Step::Fail("service unavailable")]);
        let cache = cache_with(clock, source, RefreshConfig::default());

        let err = cache.refresh_if_stale_and_fetch().await.unwrap_err();
        assert_eq!(err, TestError("service unavailable"));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_refresh_leaves_previous_entry_intact() {
        let clock = TokioClock::start();
        let source = ScriptedSource::new(
            clock,
            [Step::Expires("token1", 1_000), Step::Fail("service unavailable")],
        );
        let cache = cache_with(clock, source, stale_after(Duration::from_millis(100)));

        cache.refresh_if_stale_and_fetch().await.unwrap();
        tokio::time::sleep(Duration::from_millis(950)).await;

        let err = cache.refresh_if_stale_and_fetch().await.unwrap_err();
        assert_eq!(err, TestError("service unavailable"));

        let cached = cache.cached().unwrap();
        assert_eq!(*cached.value(), "token1");
    }

    #[tokio::test(start_paused = true)]
    async fn empty_cache_is_stale() {
        let clock = TokioClock::start();
        let source = ScriptedSource::new(clock, [Step::Expires("token", 1_000)]);
        let cache = cache_with(clock, source, RefreshConfig::default());

        assert!(cache.cached().is_none());
        assert_eq!(cache.staleness(), Staleness::Stale);

        cache.refresh_if_stale_and_fetch().await.unwrap();
        assert_eq!(cache.staleness(), Staleness::Fresh);
    }

    #[tokio::test(start_paused = true)]
    async fn close_is_idempotent_and_cache_keeps_serving() {
        let clock = TokioClock::start();
        let source = ScriptedSource::new(
            clock,
            [Step::Expires("token1", -1), Step::Expires("token2", 1_000)],
        );
        let cache = cache_with(clock, source, RefreshConfig::default());

        cache.close();
        cache.close();
        assert!(cache.is_closed());

        cache.refresh_if_stale_and_fetch().await.unwrap();
        let value = cache.refresh_if_stale_and_fetch().await.unwrap();
        assert_eq!(*value.value(), "token2");
    }
}
