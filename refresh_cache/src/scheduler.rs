//! Background prefetching of cached values

use std::{error, sync::Arc, time::Duration};

use refresh_clock::{Clock, UnixTime};

use crate::{
    backoff::{ErrorBackoffHandler, WithBackoff},
    cache::{CacheEntry, Shared},
    jitter::JitterSource,
    sources::AsyncValueSource,
    Expiring, Staleness,
};

/// Wall-clock timers do not advance while a host is suspended, so long waits
/// are broken up and the clock re-read at least this often.
const HEARTBEAT: Duration = Duration::from_secs(30);

#[derive(Clone, Copy, Debug)]
pub(crate) enum Delay {
    /// Wait until the entry of the given generation enters its prefetch window
    UntilTime(UnixTime, u64),
    /// Wait a fixed amount of time, ignoring prefetch signals
    ForDuration(Duration),
}

#[derive(Debug)]
enum Wake {
    Timer,
    Signal,
}

/// Decides when the next prefetch should be attempted for `entry`
pub(crate) fn plan<S, C>(
    shared: &Shared<S, C>,
    now: UnixTime,
    entry: Option<&CacheEntry<S::Value>>,
    jitter: &mut dyn JitterSource,
) -> Delay
where
    S: AsyncValueSource,
{
    let poll = Delay::ForDuration(shared.config.polling_interval());

    let entry = match entry {
        Some(entry) => entry,
        None => {
            tracing::trace!("nothing cached yet, polling");
            return poll;
        }
    };

    let prefetch_at = match shared.config.prefetch_at(entry.value.expiration()) {
        Some(prefetch_at) => prefetch_at,
        None => {
            tracing::trace!("cached value has no expiration, polling");
            return poll;
        }
    };

    match prefetch_at.checked_duration_since(now) {
        Some(until) if !until.is_zero() => {
            let delay = jitter.jitter(until);
            tracing::debug!(
                prefetch_at = prefetch_at.0,
                delay_ms = delay.as_millis() as u64,
                "waiting for value to enter prefetch window"
            );
            Delay::UntilTime(now + delay, entry.generation)
        }
        _ => {
            tracing::trace!("cached value is already inside prefetch window, polling");
            poll
        }
    }
}

pub(crate) async fn prefetch_loop<S, C>(
    shared: Arc<Shared<S, C>>,
    mut jitter: Box<dyn JitterSource + Send>,
    mut delay: Delay,
) where
    S: AsyncValueSource,
    C: Clock,
{
    let mut backoff = ErrorBackoffHandler::new(shared.config.error_backoff().clone());

    loop {
        let wake = match delay {
            Delay::ForDuration(d) => {
                tracing::trace!(delay_ms = d.as_millis() as u64, "sleeping");
                tokio::time::sleep(d).await;
                Wake::Timer
            }
            Delay::UntilTime(t, _) => wait_until(&shared, t).await,
        };

        if shared.is_closed() {
            tracing::info!("refresh cache closed, halting background refresh");
            return;
        }

        let now = shared.clock.now();
        let current = shared.current();
        let staleness = match &current {
            Some(entry) => shared.config.staleness_at(now, entry.value.expiration()),
            None => Staleness::Stale,
        };

        let due = match (&wake, &delay) {
            _ if staleness != Staleness::Fresh => true,
            // A jittered deadline may fire before the window proper opens
            (Wake::Timer, Delay::UntilTime(_, generation)) => {
                current.as_ref().map(|entry| entry.generation) == Some(*generation)
            }
            _ => false,
        };

        delay = if due {
            prefetch(&shared, &mut *jitter, &mut backoff).await
        } else {
            tracing::trace!(?staleness, ?wake, "nothing to prefetch yet");
            plan(&shared, now, current.as_ref(), &mut *jitter)
        };
    }
}

async fn wait_until<S, C>(shared: &Shared<S, C>, t: UnixTime) -> Wake
where
    S: AsyncValueSource,
    C: Clock,
{
    loop {
        let now = shared.clock.now();
        if now >= t {
            return Wake::Timer;
        }

        let delay = (t - now).min(HEARTBEAT);
        tracing::trace!(
            delay_ms = delay.as_millis() as u64,
            until_prefetch_ms = (t - now).as_millis() as u64,
            "value not yet prefetch eligible, sleeping…"
        );

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shared.prefetch_signal.notified() => return Wake::Signal,
        }
    }
}

async fn prefetch<S, C>(
    shared: &Shared<S, C>,
    jitter: &mut (dyn JitterSource + Send),
    backoff: &mut ErrorBackoffHandler,
) -> Delay
where
    S: AsyncValueSource,
    C: Clock,
{
    let mut source = match shared.source.try_lock() {
        Ok(source) => source,
        Err(_) => {
            tracing::trace!("retrieval already in flight, skipping prefetch");
            return Delay::ForDuration(shared.config.polling_interval());
        }
    };

    tracing::debug!("prefetching new value");
    match source.retrieve().await.with_backoff(backoff) {
        Ok(value) => {
            let now = shared.clock.now();
            let entry = shared.store(Arc::new(value), now);
            drop(source);

            plan(shared, now, Some(&entry), jitter)
        }
        Err((error, delay)) => {
            drop(source);
            tracing::warn!(
                error = (&error as &dyn error::Error),
                delay_ms = delay.as_millis() as u64,
                "error prefetching value, will retry"
            );

            // Only foreground callers receive substituted values
            if let Err(error) = shared.handler.handle(error).await {
                tracing::trace!(
                    error = (&error as &dyn error::Error),
                    "exception handler did not substitute a value"
                );
            }

            Delay::ForDuration(delay)
        }
    }
}
