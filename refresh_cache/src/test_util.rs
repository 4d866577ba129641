use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use refresh_clock::{Clock, UnixTime};
use thiserror::Error;

use crate::{sources::AsyncValueSource, ExpiringValue};

/// A clock that follows tokio's (possibly paused) time, anchored at a fixed
/// wall-clock instant
#[derive(Clone, Copy, Debug)]
pub(crate) struct TokioClock {
    origin: UnixTime,
    started: tokio::time::Instant,
}

impl TokioClock {
    pub(crate) fn start() -> Self {
        Self {
            origin: UnixTime::from_secs(1_700_000_000),
            started: tokio::time::Instant::now(),
        }
    }
}

impl Clock for TokioClock {
    fn now(&self) -> UnixTime {
        self.origin + self.started.elapsed()
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{0}")]
pub(crate) struct TestError(pub(crate) &'static str);

pub(crate) type TestValue = ExpiringValue<&'static str>;

#[derive(Clone, Copy, Debug)]
pub(crate) enum Step {
    /// Produces a value expiring the given number of milliseconds from now,
    /// which may be negative
    Expires(&'static str, i64),
    /// Produces a value with no expiration
    Forever(&'static str),
    Fail(&'static str),
    Panic(&'static str),
}

/// A source replaying a script of results; the last step repeats forever
#[derive(Debug)]
pub(crate) struct ScriptedSource {
    clock: TokioClock,
    steps: VecDeque<Step>,
    calls: Arc<AtomicUsize>,
    latency: Duration,
}

impl ScriptedSource {
    pub(crate) fn new(clock: TokioClock, steps: impl IntoIterator<Item = Step>) -> Self {
        Self {
            clock,
            steps: steps.into_iter().collect(),
            calls: Arc::default(),
            latency: Duration::ZERO,
        }
    }

    pub(crate) fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub(crate) fn calls(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }
}

#[async_trait]
impl AsyncValueSource for ScriptedSource {
    type Value = TestValue;
    type Error = TestError;

    async fn retrieve(&mut self) -> Result<TestValue, TestError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let step = if self.steps.len() > 1 {
            self.steps.pop_front()
        } else {
            self.steps.front().copied()
        };

        let now = self.clock.now();
        match step.expect("script must not be empty") {
            Step::Expires(value, offset_ms) => {
                let offset = Duration::from_millis(offset_ms.unsigned_abs());
                let expiration = if offset_ms < 0 { now - offset } else { now + offset };
                Ok(ExpiringValue::new(value, expiration))
            }
            Step::Forever(value) => Ok(ExpiringValue::without_expiration(value)),
            Step::Fail(message) => Err(TestError(message)),
            Step::Panic(message) => panic!("{}", message),
        }
    }
}
