//! Poll one object with exponential backoff until a predicate or classifier
//! says stop, racing a wall-clock timeout and the caller's cancellation.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use converge_kubehub::{ClientError, ResourceClient};
use futures::future::BoxFuture;
use kube::core::DynamicObject;
use rand::Rng;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::AwaitError;

pub const DEFAULT_POLL_BASE: Duration = Duration::from_millis(500);
pub const DEFAULT_POLL_CEILING: Duration = Duration::from_secs(30);

/// Doubling backoff with ±20% jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
    wait: Duration,
    ceiling: Duration,
}

impl Backoff {
    pub fn new(base: Duration, ceiling: Duration) -> Self {
        Self { wait: base, ceiling }
    }

    pub fn next_delay(&mut self) -> Duration {
        let factor: f64 = rand::rng().random_range(-0.2..=0.2);
        let delay = self.wait.mul_f64(1.0 + factor).min(self.ceiling);
        self.wait = (self.wait * 2).min(self.ceiling);
        delay
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(DEFAULT_POLL_BASE, DEFAULT_POLL_CEILING)
    }
}

/// Classifier verdict for [`ObjectPoller::retry_until`].
#[derive(Debug, thiserror::Error)]
pub enum RetryError {
    /// Keep polling.
    #[error("{0}")]
    Retryable(AwaitError),
    /// Stop immediately with this error.
    #[error("{0}")]
    Fatal(AwaitError),
}

impl RetryError {
    pub fn retryable(msg: impl Into<String>) -> Self {
        RetryError::Retryable(AwaitError::Failed(msg.into()))
    }
}

pub type FetchFn = Arc<dyn Fn() -> BoxFuture<'static, Result<DynamicObject, ClientError>> + Send + Sync>;

pub struct ObjectPoller {
    name: String,
    fetch: FetchFn,
    cancel: CancellationToken,
    base: Duration,
    ceiling: Duration,
}

impl ObjectPoller {
    /// Poll `name` through `client.get`.
    pub fn new(client: Arc<dyn ResourceClient>, name: &str, cancel: CancellationToken) -> Self {
        let target = name.to_string();
        let fetch: FetchFn = Arc::new(move || {
            let client = Arc::clone(&client);
            let target = target.clone();
            Box::pin(async move { client.get(&target).await })
        });
        Self::with_fetch(name, cancel, fetch)
    }

    pub fn with_fetch(name: &str, cancel: CancellationToken, fetch: FetchFn) -> Self {
        Self { name: name.to_string(), fetch, cancel, base: DEFAULT_POLL_BASE, ceiling: DEFAULT_POLL_CEILING }
    }

    pub fn with_backoff(mut self, base: Duration, ceiling: Duration) -> Self {
        self.base = base;
        self.ceiling = ceiling;
        self
    }

    fn cancelled(&self) -> AwaitError {
        AwaitError::PollCancelled { name: self.name.clone() }
    }

    async fn poll<T>(
        &self,
        timeout: Duration,
        mut classify: impl FnMut(Result<DynamicObject, ClientError>, &mut Vec<String>) -> Option<Result<T, AwaitError>>,
    ) -> Result<T, AwaitError> {
        let deadline = sleep(timeout);
        tokio::pin!(deadline);
        let mut backoff = Backoff::new(self.base, self.ceiling);
        let mut last_errors = Vec::new();
        let timed_out = |last: Vec<String>| AwaitError::PollTimeout { name: self.name.clone(), sub_errors: last };

        loop {
            let fetched = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(self.cancelled()),
                _ = &mut deadline => return Err(timed_out(last_errors)),
                r = (self.fetch)() => r,
            };
            if let Some(done) = classify(fetched, &mut last_errors) {
                return done;
            }
            let delay = backoff.next_delay();
            debug!(name = %self.name, delay_ms = delay.as_millis() as u64, "poll retry");
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(self.cancelled()),
                _ = &mut deadline => return Err(timed_out(last_errors)),
                _ = sleep(delay) => {}
            }
        }
    }

    /// Poll until `predicate` holds; fetch errors stop the poll.
    pub async fn watch_until(
        &self,
        timeout: Duration,
        mut predicate: impl FnMut(&DynamicObject) -> bool,
    ) -> Result<DynamicObject, AwaitError> {
        self.poll(timeout, |res, _| match res {
            Ok(obj) if predicate(&obj) => Some(Ok(obj)),
            Ok(_) => None,
            Err(e) => Some(Err(AwaitError::Client(e))),
        })
        .await
    }

    /// Poll until `classify` returns `Ok`. Retryable verdicts keep polling,
    /// fatal verdicts stop immediately.
    pub async fn retry_until(
        &self,
        timeout: Duration,
        mut classify: impl FnMut(Result<&DynamicObject, &ClientError>) -> Result<(), RetryError>,
    ) -> Result<(), AwaitError> {
        self.poll(timeout, |res, last| {
            let verdict = match &res {
                Ok(obj) => classify(Ok(obj)),
                Err(e) => classify(Err(e)),
            };
            match verdict {
                Ok(()) => Some(Ok(())),
                Err(RetryError::Retryable(e)) => {
                    debug!(error = %e, "retryable");
                    *last = vec![e.to_string()];
                    None
                }
                Err(RetryError::Fatal(e)) => Some(Err(e)),
            }
        })
        .await
    }
}

/// Bounded retry with a growing sleep between attempts.
#[derive(Debug, Clone, Copy)]
pub struct SleepingRetry {
    pub max_retries: u32,
    pub delay: Duration,
    pub factor: u32,
}

impl Default for SleepingRetry {
    fn default() -> Self {
        Self { max_retries: 5, delay: Duration::from_secs(1), factor: 2 }
    }
}

impl SleepingRetry {
    /// Run `op` until it succeeds, fails fatally, or `max_retries` retries
    /// are spent; the last retryable error is returned in that case.
    pub async fn run<T, F, Fut>(&self, cancel: &CancellationToken, mut op: F) -> Result<T, AwaitError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, RetryError>>,
    {
        let mut delay = self.delay;
        let mut attempt = 0;
        loop {
            match op(attempt).await {
                Ok(v) => return Ok(v),
                Err(RetryError::Fatal(e)) => return Err(e),
                Err(RetryError::Retryable(e)) if attempt >= self.max_retries => return Err(e),
                Err(RetryError::Retryable(e)) => {
                    debug!(attempt, error = %e, "retrying");
                }
            }
            attempt += 1;
            tokio::select! {
                _ = cancel.cancelled() => return Err(AwaitError::Failed("operation cancelled during retry".into())),
                _ = sleep(delay) => {}
            }
            delay *= self.factor;
        }
    }
}
