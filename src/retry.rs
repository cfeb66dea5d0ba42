//! Retry policy for transient failures (lock contention, broker hiccups).
//!
//! Wraps `backon`'s [`ExponentialBuilder`] the way the saga command path
//! and the CloudEvents HTTP sink do elsewhere in this codebase: a small
//! config struct produces a fresh backoff for each call site, and
//! `Retryable::retry` drives the actual loop.

use std::future::Future;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};

/// Backoff shape for a retryable operation.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub max_times: usize,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(5),
            max_times: 5,
        }
    }
}

impl RetryPolicy {
    /// Backoff for lock acquisition under contention: short, frequent
    /// attempts since the holder is expected to release within one TTL
    /// window.
    pub fn for_mutex() -> Self {
        Self {
            min_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(500),
            max_times: 10,
        }
    }

    fn builder(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.min_delay)
            .with_max_delay(self.max_delay)
            .with_max_times(self.max_times)
            .with_jitter()
    }

    /// Runs `op`, retrying on `Err` per this policy. `should_retry` lets
    /// the caller exclude non-transient errors (e.g. a permanently
    /// malformed payload) from the retry loop.
    pub async fn retry<T, E, F, Fut, R>(&self, op: F, should_retry: R) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        R: Fn(&E) -> bool,
    {
        op.retry(self.builder())
            .when(should_retry)
            .notify(|err: &E, dur: Duration| {
                tracing::debug!(delay = ?dur, error = %format_args!("{err:?}"), "retrying after transient failure");
            })
            .await
    }
}
