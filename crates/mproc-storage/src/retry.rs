//! Retry with linear backoff.
//!
//! The n-th retry (0-based) waits `base_delay * (n + 1)`.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

/// Retry behaviour for one kind of operation.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    /// Operation name for logging.
    pub operation_name: String,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            operation_name: "operation".to_string(),
        }
    }
}

impl RetryPolicy {
    pub fn new(operation_name: impl Into<String>) -> Self {
        Self {
            operation_name: operation_name.into(),
            ..Default::default()
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    /// Delay before retry number `retry_count` (0-based).
    pub fn delay_for_retry(&self, retry_count: u32) -> Duration {
        self.base_delay.saturating_mul(retry_count + 1)
    }
}

/// Error returned once every attempt failed.
#[derive(Debug)]
pub struct RetryExhausted<E> {
    pub error: E,
    pub attempts: u32,
}

/// Run `operation` until it succeeds or the policy is exhausted.
///
/// `operation` receives the retry count of the current attempt (0 for the
/// first try).
pub async fn retry_async<F, Fut, T, E>(
    policy: &RetryPolicy,
    operation: F,
) -> Result<T, RetryExhausted<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_async_if(policy, |_| true, operation).await
}

/// Like [`retry_async`], but errors for which `should_retry` is false are
/// returned immediately.
pub async fn retry_async_if<F, Fut, T, E, P>(
    policy: &RetryPolicy,
    should_retry: P,
    mut operation: F,
) -> Result<T, RetryExhausted<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut retry_count = 0u32;

    loop {
        match operation(retry_count).await {
            Ok(value) => return Ok(value),
            Err(e) if retry_count < policy.max_retries && should_retry(&e) => {
                let delay = policy.delay_for_retry(retry_count);
                warn!(
                    "{} attempt {} failed, retrying in {:?}: {}",
                    policy.operation_name,
                    retry_count + 1,
                    delay,
                    e
                );
                metrics::counter!("mproc_retries_total", "operation" => policy.operation_name.clone())
                    .increment(1);
                tokio::time::sleep(delay).await;
                retry_count += 1;
            }
            Err(e) => {
                return Err(RetryExhausted {
                    error: e,
                    attempts: retry_count + 1,
                })
            }
        }
    }
}
