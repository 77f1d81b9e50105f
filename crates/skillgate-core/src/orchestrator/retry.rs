//! Fixed-backoff retry for transient transport failures.

use std::future::Future;
use std::time::Duration;

use crate::config::RetrySettings;
use crate::error::InvocationError;
use crate::obs;

/// Never more than one retry; non-retryable errors return immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u32,
    backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(1, Duration::from_millis(200))
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(s: &RetrySettings) -> Self {
        Self::new(s.max_retries, Duration::from_millis(s.backoff_ms))
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff: Duration) -> Self {
        Self {
            max_retries: max_retries.min(1),
            backoff,
        }
    }

    pub fn none() -> Self {
        Self::new(0, Duration::ZERO)
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }
}

/// Run `attempt`, retrying once after `backoff` if it fails with a retryable
/// error. Returns the final result and the number of attempts made.
pub async fn execute_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    invocation_id: &str,
    attempt: F,
) -> (Result<T, InvocationError>, u32)
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, InvocationError>>,
{
    let max_attempts = policy.max_retries + 1;
    let mut n = 1;
    loop {
        match attempt().await {
            Err(e) if e.retryable && n < max_attempts => {
                obs::emit_retry(invocation_id, n, e.code, policy.backoff.as_millis() as u64);
                tokio::time::sleep(policy.backoff).await;
                n += 1;
            }
            result => return (result, n),
        }
    }
}
