//! Retry executor for blocking provider calls.
//!
//! Only transport and rate-limit failures (see [`LlmError::is_retryable`])
//! are retried. The wire call runs at most `max_retries + 1` times, with a
//! fixed delay between attempts; after the last attempt the last error
//! propagates unchanged.
//!
//! # Usage
//!
//! ```ignore
//! use edgequake_router::retry::{RetryExecutor, RetryPolicy};
//!
//! let policy = RetryPolicy::new(3, Duration::from_millis(500));
//! let response = RetryExecutor::new()
//!     .execute(&policy, || async { adapter.send(&request).await })
//!     .await?;
//! ```

use crate::error::LlmError;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Retry count and inter-attempt delay, fixed per adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Number of retries after the first attempt.
    pub max_retries: u32,
    /// Delay between attempts.
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, delay: Duration) -> Self {
        Self { max_retries, delay }
    }

    /// Single attempt, no retry.
    pub fn none() -> Self {
        Self::new(0, Duration::ZERO)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(2, Duration::from_millis(500))
    }
}

/// Executor for retry logic.
#[derive(Debug, Default, Clone, Copy)]
pub struct RetryExecutor {
    log_retries: bool,
}

impl RetryExecutor {
    /// Create a new retry executor.
    pub fn new() -> Self {
        Self { log_retries: true }
    }

    /// Create a retry executor without logging.
    pub fn silent() -> Self {
        Self { log_retries: false }
    }

    /// Execute an async operation, retrying retryable failures.
    ///
    /// # Arguments
    ///
    /// * `policy` - Retry count and delay
    /// * `operation` - Async closure that performs one wire call
    ///
    /// # Returns
    ///
    /// The result of the operation, or the last error if all attempts fail.
    pub async fn execute<F, Fut, T>(&self, policy: &RetryPolicy, mut operation: F) -> Result<T, LlmError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, LlmError>>,
    {
        let max_attempts = policy.max_retries + 1;
        let mut attempt = 0;

        loop {
            attempt += 1;

            match operation().await {
                Ok(v) => {
                    if attempt > 1 && self.log_retries {
                        info!("Operation succeeded after {} attempts", attempt);
                    }
                    return Ok(v);
                }
                Err(e) => {
                    if !e.is_retryable() {
                        if self.log_retries {
                            debug!("Error is non-retryable, stopping: {}", e);
                        }
                        return Err(e);
                    }

                    if attempt >= max_attempts {
                        if self.log_retries {
                            warn!("Operation failed after {} attempts, giving up: {}", attempt, e);
                        }
                        return Err(e);
                    }

                    if self.log_retries {
                        warn!(
                            attempt,
                            max_attempts,
                            error = %e,
                            "Attempt {}/{} failed, retrying in {:?}: {}",
                            attempt,
                            max_attempts,
                            policy.delay,
                            e
                        );
                    }

                    sleep(policy.delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast(retries: u32) -> RetryPolicy {
        RetryPolicy::new(retries, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_success_first_attempt() {
        let executor = RetryExecutor::silent();
        let result: Result<i32, LlmError> =
            executor.execute(&fast(3), || async { Ok(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_rate_limit_succeeds_on_later_attempt() {
        let executor = RetryExecutor::silent();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result = executor
            .execute(&fast(3), || {
                let counter = counter.clone();
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    if n < 3 {
                        Err(LlmError::from_status(429, "slow down"))
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_invoke_retries_plus_one() {
        let executor = RetryExecutor::silent();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<(), LlmError> = executor
            .execute(&fast(2), || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(LlmError::from_status(503, "unavailable"))
                }
            })
            .await;

        assert!(matches!(result, Err(LlmError::ServerError { status: 503, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_auth_error_not_retried() {
        let executor = RetryExecutor::silent();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<(), LlmError> = executor
            .execute(&fast(5), || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(LlmError::from_status(401, "bad key"))
                }
            })
            .await;

        assert!(matches!(result, Err(LlmError::AuthError(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_no_retry_policy_single_attempt() {
        let executor = RetryExecutor::silent();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let _ = executor
            .execute(&RetryPolicy::none(), || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(LlmError::Timeout)
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
