//! Exponential backoff with jitter for retryable operations, driven by the
//! same classifier the runtime uses: a fatal classification stops the
//! retry loop immediately.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{JobflowError, Result};

use super::error_classifier::classify;

/// Backoff parameters. Delay for attempt `n` (1-based) is
/// `min(base * 2^(n-1) + jitter, max)` with jitter uniform in
/// `[0, base)`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before the retry following attempt `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
        let jitter = Duration::from_millis(fastrand::u64(0..self.base_delay.as_millis().max(1) as u64));
        (exp + jitter).min(self.max_delay)
    }
}

/// Run `operation` until it succeeds, fails fatally, or exhausts the
/// attempt budget. Only errors the classifier deems retryable are retried.
pub async fn with_retry<T, F, Fut>(
    policy: RetryPolicy,
    operation_name: &str,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) => {
                let classification = classify(&error.to_string(), None, None);
                if !classification.retryable {
                    debug!(
                        operation = operation_name,
                        category = %classification.category,
                        "Fatal error, not retrying"
                    );
                    return Err(error);
                }
                if attempt >= policy.max_attempts {
                    warn!(
                        operation = operation_name,
                        attempts = attempt,
                        "Retry budget exhausted"
                    );
                    return Err(JobflowError::ExecutionError(format!(
                        "{operation_name} failed after {attempt} attempts: {error}"
                    )));
                }
                let delay = policy.delay_for(attempt);
                warn!(
                    operation = operation_name,
                    attempt = attempt,
                    delay_ms = delay.as_millis() as u64,
                    category = %classification.category,
                    error = %error,
                    "Retrying after transient error"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        }
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_errors() {
        let calls = AtomicU32::new(0);
        let result = with_retry(fast_policy(), "flaky", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(JobflowError::ExecutionError("connection timed out".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fatal_error_stops_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retry(fast_policy(), "broken", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(JobflowError::ExecutionError("AccessDenied".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_budget_exhausted() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retry(fast_policy(), "down", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(JobflowError::ExecutionError("ECONNREFUSED".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_delay_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1_000),
        };
        assert!(policy.delay_for(1) < policy.delay_for(4));
        assert!(policy.delay_for(9) <= policy.max_delay);
    }
}
