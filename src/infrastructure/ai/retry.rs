//! Retry policy with exponential backoff for provider requests.
//!
//! Backoff doubles per attempt from the initial delay up to the cap:
//! 1s, 2s, 4s ... 16s. Only transient errors are retried.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

use crate::domain::errors::PlannerError;

pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 16_000,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_backoff_ms: u64, max_backoff_ms: u64) -> Self {
        Self {
            max_attempts,
            initial_backoff_ms,
            max_backoff_ms,
        }
    }

    /// Run `operation` up to `max_attempts` times, backing off between
    /// transient failures. Non-transient errors return immediately.
    pub async fn execute<F, Fut, T>(&self, mut operation: F) -> Result<T, PlannerError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, PlannerError>>,
    {
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    attempt += 1;
                    if !err.is_transient() || attempt >= self.max_attempts {
                        return Err(err);
                    }
                    let backoff = self.backoff_for(attempt - 1);
                    warn!(
                        attempt,
                        max = self.max_attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %err,
                        "provider call failed, retrying"
                    );
                    sleep(backoff).await;
                }
            }
        }
    }

    fn backoff_for(&self, attempt: u32) -> Duration {
        let ms = self
            .initial_backoff_ms
            .saturating_mul(2_u64.saturating_pow(attempt))
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_backoff_doubles_to_cap() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_for(0), Duration::from_millis(1_000));
        assert_eq!(policy.backoff_for(1), Duration::from_millis(2_000));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(4_000));
        assert_eq!(policy.backoff_for(3), Duration::from_millis(8_000));
        assert_eq!(policy.backoff_for(4), Duration::from_millis(16_000));
        assert_eq!(policy.backoff_for(5), Duration::from_millis(16_000));
    }

    #[tokio::test]
    async fn test_success_first_attempt() {
        let policy = RetryPolicy::new(3, 10, 100);
        let calls = Arc::new(AtomicU32::new(0));
        let result = policy
            .execute(|| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, PlannerError>(7)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_transient_error_retried() {
        let policy = RetryPolicy::new(3, 10, 100);
        let calls = Arc::new(AtomicU32::new(0));
        let result = policy
            .execute(|| {
                let calls = calls.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(PlannerError::Timeout {
                            provider: "local".into(),
                            seconds: 1,
                        })
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let policy = RetryPolicy::new(3, 10, 100);
        let calls = Arc::new(AtomicU32::new(0));
        let result: Result<(), _> = policy
            .execute(|| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(PlannerError::MalformedResponse {
                        provider: "local".into(),
                        reason: "no json".into(),
                    })
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhaustion_after_max_attempts() {
        let policy = RetryPolicy::new(3, 10, 100);
        let calls = Arc::new(AtomicU32::new(0));
        let result: Result<(), _> = policy
            .execute(|| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(PlannerError::RequestFailed {
                        provider: "local".into(),
                        reason: "connection refused".into(),
                    })
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
