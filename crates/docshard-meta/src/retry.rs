//! Bounded retry with exponential backoff.
//!
//! Only errors that the coordinator resolves on its own are retried: version
//! conflicts, stale chunk maps and unreachable nodes. Each attempt re-runs
//! the whole operation, so callers re-read metadata inside the closure and
//! never replay a plan built against stale state.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::config::RetryConfig;
use crate::types::MetaError;

/// Executor for retry operations.
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    /// Create a new RetryExecutor with the given configuration.
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Runs `operation` until it succeeds, fails with a non-retried error,
    /// or `max_attempts` is reached. The last error is returned unchanged.
    pub async fn execute<F, Fut, T>(&self, what: &str, mut operation: F) -> Result<T, MetaError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, MetaError>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_internally_retried() && attempt < self.config.max_attempts => {
                    let backoff = self.compute_backoff(attempt - 1);
                    tracing::debug!(
                        op = what,
                        attempt,
                        kind = %e.kind(),
                        backoff_ms = backoff.as_millis() as u64,
                        "retrying after transient error"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => {
                    if e.is_internally_retried() {
                        tracing::warn!(op = what, attempts = attempt, error = %e, "retries exhausted");
                    }
                    return Err(e);
                }
            }
        }
    }

    /// `initial_backoff * multiplier^attempt`, capped, plus up to 50% jitter.
    fn compute_backoff(&self, attempt: u32) -> Duration {
        let base = self.config.initial_backoff_ms as f64;
        let computed = base * self.config.backoff_multiplier.powi(attempt as i32);
        let capped = computed.min(self.config.max_backoff_ms as f64) as u64;
        let jitter = if capped > 1 {
            rand::thread_rng().gen_range(0..=capped / 2)
        } else {
            0
        };
        Duration::from_millis(capped.saturating_add(jitter))
    }
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn unreachable() -> MetaError {
        MetaError::Unreachable {
            target: "shard0001".to_string(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_then_succeeds() {
        let executor = RetryExecutor::default();
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result = executor
            .execute("test", move || async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(unreachable())
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let executor = RetryExecutor::new(RetryConfig {
            max_attempts: 4,
            ..RetryConfig::default()
        });
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<(), _> = executor
            .execute("test", move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(unreachable())
            })
            .await;
        assert!(matches!(result, Err(MetaError::Unreachable { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_does_not_retry_authorization_failure() {
        let executor = RetryExecutor::default();
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<(), _> = executor
            .execute("test", move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(MetaError::Unauthorized {
                    action: "split".to_string(),
                    resource: "db.c".to_string(),
                })
            })
            .await;
        assert!(matches!(result, Err(MetaError::Unauthorized { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_backoff_capped() {
        let executor = RetryExecutor::new(RetryConfig {
            max_attempts: 10,
            initial_backoff_ms: 100,
            max_backoff_ms: 400,
            backoff_multiplier: 2.0,
        });
        let d = executor.compute_backoff(8);
        assert!(d >= Duration::from_millis(400));
        assert!(d <= Duration::from_millis(600));
    }
}
