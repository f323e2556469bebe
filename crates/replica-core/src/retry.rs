//! Retry engine: exponential backoff with jitter for any fallible async operation.
//!
//! Every fallible boundary call in the core (replication push/pull, queued
//! operations, conflict write-back) goes through [`RetryEngine`] instead of
//! hand-rolled sleep loops.

use crate::config::RetryConfig;
use crate::error::{Result, SyncError};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Delay to wait after failed attempt number `attempt` (1-based).
///
/// `base_delay * backoff_factor^(attempt-1)`, capped at `max_delay`.
pub fn calculate_backoff(attempt: u32, config: &RetryConfig) -> Duration {
    let delay_ms = config.base_delay_ms as f64
        * config.backoff_factor.powi(attempt.saturating_sub(1) as i32);

    Duration::from_millis(delay_ms.min(config.max_delay_ms as f64) as u64)
}

/// Spread a delay uniformly over ±25% so that processes that failed together
/// don't retry together.
pub fn apply_jitter(delay: Duration) -> Duration {
    let factor = rand::rng().random_range(0.75..=1.25);
    delay.mul_f64(factor)
}

/// Runs operations with retries according to a [`RetryConfig`].
#[derive(Debug, Clone, Default)]
pub struct RetryEngine {
    config: RetryConfig,
}

impl RetryEngine {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Run `operation` up to `max_attempts` times.
    ///
    /// The closure receives the 1-based attempt number. Errors that are not
    /// transient are returned immediately, unchanged. When every attempt
    /// fails transiently the last error is returned wrapped in
    /// [`SyncError::RetriesExhausted`].
    pub async fn execute_with_retry<T, F, Fut>(
        &self,
        operation: F,
        label: &str,
        context: &str,
    ) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.execute_with_attempts(self.config.max_attempts, operation, label, context)
            .await
    }

    /// Same as [`execute_with_retry`](Self::execute_with_retry) with an explicit attempt budget.
    pub async fn execute_with_attempts<T, F, Fut>(
        &self,
        max_attempts: u32,
        mut operation: F,
        label: &str,
        context: &str,
    ) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match operation(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!("{} succeeded on attempt {} ({})", label, attempt, context);
                    }
                    return Ok(value);
                }
                Err(err) if !err.is_retryable() => {
                    debug!("{} failed with non-retryable error ({}): {}", label, context, err);
                    return Err(err);
                }
                Err(err) => {
                    warn!(
                        "{} attempt {}/{} failed ({}): {}",
                        label, attempt, max_attempts, context, err
                    );

                    if attempt >= max_attempts {
                        return Err(SyncError::RetriesExhausted {
                            label: label.to_string(),
                            attempts: attempt,
                            source: Box::new(err),
                        });
                    }

                    let mut delay = calculate_backoff(attempt, &self.config);
                    if self.config.jitter {
                        delay = apply_jitter(delay).min(self.config.max_delay());
                    }
                    tokio::time::sleep(delay).await;
                    attempt += 1;
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

    fn no_jitter() -> RetryConfig {
        RetryConfig {
            jitter: false,
            ..Default::default()
        }
    }

    // ==================== Backoff calculation ====================

    #[test]
    fn test_calculate_backoff_exponential() {
        let config = RetryConfig {
            base_delay_ms: 1_000,
            backoff_factor: 2.0,
            max_delay_ms: 5_000,
            ..Default::default()
        };

        // 1s, 2s, 4s, 5s (capped)
        assert_eq!(calculate_backoff(1, &config), Duration::from_secs(1));
        assert_eq!(calculate_backoff(2, &config), Duration::from_secs(2));
        assert_eq!(calculate_backoff(3, &config), Duration::from_secs(4));
        assert_eq!(calculate_backoff(4, &config), Duration::from_secs(5));
        assert_eq!(calculate_backoff(10, &config), Duration::from_secs(5));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let delay = Duration::from_millis(1_000);
        for _ in 0..200 {
            let jittered = apply_jitter(delay);
            assert!(jittered >= Duration::from_millis(750));
            assert!(jittered <= Duration::from_millis(1_250));
        }
    }

    // ==================== execute_with_retry ====================

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let engine = RetryEngine::new(no_jitter());
        let calls = Arc::new(AtomicU32::new(0));

        let calls_clone = Arc::clone(&calls);
        let result = engine
            .execute_with_retry(
                move |attempt| {
                    let calls = Arc::clone(&calls_clone);
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        if attempt < 3 {
                            Err(SyncError::Transient("timeout".into()))
                        } else {
                            Ok(attempt)
                        }
                    }
                },
                "push",
                "test",
            )
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_annotates_attempts() {
        let engine = RetryEngine::new(no_jitter());

        let result: Result<()> = engine
            .execute_with_retry(
                |_| async { Err(SyncError::Transient("unreachable".into())) },
                "pull",
                "test",
            )
            .await;

        match result {
            Err(SyncError::RetriesExhausted {
                label, attempts, ..
            }) => {
                assert_eq!(label, "pull");
                assert_eq!(attempts, 3);
            }
            other => panic!("expected RetriesExhausted, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_transient_is_not_retried() {
        let engine = RetryEngine::new(no_jitter());
        let calls = Arc::new(AtomicU32::new(0));

        let calls_clone = Arc::clone(&calls);
        let result: Result<()> = engine
            .execute_with_retry(
                move |_| {
                    let calls = Arc::clone(&calls_clone);
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Err(SyncError::NotInitialized)
                    }
                },
                "read",
                "test",
            )
            .await;

        assert!(matches!(result, Err(SyncError::NotInitialized)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_backoff_between_attempts() {
        let engine = RetryEngine::new(no_jitter());
        let start = tokio::time::Instant::now();

        let _: Result<()> = engine
            .execute_with_retry(
                |_| async { Err(SyncError::Transient("timeout".into())) },
                "push",
                "test",
            )
            .await;

        // 1s after the first failure, 2s after the second
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(3));
        assert!(elapsed < Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_budget_still_runs_once() {
        let engine = RetryEngine::new(no_jitter());
        let result = engine
            .execute_with_attempts(0, |_| async { Ok::<_, SyncError>(42) }, "op", "test")
            .await;
        assert_eq!(result.unwrap(), 42);
    }
}
