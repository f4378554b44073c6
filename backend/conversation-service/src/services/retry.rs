//! Bounded retry of lock contention with exponential backoff and jitter

use crate::error::{AppError, AppResult};
use crate::metrics;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
    /// Add random jitter to backoff (±30%)
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(25),
            max_backoff: Duration::from_millis(500),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn with_max_retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }
}

/// Runs `f` until it succeeds or fails with a non-retryable error.
/// Only [`AppError::is_retryable`] errors are retried; the last one surfaces unchanged.
pub async fn retry_on_conflict<F, Fut, T>(config: &RetryConfig, mut f: F) -> AppResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = AppResult<T>>,
{
    let mut attempt = 0;
    let mut backoff = config.initial_backoff;

    loop {
        match f().await {
            Ok(result) => return Ok(result),
            Err(e) if e.is_retryable() && attempt < config.max_retries => {
                attempt += 1;
                metrics::record_conflict(true);

                let delay = calculate_backoff(backoff, config.jitter);
                warn!(
                    error = %e,
                    attempt,
                    max_retries = config.max_retries,
                    "conversation busy, retrying in {:?}",
                    delay
                );
                tokio::time::sleep(delay).await;

                backoff = Duration::from_millis(
                    ((backoff.as_millis() as f64 * config.backoff_multiplier)
                        .min(config.max_backoff.as_millis() as f64)) as u64,
                );
            }
            Err(e) => {
                if matches!(e, AppError::Conflict(_)) {
                    metrics::record_conflict(false);
                }
                return Err(e);
            }
        }
    }
}

fn calculate_backoff(base: Duration, jitter: bool) -> Duration {
    if jitter {
        let mut rng = rand::thread_rng();
        let jitter_factor = 1.0 + rng.gen_range(-0.3..0.3);
        Duration::from_millis((base.as_millis() as f64 * jitter_factor) as u64)
    } else {
        base
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use uuid::Uuid;

    fn fast(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            initial_backoff: Duration::from_millis(1),
            jitter: false,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_conflict_retried_until_success() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let result = retry_on_conflict(&fast(3), move || {
            let count = counter_clone.fetch_add(1, Ordering::SeqCst);
            async move {
                if count < 2 {
                    Err(AppError::Conflict(Uuid::nil()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(42));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_conflict_surfaces_after_budget() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let result: AppResult<()> = retry_on_conflict(&fast(2), move || {
            counter_clone.fetch_add(1, Ordering::SeqCst);
            async { Err(AppError::Conflict(Uuid::nil())) }
        })
        .await;

        assert_eq!(result, Err(AppError::Conflict(Uuid::nil())));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_validation_errors_not_retried() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let result: AppResult<()> = retry_on_conflict(&fast(5), move || {
            counter_clone.fetch_add(1, Ordering::SeqCst);
            async { Err(AppError::forbidden("not a member")) }
        })
        .await;

        assert!(matches!(result, Err(AppError::Forbidden(_))));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
