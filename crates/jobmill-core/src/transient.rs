//! Retry of transient storage failures at the calling layer.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::warn;

use jobmill_protocols::JobError;

/// Backoff for `StorageUnavailable` errors.
#[derive(Debug, Clone)]
pub struct TransientRetry {
    /// Retries after the first call.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for TransientRetry {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl TransientRetry {
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Run `operation`, retrying while it fails with a transient error.
    pub async fn run<F, Fut, T>(&self, what: &str, mut operation: F) -> Result<T, JobError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, JobError>>,
    {
        let mut attempt = 0;
        loop {
            match operation().await {
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    let delay = self.delay_for_attempt(attempt);
                    warn!(
                        "{} failed with transient error (attempt {}): {}, retrying in {:?}",
                        what,
                        attempt + 1,
                        e,
                        delay
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_delay_is_capped() {
        let retry = TransientRetry::default();
        assert_eq!(retry.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(retry.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(retry.delay_for_attempt(30), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_then_succeeds() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result = TransientRetry::default()
            .run("test", move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(JobError::StorageUnavailable("down".to_string()))
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(result, Ok(7));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_and_passes_through_permanent_errors() {
        let retry = TransientRetry {
            max_retries: 2,
            ..Default::default()
        };
        let transient = AtomicU32::new(0);
        let calls = &transient;
        let result: Result<(), _> = retry
            .run("test", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(JobError::StorageUnavailable("down".to_string()))
            })
            .await;
        assert!(result.unwrap_err().is_transient());
        assert_eq!(transient.load(Ordering::SeqCst), 3);

        let permanent = AtomicU32::new(0);
        let calls = &permanent;
        let result: Result<(), _> = retry
            .run("test", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(JobError::NotFound("x".to_string()))
            })
            .await;
        assert!(matches!(result, Err(JobError::NotFound(_))));
        assert_eq!(permanent.load(Ordering::SeqCst), 1);
    }
}
