//! Retry with exponential backoff for idempotent durable writes.

use std::future::Future;
use std::time::Duration;

use tidings_common::AppResult;
use tracing::warn;

/// Retry configuration with exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_delay: Duration,
    /// Upper bound for any delay.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(1),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay after the given failed attempt (0-indexed).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = i32::try_from(attempt).unwrap_or(i32::MAX);
        let delay_secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exp);
        Duration::from_secs_f64(delay_secs.min(self.max_delay.as_secs_f64()))
    }

    /// Run `op`, retrying transient conflicts.
    ///
    /// Only errors for which [`tidings_common::AppError::is_transient`] holds
    /// are retried; anything else is returned at once.
    pub async fn run<T, F, Fut>(&self, op_name: &str, mut op: F) -> AppResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = AppResult<T>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Err(e) if e.is_transient() && attempt + 1 < self.max_attempts => {
                    let delay = self.delay_for_attempt(attempt);
                    warn!(
                        op = op_name,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient conflict, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}
