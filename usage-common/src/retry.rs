use std::future::Future;
use std::time::Duration;

use tracing::warn;

/// Bounded exponential backoff for calls that can fail transiently.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub initial_interval: Duration,
    pub multiplier: f64,
    pub maximum_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            initial_interval: Duration::from_millis(500),
            multiplier: 2.0,
            maximum_interval: Duration::from_millis(2000),
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after the given failed attempt (zero-indexed).
    pub fn retry_interval(&self, attempt: u32) -> Duration {
        let pow = self.multiplier.powi(attempt as i32);
        let scaled = if pow.is_finite() {
            self.initial_interval.mul_f64(pow)
        } else {
            self.maximum_interval
        };
        scaled.min(self.maximum_interval)
    }
}

/// Run `op` up to `policy.max_attempts` times, sleeping between attempts.
/// Errors `is_retryable` rejects are returned immediately.
pub async fn with_retries<T, E, F, Fut>(
    policy: &RetryPolicy,
    what: &str,
    is_retryable: impl Fn(&E) -> bool,
    mut op: F,
) -> Result<T, E>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt: u32 = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(error) if attempt + 1 < policy.max_attempts && is_retryable(&error) => {
                let delay = policy.retry_interval(attempt);
                warn!(
                    "{what} failed on attempt {} of {}, retrying in {}ms: {error}",
                    attempt + 1,
                    policy.max_attempts,
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(error) => return Err(error),
        }
    }
}
