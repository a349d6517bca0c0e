//! Bounded retry with exponential backoff and jitter.
//!
//! Errors decide for themselves whether another attempt is worthwhile via
//! [`Retryable`]. A rate-limit error has already slept inside the limiter, so
//! it asks for an immediate retry instead of an additional backoff.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Back off, then try again.
    Retry,
    /// Try again without backing off.
    RetryNow,
    /// Surface the error.
    GiveUp,
}

pub trait Retryable {
    fn retry_decision(&self) -> RetryDecision;
}

/// Retry policy for a single logical request.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, including the first. Values below 1 behave as 1.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    /// Scale each delay by a random factor in `[0.5, 1.0]`.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::request(3)
    }
}

impl RetryConfig {
    /// Backoff for one outbound API request: 1s doubling up to 10s.
    #[must_use]
    pub fn request(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            factor: 2.0,
            jitter: true,
        }
    }

    /// Millisecond delays, no jitter. Meant for tests against local fakes.
    #[must_use]
    pub fn fast(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            factor: 2.0,
            jitter: false,
        }
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter {
            delay.mul_f64(rand::thread_rng().gen_range(0.5..=1.0))
        } else {
            delay
        }
    }
}

/// Run `operation` until it succeeds, gives up, or attempts run out.
pub async fn retry<F, Fut, T, E>(
    operation_name: &str,
    config: &RetryConfig,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + std::fmt::Display,
{
    let max_attempts = config.max_attempts.max(1);
    let mut delay = config.initial_delay;
    let mut attempt = 0;

    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::info!(operation = operation_name, attempt, "succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) => {
                let decision = err.retry_decision();
                if decision == RetryDecision::GiveUp || attempt >= max_attempts {
                    return Err(err);
                }

                if decision == RetryDecision::Retry {
                    let wait = config.jittered(delay);
                    tracing::warn!(
                        operation = operation_name,
                        attempt,
                        max_attempts,
                        error = %err,
                        wait_ms = wait.as_millis() as u64,
                        "attempt failed, backing off"
                    );
                    sleep(wait).await;
                    delay = delay.mul_f64(config.factor).min(config.max_delay);
                } else {
                    tracing::debug!(operation = operation_name, attempt, error = %err, "retrying immediately");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    #[derive(Debug)]
    struct TestError(RetryDecision);

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{:?}", self.0)
        }
    }

    impl Retryable for TestError {
        fn retry_decision(&self) -> RetryDecision {
            self.0
        }
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let attempts = AtomicU32::new(0);
        let result: Result<u32, TestError> = retry("op", &RetryConfig::fast(3), || async {
            let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if n < 3 {
                Err(TestError(RetryDecision::Retry))
            } else {
                Ok(n)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
    }

    #[tokio::test]
    async fn stops_at_max_attempts() {
        let attempts = AtomicU32::new(0);
        let result: Result<(), TestError> = retry("op", &RetryConfig::fast(4), || async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(TestError(RetryDecision::Retry))
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn give_up_is_not_retried() {
        let attempts = AtomicU32::new(0);
        let result: Result<(), TestError> = retry("op", &RetryConfig::fast(5), || async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(TestError(RetryDecision::GiveUp))
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_now_skips_backoff() {
        let config = RetryConfig {
            initial_delay: Duration::from_secs(60),
            ..RetryConfig::fast(3)
        };
        let attempts = AtomicU32::new(0);
        let start = Instant::now();
        let _: Result<(), TestError> = retry("op", &config, || async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(TestError(RetryDecision::RetryNow))
        })
        .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn jittered_delay_stays_within_half_to_full() {
        let config = RetryConfig::request(3);
        for _ in 0..50 {
            let d = config.jittered(Duration::from_secs(4));
            assert!(d >= Duration::from_secs(2) && d <= Duration::from_secs(4));
        }
    }
}
