//! Circuit breaker around a remote dependency, built on the `recloser` crate.
//!
//! States:
//! - Closed: calls pass through; qualifying failures fill the window
//! - Open: calls fail fast with [`CircuitError::Rejected`] until the
//!   recovery timeout has elapsed since the breaker tripped
//! - HalfOpen: one trial call is let through; success closes, failure reopens
//!
//! The closed window holds the last `failure_threshold` outcomes and trips
//! only when every one of them is a qualifying failure, which is the same as
//! `failure_threshold` consecutive failures. Errors whose
//! [`BreakerFailure::trips_breaker`] returns `false` are recorded by the
//! window as successes.
//!
//! `recloser` keeps its state private, so [`CircuitBreaker::state`] reports a
//! mirror maintained from call outcomes.

use recloser::{AsyncRecloser, Error as RecloserError, Recloser};
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use super::lock;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => f.write_str("closed"),
            Self::Open => f.write_str("open"),
            Self::HalfOpen => f.write_str("half_open"),
        }
    }
}

/// Error type for circuit-protected operations.
#[derive(Debug, thiserror::Error)]
pub enum CircuitError<E> {
    /// The breaker is open; the operation was not polled.
    #[error("circuit breaker open, request rejected")]
    Rejected,

    /// The operation ran and failed.
    #[error(transparent)]
    Inner(E),
}

impl<E> From<RecloserError<E>> for CircuitError<E> {
    fn from(err: RecloserError<E>) -> Self {
        match err {
            RecloserError::Rejected => Self::Rejected,
            RecloserError::Inner(e) => Self::Inner(e),
        }
    }
}

/// Classifies which errors count toward opening the breaker.
pub trait BreakerFailure {
    fn trips_breaker(&self) -> bool;
}

/// Configuration for a circuit breaker.
#[derive(Debug, Clone)]
pub struct CircuitConfig {
    /// Consecutive qualifying failures that open the circuit.
    pub failure_threshold: u32,
    /// Time the circuit stays open before a trial call is allowed.
    pub recovery_timeout: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
        }
    }
}

impl CircuitConfig {
    /// Failure rate the window must exceed to trip.
    ///
    /// Sits between `(n - 1) / n` and `1.0`, so only a window made entirely
    /// of failures trips it.
    fn error_rate(&self) -> f32 {
        let window = self.failure_threshold.max(1) as f32;
        1.0 - 0.5 / window
    }

    fn build(&self) -> AsyncRecloser {
        Recloser::custom()
            .error_rate(self.error_rate())
            .closed_len(self.failure_threshold.max(1) as usize)
            .half_open_len(1)
            .open_wait(self.recovery_timeout)
            .build()
            .into()
    }
}

/// Snapshot of breaker state and counters.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitStats {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub calls_total: u64,
    pub successes: u64,
    pub failures: u64,
    pub rejections: u64,
}

/// A named circuit breaker with call counters.
pub struct CircuitBreaker {
    name: String,
    config: CircuitConfig,
    inner: AsyncRecloser,

    consecutive_failures: AtomicU32,
    opened_at: Mutex<Option<Instant>>,

    calls_total: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    rejections: AtomicU64,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitConfig) -> Self {
        Self {
            name: name.into(),
            inner: config.build(),
            config,
            consecutive_failures: AtomicU32::new(0),
            opened_at: Mutex::new(None),
            calls_total: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn state(&self) -> CircuitState {
        match *lock(&self.opened_at) {
            None => CircuitState::Closed,
            Some(at) if at.elapsed() < self.config.recovery_timeout => CircuitState::Open,
            Some(_) => CircuitState::HalfOpen,
        }
    }

    /// Execute an async operation through the breaker.
    ///
    /// The future is built eagerly but only polled when the breaker admits
    /// the call.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: BreakerFailure,
    {
        let result = self
            .inner
            .call_with(|err: &E| err.trips_breaker(), f())
            .await;

        match result {
            Ok(value) => {
                self.calls_total.fetch_add(1, Ordering::Relaxed);
                self.on_success();
                Ok(value)
            }
            Err(RecloserError::Rejected) => {
                self.rejections.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(circuit = %self.name, "circuit open, rejecting call");
                Err(CircuitError::Rejected)
            }
            Err(RecloserError::Inner(err)) => {
                self.calls_total.fetch_add(1, Ordering::Relaxed);
                if err.trips_breaker() {
                    self.on_failure();
                } else {
                    self.consecutive_failures.store(0, Ordering::Relaxed);
                }
                Err(CircuitError::Inner(err))
            }
        }
    }

    fn on_success(&self) {
        self.successes.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Relaxed);
        if lock(&self.opened_at).take().is_some() {
            tracing::info!(circuit = %self.name, "circuit closed");
        }
    }

    fn on_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures < self.config.failure_threshold {
            return;
        }

        let mut opened_at = lock(&self.opened_at);
        if opened_at.is_none() {
            tracing::warn!(circuit = %self.name, failures, "circuit opened");
        }
        *opened_at = Some(Instant::now());
    }

    pub fn stats(&self) -> CircuitStats {
        CircuitStats {
            name: self.name.clone(),
            state: self.state(),
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
            calls_total: self.calls_total.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            rejections: self.rejections.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug)]
    enum TestError {
        Transport,
        Validation,
    }

    impl BreakerFailure for TestError {
        fn trips_breaker(&self) -> bool {
            matches!(self, Self::Transport)
        }
    }

    const RECOVERY: Duration = Duration::from_millis(50);

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitConfig {
                failure_threshold: 3,
                recovery_timeout: RECOVERY,
            },
        )
    }

    async fn fail(cb: &CircuitBreaker, err: TestError) {
        let result: Result<(), _> = cb.call(|| async { Err(err) }).await;
        assert!(matches!(result, Err(CircuitError::Inner(_))));
    }

    async fn trip(cb: &CircuitBreaker) {
        for _ in 0..3 {
            fail(cb, TestError::Transport).await;
        }
    }

    #[test]
    fn error_rate_only_trips_on_a_full_window_of_failures() {
        for threshold in [1, 3, 5, 20] {
            let config = CircuitConfig {
                failure_threshold: threshold,
                recovery_timeout: RECOVERY,
            };
            let rate = config.error_rate();
            let one_success = (threshold - 1) as f32 / threshold as f32;
            assert!(rate < 1.0);
            assert!(rate > one_success, "threshold {threshold}");
        }
    }

    #[tokio::test]
    async fn opens_after_threshold_and_rejects_without_polling() {
        let cb = breaker();
        trip(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);

        let invoked = AtomicUsize::new(0);
        let result: Result<(), CircuitError<TestError>> = cb
            .call(|| async {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(CircuitError::Rejected)));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
        assert_eq!(cb.stats().rejections, 1);
        assert_eq!(cb.stats().calls_total, 3);
    }

    #[tokio::test]
    async fn below_threshold_stays_closed() {
        let cb = breaker();
        fail(&cb, TestError::Transport).await;
        fail(&cb, TestError::Transport).await;

        let result: Result<u8, CircuitError<TestError>> = cb.call(|| async { Ok(7) }).await;
        assert_eq!(result.ok(), Some(7));
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_after_recovery_then_closes_on_success() {
        let cb = breaker();
        trip(&cb).await;

        let early: Result<u8, CircuitError<TestError>> = cb.call(|| async { Ok(1) }).await;
        assert!(matches!(early, Err(CircuitError::Rejected)));

        tokio::time::sleep(RECOVERY * 2).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        let trial: Result<u8, CircuitError<TestError>> = cb.call(|| async { Ok(1) }).await;
        assert_eq!(trial.ok(), Some(1));
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.stats().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn failed_trial_call_reopens() {
        let cb = breaker();
        trip(&cb).await;
        tokio::time::sleep(RECOVERY * 2).await;

        fail(&cb, TestError::Transport).await;
        assert_eq!(cb.state(), CircuitState::Open);

        let result: Result<(), CircuitError<TestError>> = cb.call(|| async { Ok(()) }).await;
        assert!(matches!(result, Err(CircuitError::Rejected)));
    }

    #[tokio::test]
    async fn non_qualifying_errors_do_not_trip() {
        let cb = breaker();
        for _ in 0..10 {
            fail(&cb, TestError::Validation).await;
        }
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.stats().failures, 0);
        assert_eq!(cb.stats().calls_total, 10);

        let result: Result<(), CircuitError<TestError>> = cb.call(|| async { Ok(()) }).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn success_breaks_a_failure_run() {
        let cb = breaker();
        fail(&cb, TestError::Transport).await;
        fail(&cb, TestError::Transport).await;
        let _: Result<(), CircuitError<TestError>> = cb.call(|| async { Ok(()) }).await;
        fail(&cb, TestError::Transport).await;
        fail(&cb, TestError::Transport).await;
        assert_eq!(cb.state(), CircuitState::Closed);

        let result: Result<(), CircuitError<TestError>> = cb.call(|| async { Ok(()) }).await;
        assert!(result.is_ok());
    }
}
