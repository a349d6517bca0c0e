//! Resilience primitives shared by the API clients.
//!
//! - [`rate_limiter`]: adaptive token bucket for outbound source requests
//! - [`circuit_breaker`]: fail-fast guard around a remote dependency
//! - [`retry`]: bounded exponential backoff with jitter

pub mod circuit_breaker;
pub mod rate_limiter;
pub mod retry;

pub use circuit_breaker::{
    BreakerFailure, CircuitBreaker, CircuitConfig, CircuitError, CircuitState, CircuitStats,
};
pub use rate_limiter::{AdaptiveRateLimiter, RateLimiterStats, TokenBucket};
pub use retry::{retry, RetryConfig, RetryDecision, Retryable};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the guard if a previous holder panicked.
///
/// The guarded state here is plain counters and timestamps, which stay
/// consistent across a panic.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
