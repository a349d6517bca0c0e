//! Adaptive token-bucket rate limiting.
//!
//! [`TokenBucket`] holds up to `capacity` tokens and refills continuously at
//! `requests_per_minute / 60` tokens per second. [`AdaptiveRateLimiter`] wraps
//! a bucket and rebuilds it at a lower rate when the remote signals overload,
//! then climbs back toward the base rate on sustained success.
//!
//! The limiter's mutex is only held while refilling and reserving tokens.
//! Every sleep (bucket deficit or server retry-after) happens after the guard
//! is dropped.

use serde::Serialize;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

use super::lock;

/// Successes required below base rate before the rate is raised.
const RECOVERY_STREAK: u32 = 10;
/// Multiplier applied to the current rate on recovery.
const RECOVERY_FACTOR: f64 = 1.1;
/// Floor for the adaptive rate, as a fraction of the base rate.
const MIN_RATE_FRACTION: f64 = 0.1;

/// A continuously refilling token bucket.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    refill_rate: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// A full bucket refilling at `refill_rate` tokens per second.
    pub fn new(capacity: f64, refill_rate: f64) -> Self {
        Self {
            capacity,
            refill_rate,
            tokens: capacity,
            last_refill: Instant::now(),
        }
    }

    /// A full bucket sized for `requests_per_minute` with the given burst.
    pub fn per_minute(burst_capacity: u32, requests_per_minute: f64) -> Self {
        Self::new(f64::from(burst_capacity), requests_per_minute / 60.0)
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }

    /// Tokens available right now, after refilling.
    pub fn available(&mut self) -> f64 {
        self.refill();
        self.tokens
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = now;
    }

    /// Deduct `n` tokens and return how long the caller must wait before the
    /// deduction is covered.
    ///
    /// The balance may go negative; later reservations queue behind the
    /// deficit, so concurrent callers are served in reservation order.
    pub fn reserve(&mut self, n: f64) -> Duration {
        self.refill();
        self.tokens -= n;
        if self.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-self.tokens / self.refill_rate)
        }
    }

    /// Rebuild at a new refill rate, keeping the current balance.
    fn with_rate(&mut self, refill_rate: f64) -> Self {
        self.refill();
        Self {
            capacity: self.capacity,
            refill_rate,
            tokens: self.tokens.min(self.capacity),
            last_refill: self.last_refill,
        }
    }
}

#[derive(Debug)]
struct LimiterState {
    bucket: TokenBucket,
    current_rpm: f64,
    consecutive_successes: u32,
    rate_limit_hits: u64,
}

/// Point-in-time view of the limiter, for stats and health output.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimiterStats {
    pub base_rpm: f64,
    pub current_rpm: f64,
    pub capacity: f64,
    pub available_tokens: f64,
    pub consecutive_successes: u32,
    pub rate_limit_hits: u64,
}

/// Token bucket that halves its rate on remote overload and recovers slowly.
#[derive(Debug)]
pub struct AdaptiveRateLimiter {
    base_rpm: f64,
    burst_capacity: u32,
    state: Mutex<LimiterState>,
}

impl AdaptiveRateLimiter {
    pub fn new(requests_per_minute: u32, burst_capacity: u32) -> Self {
        let base_rpm = f64::from(requests_per_minute);
        Self {
            base_rpm,
            burst_capacity,
            state: Mutex::new(LimiterState {
                bucket: TokenBucket::per_minute(burst_capacity, base_rpm),
                current_rpm: base_rpm,
                consecutive_successes: 0,
                rate_limit_hits: 0,
            }),
        }
    }

    /// Wait until `n` tokens are available, then take them.
    pub async fn acquire(&self, n: u32) {
        let wait = lock(&self.state).bucket.reserve(f64::from(n));
        if !wait.is_zero() {
            tracing::debug!(wait_ms = wait.as_millis() as u64, "rate limiter throttling request");
            tokio::time::sleep(wait).await;
        }
    }

    /// The remote signalled overload: halve the rate (floored at 10% of base)
    /// and, if the server sent a retry-after, sleep that long.
    pub async fn record_rate_limit(&self, retry_after: Option<Duration>) {
        {
            let mut state = lock(&self.state);
            let floor = self.base_rpm * MIN_RATE_FRACTION;
            let new_rpm = (state.current_rpm / 2.0).max(floor);
            state.bucket = state.bucket.with_rate(new_rpm / 60.0);
            state.current_rpm = new_rpm;
            state.consecutive_successes = 0;
            state.rate_limit_hits += 1;
            tracing::warn!(
                current_rpm = new_rpm,
                base_rpm = self.base_rpm,
                "rate limited by remote, reducing request rate"
            );
        }

        if let Some(delay) = retry_after {
            tracing::info!(retry_after_secs = delay.as_secs_f64(), "honoring retry-after");
            tokio::time::sleep(delay).await;
        }
    }

    /// Count a success; after a streak below base, raise the rate by 10%.
    pub fn record_success(&self) {
        let mut state = lock(&self.state);
        if state.current_rpm >= self.base_rpm {
            return;
        }
        state.consecutive_successes += 1;
        if state.consecutive_successes >= RECOVERY_STREAK {
            let new_rpm = (state.current_rpm * RECOVERY_FACTOR).min(self.base_rpm);
            state.bucket = state.bucket.with_rate(new_rpm / 60.0);
            state.current_rpm = new_rpm;
            state.consecutive_successes = 0;
            tracing::info!(current_rpm = new_rpm, "request rate recovering");
        }
    }

    /// Count a non-rate-limit failure. Resets the success streak only.
    pub fn record_error(&self) {
        lock(&self.state).consecutive_successes = 0;
    }

    pub fn current_rpm(&self) -> f64 {
        lock(&self.state).current_rpm
    }

    pub fn base_rpm(&self) -> f64 {
        self.base_rpm
    }

    pub fn stats(&self) -> RateLimiterStats {
        let mut state = lock(&self.state);
        let available_tokens = state.bucket.available();
        RateLimiterStats {
            base_rpm: self.base_rpm,
            current_rpm: state.current_rpm,
            capacity: f64::from(self.burst_capacity),
            available_tokens,
            consecutive_successes: state.consecutive_successes,
            rate_limit_hits: state.rate_limit_hits,
        }
    }
}
