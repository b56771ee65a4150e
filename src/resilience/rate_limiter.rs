//! Rate limiter stage: an in-process token bucket.
//!
//! Simplified from a distributed token-bucket design (optimistic-locking
//! compare-and-swap against a pluggable store) to a single atomic bucket,
//! since this runtime rate-limits per-process, per-operation traffic rather
//! than traffic shared across a fleet.

use crate::resilience::error::ResilienceError;
use std::sync::Mutex;
use std::time::{Duration, Instant};

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket limiting the rate of operations admitted per second.
pub struct RateLimiterPolicy {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

impl RateLimiterPolicy {
    pub fn new(capacity: u32, refill_per_sec: u32) -> Self {
        Self {
            capacity: capacity as f64,
            refill_per_sec: refill_per_sec as f64,
            state: Mutex::new(BucketState { tokens: capacity as f64, last_refill: Instant::now() }),
        }
    }

    fn refill(state: &mut BucketState, capacity: f64, refill_per_sec: f64) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * refill_per_sec).min(capacity);
        state.last_refill = now;
    }

    /// Seconds until one more token is available, given the current deficit.
    fn wait_for_one_token(&self, deficit: f64) -> Duration {
        if self.refill_per_sec <= 0.0 {
            return Duration::MAX;
        }
        Duration::from_secs_f64(deficit / self.refill_per_sec)
    }

    /// Tries to take one permit without blocking.
    ///
    /// Returns `Err(ResilienceError::RateLimited { retry_after })` when the
    /// bucket is empty; `retry_after` is how long until the next token.
    pub fn try_acquire<E>(&self) -> Result<(), ResilienceError<E>> {
        let mut state = self.state.lock().expect("rate limiter mutex poisoned");
        Self::refill(&mut state, self.capacity, self.refill_per_sec);

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            Ok(())
        } else {
            let deficit = 1.0 - state.tokens;
            Err(ResilienceError::RateLimited { retry_after: self.wait_for_one_token(deficit) })
        }
    }

    /// Waits cooperatively for a permit, honoring a per-operation deadline.
    /// Returns `Err(ResilienceError::RateLimited)` if the deadline would
    /// elapse before a token becomes available.
    pub async fn acquire<E>(&self, deadline: Duration) -> Result<(), ResilienceError<E>> {
        let start = Instant::now();
        loop {
            match self.try_acquire::<E>() {
                Ok(()) => return Ok(()),
                Err(ResilienceError::RateLimited { retry_after }) => {
                    if start.elapsed() + retry_after > deadline {
                        return Err(ResilienceError::RateLimited { retry_after });
                    }
                    tokio::time::sleep(retry_after.min(Duration::from_millis(50))).await;
                }
                Err(other) => return Err(other),
            }
        }
    }
}
