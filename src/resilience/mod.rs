//! Resilience primitives: the policies composed by [`pipeline::ResiliencePipeline`]
//! around every protocol operation a node executes.
//!
//! Each stage is independently testable and independently optional (aside
//! from retry, which always runs — a one-attempt retry policy is the
//! no-retry case). See [`pipeline`] for the composition order.

pub mod backoff;
pub mod bulkhead;
pub mod circuit_breaker;
pub mod clock;
pub mod error;
pub mod jitter;
pub mod pipeline;
pub mod rate_limiter;
pub mod retry;
pub mod sleeper;
pub mod timeout;

pub use backoff::Backoff;
pub use bulkhead::BulkheadPolicy;
pub use circuit_breaker::{CircuitBreakerConfig, CircuitBreakerPolicy, CircuitState};
pub use clock::{Clock, MonotonicClock};
pub use error::{ResilienceError, MAX_RETRY_FAILURES};
pub use jitter::Jitter;
pub use pipeline::{ResiliencePipeline, ResiliencePipelineBuilder};
pub use rate_limiter::RateLimiterPolicy;
pub use retry::{BuildError as RetryBuildError, RetryPolicy, RetryPolicyBuilder};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use timeout::{TimeoutError, TimeoutPolicy, MAX_TIMEOUT};
