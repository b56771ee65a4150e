//! Resilience pipeline: composes the timeout, bulkhead, rate limiter,
//! circuit breaker, and retry stages around a protocol operation.
//!
//! Composition order, outermost to innermost:
//! `deadline (timeout) -> bulkhead -> rate limiter -> circuit breaker ->
//! retry -> operation`. A deadline bounds the whole attempt, including every
//! retry; the bulkhead reserves a concurrency slot before anything else is
//! charged against the rate limit or the circuit breaker's failure count.

use crate::resilience::bulkhead::BulkheadPolicy;
use crate::resilience::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerPolicy};
use crate::resilience::error::ResilienceError;
use crate::resilience::rate_limiter::RateLimiterPolicy;
use crate::resilience::retry::RetryPolicy;
use crate::resilience::timeout::TimeoutPolicy;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Clone)]
pub struct ResiliencePipeline<E> {
    timeout: Option<TimeoutPolicy>,
    bulkhead: Option<BulkheadPolicy>,
    rate_limiter: Option<Arc<RateLimiterPolicy>>,
    circuit_breaker: Option<CircuitBreakerPolicy>,
    retry: RetryPolicy<E>,
}

impl<E> ResiliencePipeline<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    pub async fn execute<T, Fut, Op>(&self, operation: Op) -> Result<T, ResilienceError<E>>
    where
        T: Send,
        Fut: Future<Output = Result<T, ResilienceError<E>>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        let op_cell = Arc::new(Mutex::new(operation));
        let rate_limiter = self.rate_limiter.clone();
        let circuit_breaker = self.circuit_breaker.clone();
        let retry = self.retry.clone();
        let bulkhead = self.bulkhead.clone();
        let deadline = self.timeout.map(|t| t.duration()).unwrap_or(Duration::MAX);

        let past_bulkhead = async move {
            if let Some(limiter) = &rate_limiter {
                limiter.acquire(deadline).await?;
            }

            match &circuit_breaker {
                Some(breaker) => {
                    breaker
                        .execute(|| {
                            let op = op_cell.clone();
                            let retry = retry.clone();
                            async move {
                                retry
                                    .execute(|| {
                                        let op = op.clone();
                                        async move {
                                            let fut = {
                                                let mut op =
                                                    op.lock().expect("pipeline operation mutex poisoned");
                                                op()
                                            };
                                            fut.await
                                        }
                                    })
                                    .await
                            }
                        })
                        .await
                }
                None => {
                    retry
                        .execute(|| {
                            let op = op_cell.clone();
                            async move {
                                let fut = {
                                    let mut op = op.lock().expect("pipeline operation mutex poisoned");
                                    op()
                                };
                                fut.await
                            }
                        })
                        .await
                }
            }
        };

        // `BulkheadPolicy::execute` requires `FnMut`, but this pipeline only ever
        // calls its operation closure once per layer (retry is the only stage
        // that loops). A plain `move || past_bulkhead` would only satisfy
        // `FnOnce` since it moves a non-`Copy` future out of the closure; a
        // `take()`-based slot satisfies `FnMut` by construction instead.
        let mut bulkhead_slot = Some(past_bulkhead);
        let run_past_bulkhead = move || bulkhead_slot.take().expect("bulkhead stage invoked more than once");

        match self.timeout {
            Some(t) => {
                t.execute(|| async move {
                    match bulkhead {
                        Some(b) => b.execute(run_past_bulkhead).await,
                        None => run_past_bulkhead().await,
                    }
                })
                .await
            }
            None => match bulkhead {
                Some(b) => b.execute(run_past_bulkhead).await,
                None => run_past_bulkhead().await,
            },
        }
    }
}

pub struct ResiliencePipelineBuilder<E> {
    timeout: Option<TimeoutPolicy>,
    bulkhead: Option<BulkheadPolicy>,
    rate_limiter: Option<Arc<RateLimiterPolicy>>,
    circuit_breaker: Option<CircuitBreakerPolicy>,
    retry: Option<RetryPolicy<E>>,
}

impl<E> ResiliencePipelineBuilder<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self { timeout: None, bulkhead: None, rate_limiter: None, circuit_breaker: None, retry: None }
    }

    pub fn timeout(mut self, duration: Duration) -> Result<Self, crate::resilience::timeout::TimeoutError> {
        self.timeout = Some(TimeoutPolicy::new(duration)?);
        Ok(self)
    }

    pub fn no_timeout(mut self) -> Self {
        self.timeout = None;
        self
    }

    pub fn bulkhead(mut self, max_concurrent: usize) -> Self {
        self.bulkhead = Some(BulkheadPolicy::new(max_concurrent));
        self
    }

    pub fn unlimited_bulkhead(mut self) -> Self {
        self.bulkhead = Some(BulkheadPolicy::unlimited());
        self
    }

    pub fn rate_limiter(mut self, capacity: u32, refill_per_sec: u32) -> Self {
        self.rate_limiter = Some(Arc::new(RateLimiterPolicy::new(capacity, refill_per_sec)));
        self
    }

    pub fn no_rate_limiter(mut self) -> Self {
        self.rate_limiter = None;
        self
    }

    pub fn circuit_breaker(mut self, failures: usize, recovery_timeout: Duration) -> Self {
        self.circuit_breaker = Some(CircuitBreakerPolicy::new(failures, recovery_timeout));
        self
    }

    pub fn circuit_breaker_with_config(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = Some(CircuitBreakerPolicy::with_config(config));
        self
    }

    pub fn no_circuit_breaker(mut self) -> Self {
        self.circuit_breaker = None;
        self
    }

    pub fn retry(mut self, policy: RetryPolicy<E>) -> Self {
        self.retry = Some(policy);
        self
    }

    pub fn build(self) -> ResiliencePipeline<E> {
        ResiliencePipeline {
            timeout: self.timeout,
            bulkhead: self.bulkhead,
            rate_limiter: self.rate_limiter,
            circuit_breaker: self.circuit_breaker,
            retry: self.retry.unwrap_or_else(|| {
                RetryPolicy::builder().max_attempts(1).build().expect("max_attempts(1) is always valid")
            }),
        }
    }
}

impl<E> Default for ResiliencePipelineBuilder<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
