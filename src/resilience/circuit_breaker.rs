//! Circuit breaker stage: a lock-free Closed/Open/HalfOpen state machine.

use crate::resilience::clock::{Clock, MonotonicClock};
use crate::resilience::error::ResilienceError;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: usize,
    pub recovery_timeout: Duration,
    pub half_open_max_calls: usize,
    pub success_threshold: usize,
}

impl CircuitBreakerConfig {
    /// A breaker that never trips. `failure_threshold` of `usize::MAX`
    /// guarantees `on_failure` never reaches the open transition.
    pub fn disabled() -> Self {
        Self {
            failure_threshold: usize::MAX,
            recovery_timeout: Duration::from_secs(0),
            half_open_max_calls: usize::MAX,
            success_threshold: 1,
        }
    }
}

struct CircuitBreakerState {
    state: AtomicU8,
    failure_count: AtomicUsize,
    success_count: AtomicUsize,
    opened_at_millis: AtomicU64,
    half_open_calls: AtomicUsize,
}

/// Per-operation circuit breaker. Cloning shares the underlying state, so
/// one `CircuitBreakerPolicy` can be held by every caller of an operation.
#[derive(Clone)]
pub struct CircuitBreakerPolicy {
    state: Arc<CircuitBreakerState>,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
}

impl CircuitBreakerPolicy {
    pub fn new(failure_threshold: usize, recovery_timeout: Duration) -> Self {
        Self::with_config(CircuitBreakerConfig {
            failure_threshold,
            recovery_timeout,
            half_open_max_calls: 1,
            success_threshold: 1,
        })
    }

    pub fn with_config(config: CircuitBreakerConfig) -> Self {
        Self {
            state: Arc::new(CircuitBreakerState {
                state: AtomicU8::new(STATE_CLOSED),
                failure_count: AtomicUsize::new(0),
                success_count: AtomicUsize::new(0),
                opened_at_millis: AtomicU64::new(0),
                half_open_calls: AtomicUsize::new(0),
            }),
            config,
            clock: Arc::new(MonotonicClock::default()),
        }
    }

    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn with_half_open_limit(mut self, limit: usize) -> Self {
        self.config.half_open_max_calls = limit;
        self
    }

    pub fn with_success_threshold(mut self, threshold: usize) -> Self {
        self.config.success_threshold = threshold;
        self
    }

    pub fn state(&self) -> CircuitState {
        match self.state.state.load(Ordering::Acquire) {
            STATE_CLOSED => CircuitState::Closed,
            STATE_OPEN => CircuitState::Open,
            STATE_HALF_OPEN => CircuitState::HalfOpen,
            _ => unreachable!("invalid circuit breaker state"),
        }
    }

    pub async fn execute<T, E, Fut, Op>(&self, mut operation: Op) -> Result<T, ResilienceError<E>>
    where
        T: Send,
        E: std::error::Error + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ResilienceError<E>>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        loop {
            let current_state = self.state.state.load(Ordering::Acquire);

            match current_state {
                STATE_OPEN => {
                    let opened_at = self.state.opened_at_millis.load(Ordering::Acquire);
                    let now = self.now_millis();
                    let elapsed = now.saturating_sub(opened_at);

                    if elapsed >= self.config.recovery_timeout.as_millis() as u64 {
                        match self.state.state.compare_exchange(
                            STATE_OPEN,
                            STATE_HALF_OPEN,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        ) {
                            Ok(_) => {
                                tracing::info!("circuit breaker -> half-open");
                                self.state.half_open_calls.store(1, Ordering::Release);
                                self.state.success_count.store(0, Ordering::Release);
                                break;
                            }
                            Err(STATE_HALF_OPEN) => continue,
                            Err(STATE_CLOSED) => break,
                            Err(_) => unreachable!("invalid state transition"),
                        }
                    } else {
                        return Err(ResilienceError::CircuitOpen {
                            failure_count: self.state.failure_count.load(Ordering::Acquire),
                            open_duration: Duration::from_millis(elapsed),
                        });
                    }
                }
                STATE_HALF_OPEN => {
                    let current = self.state.half_open_calls.fetch_add(1, Ordering::AcqRel);
                    if current >= self.config.half_open_max_calls {
                        self.state.half_open_calls.fetch_sub(1, Ordering::Release);
                        return Err(ResilienceError::CircuitOpen {
                            failure_count: self.state.failure_count.load(Ordering::Acquire),
                            open_duration: Duration::from_millis(0),
                        });
                    }
                    tracing::debug!(
                        in_flight = current + 1,
                        max = self.config.half_open_max_calls,
                        "circuit breaker: half-open probe"
                    );
                    break;
                }
                STATE_CLOSED => break,
                _ => unreachable!("invalid circuit breaker state"),
            }
        }

        let was_half_open = self.state.state.load(Ordering::Acquire) == STATE_HALF_OPEN;
        let result = operation().await;

        if was_half_open {
            self.state.half_open_calls.fetch_sub(1, Ordering::Release);
        }

        match &result {
            Ok(_) => self.on_success(),
            Err(_) => self.on_failure(),
        }

        result
    }

    fn on_success(&self) {
        match self.state.state.load(Ordering::Acquire) {
            STATE_HALF_OPEN => {
                let successes = self.state.success_count.fetch_add(1, Ordering::AcqRel) + 1;
                if successes >= self.config.success_threshold
                    && self
                        .state
                        .state
                        .compare_exchange(STATE_HALF_OPEN, STATE_CLOSED, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                {
                    self.state.failure_count.store(0, Ordering::Release);
                    self.state.success_count.store(0, Ordering::Release);
                    self.state.opened_at_millis.store(0, Ordering::Release);
                    tracing::info!("circuit breaker -> closed");
                } else {
                    tracing::debug!(
                        successes,
                        threshold = self.config.success_threshold,
                        "circuit breaker: half-open probe succeeded"
                    );
                }
            }
            STATE_CLOSED => {
                self.state.failure_count.store(0, Ordering::Release);
            }
            _ => {}
        }
    }

    fn on_failure(&self) {
        let current = self.state.state.load(Ordering::Acquire);
        let failures = self.state.failure_count.fetch_add(1, Ordering::AcqRel) + 1;

        match current {
            STATE_HALF_OPEN => {
                if self
                    .state
                    .state
                    .compare_exchange(STATE_HALF_OPEN, STATE_OPEN, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    self.state.success_count.store(0, Ordering::Release);
                    self.state.opened_at_millis.store(self.now_millis(), Ordering::Release);
                    tracing::warn!(failures, "circuit breaker: probe failed -> open");
                }
            }
            STATE_CLOSED => {
                if failures >= self.config.failure_threshold
                    && self
                        .state
                        .state
                        .compare_exchange(STATE_CLOSED, STATE_OPEN, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                {
                    self.state.opened_at_millis.store(self.now_millis(), Ordering::Release);
                    tracing::error!(
                        failures,
                        threshold = self.config.failure_threshold,
                        "circuit breaker -> open"
                    );
                }
            }
            _ => {}
        }
    }

    fn now_millis(&self) -> u64 {
        self.clock.now_millis()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct TestError(String);

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "TestError: {}", self.0)
        }
    }

    impl std::error::Error for TestError {}

    #[derive(Debug, Clone)]
    struct ManualClock {
        now: Arc<AtomicU64>,
    }

    impl ManualClock {
        fn new() -> Self {
            Self { now: Arc::new(AtomicU64::new(0)) }
        }

        fn advance(&self, millis: u64) {
            self.now.fetch_add(millis, Ordering::SeqCst);
        }
    }

    impl Clock for ManualClock {
        fn now_millis(&self) -> u64 {
            self.now.load(Ordering::SeqCst)
        }
    }

    #[tokio::test]
    async fn starts_closed() {
        let breaker = CircuitBreakerPolicy::new(3, Duration::from_secs(1));
        assert_eq!(breaker.state(), CircuitState::Closed);
        let result = breaker.execute(|| async { Ok::<_, ResilienceError<TestError>>(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn opens_after_threshold_failures() {
        let breaker = CircuitBreakerPolicy::new(3, Duration::from_secs(10));
        for _ in 0..3 {
            let _ = breaker
                .execute(|| async { Err::<(), _>(ResilienceError::Inner(TestError("fail".into()))) })
                .await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        let result = breaker.execute(|| async { Ok::<_, ResilienceError<TestError>>(42) }).await;
        assert!(result.unwrap_err().is_circuit_open());
    }

    #[tokio::test]
    async fn half_open_after_recovery_timeout() {
        let breaker = CircuitBreakerPolicy::new(2, Duration::from_millis(100));
        for _ in 0..2 {
            let _ = breaker
                .execute(|| async { Err::<(), _>(ResilienceError::Inner(TestError("fail".into()))) })
                .await;
        }

        tokio::time::sleep(Duration::from_millis(150)).await;

        let result = breaker.execute(|| async { Ok::<_, ResilienceError<TestError>>(100) }).await;
        assert_eq!(result.unwrap(), 100);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn reopens_if_half_open_probe_fails() {
        let breaker = CircuitBreakerPolicy::new(2, Duration::from_millis(100));
        for _ in 0..2 {
            let _ = breaker
                .execute(|| async { Err::<(), _>(ResilienceError::Inner(TestError("fail".into()))) })
                .await;
        }

        tokio::time::sleep(Duration::from_millis(150)).await;
        let _ = breaker
            .execute(|| async { Err::<(), _>(ResilienceError::Inner(TestError("fail again".into()))) })
            .await;

        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn half_open_limits_concurrent_probes() {
        let breaker = CircuitBreakerPolicy::new(2, Duration::from_millis(100)).with_half_open_limit(1);
        for _ in 0..2 {
            let _ = breaker
                .execute(|| async { Err::<(), _>(ResilienceError::Inner(TestError("fail".into()))) })
                .await;
        }
        tokio::time::sleep(Duration::from_millis(150)).await;

        let mut handles = vec![];
        for _ in 0..3 {
            let breaker_clone = breaker.clone();
            handles.push(tokio::spawn(async move {
                breaker_clone
                    .execute(|| async {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok::<_, ResilienceError<TestError>>(42)
                    })
                    .await
            }));
        }
        let results: Vec<_> = futures::future::join_all(handles).await;
        let successes = results.iter().filter(|r| r.as_ref().unwrap().is_ok()).count();
        let rejections = results
            .iter()
            .filter(|r| r.as_ref().unwrap().as_ref().err().map_or(false, |e| e.is_circuit_open()))
            .count();
        assert_eq!(successes, 1);
        assert_eq!(rejections, 2);
    }

    #[tokio::test]
    async fn disabled_breaker_never_opens() {
        let breaker = CircuitBreakerPolicy::with_config(CircuitBreakerConfig::disabled());
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..1000 {
            let counter_clone = counter.clone();
            let _ = breaker
                .execute(|| {
                    let counter = counter_clone.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Err::<(), _>(ResilienceError::Inner(TestError("fail".into())))
                    }
                })
                .await;
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1000);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn success_in_closed_state_resets_failure_count() {
        let breaker = CircuitBreakerPolicy::new(3, Duration::from_secs(1));
        for _ in 0..2 {
            let _ = breaker
                .execute(|| async { Err::<(), _>(ResilienceError::Inner(TestError("fail".into()))) })
                .await;
        }
        let _ = breaker.execute(|| async { Ok::<_, ResilienceError<TestError>>(42) }).await;
        for _ in 0..2 {
            let result = breaker
                .execute(|| async { Err::<(), _>(ResilienceError::Inner(TestError("fail".into()))) })
                .await;
            assert!(matches!(result, Err(ResilienceError::Inner(_))));
        }
    }

    #[tokio::test]
    async fn half_open_requires_success_threshold_consecutive_successes() {
        let breaker =
            CircuitBreakerPolicy::new(2, Duration::from_millis(100)).with_success_threshold(2);
        for _ in 0..2 {
            let _ = breaker
                .execute(|| async { Err::<(), _>(ResilienceError::Inner(TestError("fail".into()))) })
                .await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(150)).await;

        let first = breaker.execute(|| async { Ok::<_, ResilienceError<TestError>>(1) }).await;
        assert_eq!(first.unwrap(), 1);
        assert_eq!(breaker.state(), CircuitState::HalfOpen, "one success short of threshold stays half-open");

        let second = breaker.execute(|| async { Ok::<_, ResilienceError<TestError>>(2) }).await;
        assert_eq!(second.unwrap(), 2);
        assert_eq!(breaker.state(), CircuitState::Closed, "second consecutive success closes the breaker");
    }

    #[tokio::test]
    async fn custom_clock_allows_deterministic_recovery() {
        let clock = ManualClock::new();
        let breaker = CircuitBreakerPolicy::new(1, Duration::from_millis(100)).with_clock(clock.clone());

        let _ = breaker
            .execute(|| async { Err::<(), _>(ResilienceError::Inner(TestError("fail".into()))) })
            .await;
        let open = breaker.execute(|| async { Ok::<_, ResilienceError<TestError>>(()) }).await;
        assert!(open.unwrap_err().is_circuit_open());

        clock.advance(150);

        let success = breaker.execute(|| async { Ok::<_, ResilienceError<TestError>>(42) }).await;
        assert_eq!(success.unwrap(), 42);
    }
}
