use criterion::{black_box, criterion_group, criterion_main, Criterion};
use nodeforge::resilience::{CircuitBreakerConfig, CircuitBreakerPolicy, ResilienceError};
use std::time::Duration;

#[derive(Debug)]
struct Boom;

impl std::fmt::Display for Boom {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "boom")
    }
}

impl std::error::Error for Boom {}

fn circuit_breaker_closed_success(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let breaker = CircuitBreakerPolicy::with_config(CircuitBreakerConfig {
        failure_threshold: 10,
        recovery_timeout: Duration::from_secs(30),
        half_open_max_calls: 1,
        success_threshold: 1,
    });

    c.bench_function("circuit_breaker_closed_success", |b| {
        b.to_async(&rt).iter(|| async {
            let result = breaker.execute(|| async { Ok::<_, ResilienceError<Boom>>(black_box("ok")) }).await;
            black_box(result).ok();
        });
    });
}

fn circuit_breaker_open_short_circuit(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let breaker = CircuitBreakerPolicy::with_config(CircuitBreakerConfig {
        failure_threshold: 1,
        recovery_timeout: Duration::from_secs(30),
        half_open_max_calls: 1,
        success_threshold: 1,
    });
    rt.block_on(async {
        let _ = breaker.execute(|| async { Err::<&str, _>(ResilienceError::Inner(Boom)) }).await;
    });

    c.bench_function("circuit_breaker_open_short_circuit", |b| {
        b.to_async(&rt).iter(|| async {
            let result = breaker.execute(|| async { Ok::<_, ResilienceError<Boom>>(black_box("ok")) }).await;
            black_box(result).ok();
        });
    });
}

criterion_group!(benches, circuit_breaker_closed_success, circuit_breaker_open_short_circuit);
criterion_main!(benches);
