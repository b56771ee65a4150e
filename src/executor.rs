//! Node executor (C5, §4.5): wraps one contract, owns its resilience
//! state, and drives one operation invocation through substitution,
//! the resilience pipeline, and response mapping.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::Value;

use crate::contract::{Contract, RateLimitPolicyConfig};
use crate::error::{ErrorCode, ErrorRecord};
use crate::handler::{HandlerOutcome, HandlerRequest, ProtocolHandler};
use crate::resilience::backoff::Backoff;
use crate::resilience::bulkhead::BulkheadPolicy;
use crate::resilience::circuit_breaker::CircuitBreakerConfig;
use crate::resilience::error::ResilienceError;
use crate::resilience::jitter::Jitter;
use crate::resilience::rate_limiter::RateLimiterPolicy;
use crate::resilience::retry::RetryPolicy;
use crate::resilience::{CircuitBreakerPolicy, CircuitState};
use crate::substitute::{self, Bindings};

/// Request to run one operation on one node (§4.5).
#[derive(Debug, Clone)]
pub struct EffectInput {
    pub operation: String,
    pub params: Value,
    pub correlation_id: String,
    pub context: Value,
}

/// Typed result of one operation invocation. Never an exception: every
/// outcome — success, permanent classification failure, or exhausted
/// resilience pipeline — is folded into this shape (§4.5 step 6, §7).
#[derive(Debug, Clone)]
pub struct EffectOutput {
    pub success: bool,
    pub operation: String,
    pub data: Option<Value>,
    pub error: Option<ErrorRecord>,
    pub correlation_id: String,
    pub duration_ms: f64,
    pub metadata: HashMap<String, String>,
}

/// A handler-reported failure still eligible for retry — the only error
/// shape that reaches the retry/circuit-breaker stages. Business-logic
/// rejections in an operation's `non_retryable_error_set` never take this
/// path (see [`Executor::execute`]): they're folded into the pipeline's
/// success channel as a classified failure, so they complete the retry
/// loop without being retried and without counting against the breaker.
#[derive(Debug, Clone)]
struct RetryableFailure {
    message: String,
}

impl fmt::Display for RetryableFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for RetryableFailure {}

/// A handler failure classified as permanent for this operation. Carried
/// inside the pipeline's `Ok` channel so it never triggers a retry or
/// counts against the circuit breaker (§4.4: "classification errors...
/// never open the breaker").
#[derive(Debug, Clone)]
struct ClassifiedFailure {
    message: String,
    status_code: Option<i64>,
}

type PipelineOutcome = Result<Value, ClassifiedFailure>;

#[derive(Debug, Default)]
struct MetricsInner {
    operations_executed: u64,
    operations_succeeded: u64,
    operations_failed: u64,
    cumulative_duration_ms: f64,
    retries_attempted: u64,
    circuit_breaker_opens: u64,
}

/// Per-node, per-operation counters (§4.5 step 5, §4.7).
#[derive(Debug, Default, Clone, Copy)]
pub struct MetricsSnapshot {
    pub operations_executed: u64,
    pub operations_succeeded: u64,
    pub operations_failed: u64,
    pub cumulative_duration_ms: f64,
    pub retries_attempted: u64,
    pub circuit_breaker_opens: u64,
}

#[derive(Default)]
struct ExecutorMetrics {
    total: Mutex<MetricsInner>,
    per_operation: Mutex<HashMap<String, MetricsInner>>,
}

impl ExecutorMetrics {
    fn record(&self, operation: &str, succeeded: bool, duration_ms: f64, retries: u64, breaker_opened: bool) {
        let mut total = self.total.lock().expect("executor metrics mutex poisoned");
        total.operations_executed += 1;
        if succeeded {
            total.operations_succeeded += 1;
        } else {
            total.operations_failed += 1;
        }
        total.cumulative_duration_ms += duration_ms;
        total.retries_attempted += retries;
        if breaker_opened {
            total.circuit_breaker_opens += 1;
        }
        drop(total);

        let mut per_op = self.per_operation.lock().expect("executor metrics mutex poisoned");
        let entry = per_op.entry(operation.to_string()).or_default();
        entry.operations_executed += 1;
        if succeeded {
            entry.operations_succeeded += 1;
        } else {
            entry.operations_failed += 1;
        }
        entry.cumulative_duration_ms += duration_ms;
        entry.retries_attempted += retries;
        if breaker_opened {
            entry.circuit_breaker_opens += 1;
        }
    }

    fn snapshot(&self) -> MetricsSnapshot {
        let total = self.total.lock().expect("executor metrics mutex poisoned");
        MetricsSnapshot {
            operations_executed: total.operations_executed,
            operations_succeeded: total.operations_succeeded,
            operations_failed: total.operations_failed,
            cumulative_duration_ms: total.cumulative_duration_ms,
            retries_attempted: total.retries_attempted,
            circuit_breaker_opens: total.circuit_breaker_opens,
        }
    }

    fn snapshot_operation(&self, operation: &str) -> MetricsSnapshot {
        let per_op = self.per_operation.lock().expect("executor metrics mutex poisoned");
        per_op
            .get(operation)
            .map(|m| MetricsSnapshot {
                operations_executed: m.operations_executed,
                operations_succeeded: m.operations_succeeded,
                operations_failed: m.operations_failed,
                cumulative_duration_ms: m.cumulative_duration_ms,
                retries_attempted: m.retries_attempted,
                circuit_breaker_opens: m.circuit_breaker_opens,
            })
            .unwrap_or_default()
    }
}

/// Wraps one [`Contract`], owning its resilience primitives and metrics
/// exclusively (§3 ownership rules). The [`ProtocolHandler`] it drives is
/// shared with every other executor bound to the same handler type+config.
pub struct Executor {
    contract: Arc<Contract>,
    handler: Arc<dyn ProtocolHandler>,
    env: HashMap<String, String>,
    circuit_breaker: CircuitBreakerPolicy,
    rate_limiter: Option<Arc<RateLimiterPolicy>>,
    bulkhead: BulkheadPolicy,
    metrics: ExecutorMetrics,
}

impl Executor {
    pub fn new(contract: Arc<Contract>, handler: Arc<dyn ProtocolHandler>, env: HashMap<String, String>) -> Self {
        let resilience = &contract.resilience;
        let circuit_breaker = CircuitBreakerPolicy::with_config(CircuitBreakerConfig {
            failure_threshold: resilience.circuit_breaker.failure_threshold,
            recovery_timeout: Duration::from_millis(resilience.circuit_breaker.open_timeout_ms),
            half_open_max_calls: resilience.circuit_breaker.half_open_max_probes,
            success_threshold: resilience.circuit_breaker.success_threshold,
        });
        let rate_limiter = match &resilience.rate_limit {
            RateLimitPolicyConfig::Disabled => None,
            RateLimitPolicyConfig::Enabled { requests_per_second, burst } => {
                Some(Arc::new(RateLimiterPolicy::new(*burst, requests_per_second.round().max(1.0) as u32)))
            }
        };
        let bulkhead = resilience.runtime_bulkhead();

        Self { contract, handler, env, circuit_breaker, rate_limiter, bulkhead, metrics: ExecutorMetrics::default() }
    }

    pub fn node_id(&self) -> &str {
        &self.contract.node_id
    }

    pub fn contract(&self) -> &Contract {
        &self.contract
    }

    pub fn handler(&self) -> &Arc<dyn ProtocolHandler> {
        &self.handler
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn metrics_for_operation(&self, operation: &str) -> MetricsSnapshot {
        self.metrics.snapshot_operation(operation)
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.circuit_breaker.state()
    }

    /// Runs one operation invocation end to end (§4.5 steps 1–6). Never
    /// raises: every outcome is folded into the returned [`EffectOutput`].
    pub async fn execute(&self, input: EffectInput) -> EffectOutput {
        let start = Instant::now();

        let operation = match self.contract.operations.get(&input.operation) {
            Some(op) => op,
            None => {
                return self.permanent_error(
                    &input,
                    start.elapsed(),
                    format!("unknown operation: {}", input.operation),
                    None,
                );
            }
        };

        if let Err(message) = validate_input(&operation.input_schema, &input.params) {
            return self.permanent_error(&input, start.elapsed(), message, None);
        }

        let bindings = Bindings::new(
            self.env.clone(),
            input.params.clone(),
            input.context.clone(),
            serde_json::to_value(&self.contract.connection).unwrap_or(Value::Null),
        );

        let request_params = match substitute::render(&operation.request_template.as_value(), &bindings) {
            Ok(v) => v,
            Err(e) => return self.permanent_error(&input, start.elapsed(), e.to_string(), None),
        };

        let per_request_ms = self.contract.resilience.timeout.per_request_ms;
        let per_operation_ms = self.contract.resilience.timeout.per_operation_ms;

        if per_request_ms == 0 {
            // §8 boundary: a zero-millisecond deadline is an immediate
            // timeout classification, never a live handler call.
            let elapsed = start.elapsed();
            self.metrics.record(&input.operation, false, ms(elapsed), 0, false);
            return EffectOutput {
                success: false,
                operation: input.operation.clone(),
                data: None,
                error: Some(
                    ErrorRecord::new(
                        ErrorCode::HandlerFailure,
                        "per-request deadline of 0ms elapsed immediately",
                        input.correlation_id.clone(),
                        self.contract.node_id.clone(),
                        true,
                    )
                    .with_context(serde_json::json!({"classification": "timeout"})),
                ),
                correlation_id: input.correlation_id,
                duration_ms: ms(elapsed),
                metadata: HashMap::new(),
            };
        }

        let retry_cfg = &self.contract.resilience.retry;
        let backoff = Backoff::exponential_with_multiplier(
            Duration::from_millis(retry_cfg.initial_delay_ms),
            retry_cfg.backoff_multiplier,
        )
        .with_max(Duration::from_millis(retry_cfg.max_delay_ms));
        let jitter = if retry_cfg.jitter { Jitter::full() } else { Jitter::None };

        let retry: RetryPolicy<RetryableFailure> = RetryPolicy::builder()
            .max_attempts(retry_cfg.max_attempts)
            .backoff(backoff)
            .with_jitter(jitter)
            .build()
            .unwrap_or_else(|_| RetryPolicy::builder().max_attempts(1).build().expect("max_attempts(1) is valid"));

        let handler = self.handler.clone();
        let op_name = operation.name.clone();
        let correlation_id = input.correlation_id.clone();
        let non_retryable = operation.non_retryable_error_set.clone();
        let response_mapping = operation.response_mapping.clone();
        let success_codes = operation.success_codes.clone();
        let input_payload = input.params.clone();

        let retries_before = AtomicU64::new(0);
        let attempt_counter = &retries_before;

        let run_once = || {
            let handler = handler.clone();
            let op_name = op_name.clone();
            let correlation_id = correlation_id.clone();
            let request_params = request_params.clone();
            let non_retryable = non_retryable.clone();
            let response_mapping = response_mapping.clone();
            let success_codes = success_codes.clone();
            let input_payload = input_payload.clone();
            attempt_counter.fetch_add(1, Ordering::Relaxed);
            async move {
                let call_start = Instant::now();
                let outcome = handler
                    .execute(HandlerRequest {
                        operation: op_name,
                        params: request_params,
                        correlation_id,
                        timeout_ms: per_request_ms,
                        success_codes,
                        input_payload,
                    })
                    .await;
                let duration_ms = ms(call_start.elapsed());

                match outcome {
                    HandlerOutcome::Timeout(_) => {
                        Err(ResilienceError::Inner(RetryableFailure { message: "handler timeout".into() }))
                    }
                    HandlerOutcome::Response(resp) if resp.success => {
                        let data = resp.data.unwrap_or(Value::Null);
                        let mapped = substitute::map_response(&response_mapping, &data);
                        let value: PipelineOutcome = Ok(serde_json::to_value(mapped).unwrap_or(Value::Null));
                        Ok(value)
                    }
                    HandlerOutcome::Response(resp) => {
                        let message = resp.error.unwrap_or_else(|| "handler reported failure".to_string());
                        if non_retryable.contains(&message)
                            || resp.status_code.map(|c| non_retryable.contains(&c.to_string())).unwrap_or(false)
                        {
                            let classified: PipelineOutcome =
                                Err(ClassifiedFailure { message, status_code: resp.status_code });
                            Ok(classified)
                        } else {
                            let _ = duration_ms;
                            Err(ResilienceError::Inner(RetryableFailure { message }))
                        }
                    }
                }
            }
        };

        let rate_limiter = self.rate_limiter.clone();
        let circuit_breaker = self.circuit_breaker.clone();
        let bulkhead = self.bulkhead.clone();
        let deadline = Duration::from_millis(per_operation_ms);

        let state_before = circuit_breaker.state();

        // Composition order (fixed): deadline -> bulkhead -> rate limiter ->
        // circuit breaker -> retry -> handler.
        let pipeline = async {
            bulkhead
                .execute(|| async {
                    if let Some(limiter) = &rate_limiter {
                        limiter.acquire::<RetryableFailure>(deadline).await?;
                    }
                    circuit_breaker.execute(|| retry.execute(&run_once)).await
                })
                .await
        };

        let result: Result<PipelineOutcome, ResilienceError<RetryableFailure>> =
            match tokio::time::timeout(deadline, pipeline).await {
                Ok(r) => r,
                Err(_) => Err(ResilienceError::Timeout { elapsed: deadline, timeout: deadline }),
            };

        let elapsed = start.elapsed();
        let attempts = attempt_counter.load(Ordering::Relaxed);
        let retries = attempts.saturating_sub(1);
        let state_after = circuit_breaker.state();
        let breaker_opened = !matches!(state_before, CircuitState::Open) && matches!(state_after, CircuitState::Open);

        match result {
            Ok(Ok(data)) => {
                self.metrics.record(&input.operation, true, ms(elapsed), retries, breaker_opened);
                EffectOutput {
                    success: true,
                    operation: input.operation.clone(),
                    data: Some(data),
                    error: None,
                    correlation_id: input.correlation_id,
                    duration_ms: ms(elapsed),
                    metadata: HashMap::new(),
                }
            }
            Ok(Err(classified)) => {
                self.metrics.record(&input.operation, false, ms(elapsed), retries, breaker_opened);
                EffectOutput {
                    success: false,
                    operation: input.operation.clone(),
                    data: None,
                    error: Some(
                        ErrorRecord::new(
                            ErrorCode::HandlerFailure,
                            classified.message,
                            input.correlation_id.clone(),
                            self.contract.node_id.clone(),
                            false,
                        )
                        .with_context(serde_json::json!({"status_code": classified.status_code})),
                    ),
                    correlation_id: input.correlation_id,
                    duration_ms: ms(elapsed),
                    metadata: HashMap::new(),
                }
            }
            Err(resilience_err) => {
                self.metrics.record(&input.operation, false, ms(elapsed), retries, breaker_opened);
                let (message, recoverable, context) = match &resilience_err {
                    ResilienceError::Timeout { .. } => (
                        "per-operation deadline exceeded".to_string(),
                        true,
                        serde_json::json!({"classification": "timeout"}),
                    ),
                    ResilienceError::CircuitOpen { failure_count, .. } => (
                        "circuit breaker is open".to_string(),
                        true,
                        serde_json::json!({"circuit_breaker_state": "open", "failure_count": failure_count}),
                    ),
                    ResilienceError::RateLimited { retry_after } => (
                        "rate limit deadline exceeded".to_string(),
                        true,
                        serde_json::json!({"retry_after_ms": retry_after.as_millis() as u64}),
                    ),
                    ResilienceError::RetryExhausted { attempts, failures } => (
                        failures.last().map(|f| f.to_string()).unwrap_or_else(|| "retries exhausted".to_string()),
                        false,
                        serde_json::json!({"attempts": attempts}),
                    ),
                    ResilienceError::Bulkhead { in_flight, max } => (
                        "bulkhead saturated".to_string(),
                        true,
                        serde_json::json!({"in_flight": in_flight, "max": max}),
                    ),
                    ResilienceError::Inner(e) => (e.to_string(), true, Value::Null),
                };
                EffectOutput {
                    success: false,
                    operation: input.operation.clone(),
                    data: None,
                    error: Some(
                        ErrorRecord::new(
                            ErrorCode::HandlerFailure,
                            message,
                            input.correlation_id.clone(),
                            self.contract.node_id.clone(),
                            recoverable,
                        )
                        .with_context(context),
                    ),
                    correlation_id: input.correlation_id,
                    duration_ms: ms(elapsed),
                    metadata: HashMap::new(),
                }
            }
        }
    }

    fn permanent_error(
        &self,
        input: &EffectInput,
        elapsed: Duration,
        message: String,
        context: Option<Value>,
    ) -> EffectOutput {
        self.metrics.record(&input.operation, false, ms(elapsed), 0, false);
        let mut record = ErrorRecord::new(
            ErrorCode::ContractMismatch,
            message,
            input.correlation_id.clone(),
            self.contract.node_id.clone(),
            false,
        );
        if let Some(c) = context {
            record = record.with_context(c);
        }
        EffectOutput {
            success: false,
            operation: input.operation.clone(),
            data: None,
            error: Some(record),
            correlation_id: input.correlation_id.clone(),
            duration_ms: ms(elapsed),
            metadata: HashMap::new(),
        }
    }
}

fn ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

/// Validates `params` against an operation's compiled `input_schema`
/// (§4.1, §4.5 step 2). `Contract::validate` already confirmed the schema
/// itself compiles; re-compiling it here per call avoids storing a
/// `jsonschema::JSONSchema` alongside the document it borrows from.
fn validate_input(schema: &Value, params: &Value) -> Result<(), String> {
    let compiled = jsonschema::JSONSchema::compile(schema).map_err(|e| format!("invalid input schema: {e}"))?;
    match compiled.validate(params) {
        Ok(()) => Ok(()),
        Err(errors) => Err(errors.map(|e| e.to_string()).collect::<Vec<_>>().join(", ")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::Contract;
    use crate::handler::memory::MockProtocolHandler;
    use crate::handler::{HandlerResponse, HandlerTimeout};

    const CONTRACT_YAML: &str = r#"
node_id: vector-upsert
version: {major: 1, minor: 0, patch: 0}
kind: effect
protocol_kind: rest
connection:
  url: "https://vectors.local"
operations:
  upsert:
    name: upsert
    description: "Upsert a vector"
    request_template:
      protocol: rest
      method: POST
      path: "/collections/${input.collection}/points"
    response_mapping_raw:
      operation_id: "$.result.operation_id"
      status: "$.result.status"
    success_codes: [200]
    non_retryable_error_set: ["bad request"]
resilience:
  retry: {max_attempts: 3, initial_delay_ms: 1, max_delay_ms: 5, backoff_multiplier: 2.0, jitter: false}
  circuit_breaker: {failure_threshold: 5, success_threshold: 1, open_timeout_ms: 60000, half_open_max_probes: 1}
  timeout: {per_request_ms: 2000, per_operation_ms: 5000}
subscribe_topic: onex.vectors.cmd.v1
success_topic: onex.vectors.evt.v1
failure_topic: onex.vectors.error.v1
dlq_topic: onex.vectors.log.v1
consumer_group: vector-upsert-group
"#;

    fn input() -> EffectInput {
        EffectInput {
            operation: "upsert".into(),
            params: serde_json::json!({"collection": "demo", "vector_id": "v1"}),
            correlation_id: "req-001".into(),
            context: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn s1_happy_path_maps_response() {
        let contract = Arc::new(Contract::load(CONTRACT_YAML).unwrap());
        let mock = Arc::new(MockProtocolHandler::new(crate::contract::ProtocolKind::Rest));
        mock.script(
            "upsert",
            vec![HandlerOutcome::Response(
                HandlerResponse::ok(serde_json::json!({"result": {"operation_id": 42, "status": "completed"}}), 1.0)
                    .with_status(200),
            )],
        );
        let executor = Executor::new(contract, mock, HashMap::new());
        let output = executor.execute(input()).await;
        assert!(output.success);
        assert_eq!(output.correlation_id, "req-001");
        let data = output.data.unwrap();
        assert_eq!(data.get("operation_id"), Some(&serde_json::json!(42)));
        assert_eq!(data.get("status"), Some(&serde_json::json!("completed")));
    }

    #[tokio::test]
    async fn s2_retries_then_succeeds() {
        let contract = Arc::new(Contract::load(CONTRACT_YAML).unwrap());
        let mock = Arc::new(MockProtocolHandler::new(crate::contract::ProtocolKind::Rest));
        mock.script(
            "upsert",
            vec![
                HandlerOutcome::Response(HandlerResponse::failure("connection reset", 1.0)),
                HandlerOutcome::Response(HandlerResponse::failure("connection reset", 1.0)),
                HandlerOutcome::Response(
                    HandlerResponse::ok(serde_json::json!({"result": {"operation_id": 1, "status": "ok"}}), 1.0)
                        .with_status(200),
                ),
            ],
        );
        let executor = Executor::new(contract, mock.clone(), HashMap::new());
        let output = executor.execute(input()).await;
        assert!(output.success);
        assert_eq!(mock.call_count(), 3);
        assert_eq!(executor.metrics().retries_attempted, 2);
    }

    #[tokio::test]
    async fn unknown_operation_is_permanent_classification_error() {
        let contract = Arc::new(Contract::load(CONTRACT_YAML).unwrap());
        let mock = Arc::new(MockProtocolHandler::new(crate::contract::ProtocolKind::Rest));
        let executor = Executor::new(contract, mock.clone(), HashMap::new());
        let mut bad = input();
        bad.operation = "delete".into();
        let output = executor.execute(bad).await;
        assert!(!output.success);
        assert_eq!(output.error.unwrap().code, ErrorCode::ContractMismatch);
        assert_eq!(mock.call_count(), 0);
    }

    #[tokio::test]
    async fn missing_required_field_is_permanent_error() {
        let contract = Arc::new(Contract::load(CONTRACT_YAML).unwrap());
        let mock = Arc::new(MockProtocolHandler::new(crate::contract::ProtocolKind::Rest));
        let executor = Executor::new(contract, mock.clone(), HashMap::new());
        let mut bad = input();
        bad.params = serde_json::json!({});
        let output = executor.execute(bad).await;
        assert!(!output.success);
        assert_eq!(output.error.unwrap().code, ErrorCode::ContractMismatch);
        assert_eq!(mock.call_count(), 0);
    }

    #[tokio::test]
    async fn non_retryable_handler_failure_does_not_retry_or_trip_breaker() {
        let contract = Arc::new(Contract::load(CONTRACT_YAML).unwrap());
        let mock = Arc::new(MockProtocolHandler::new(crate::contract::ProtocolKind::Rest));
        mock.script("upsert", vec![HandlerOutcome::Response(HandlerResponse::failure("bad request", 1.0))]);
        let executor = Executor::new(contract, mock.clone(), HashMap::new());
        let output = executor.execute(input()).await;
        assert!(!output.success);
        assert_eq!(mock.call_count(), 1);
        assert_eq!(executor.circuit_state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn zero_millisecond_deadline_is_immediate_timeout() {
        let mut contract = Contract::load(CONTRACT_YAML).unwrap();
        contract.resilience.timeout.per_request_ms = 0;
        let contract = Arc::new(contract);
        let mock = Arc::new(MockProtocolHandler::new(crate::contract::ProtocolKind::Rest));
        let executor = Executor::new(contract, mock.clone(), HashMap::new());
        let output = executor.execute(input()).await;
        assert!(!output.success);
        assert_eq!(mock.call_count(), 0);
        let err = output.error.unwrap();
        assert_eq!(err.context.unwrap()["classification"], "timeout");
    }

    #[tokio::test]
    async fn handler_timeout_outcome_is_retried() {
        let contract = Arc::new(Contract::load(CONTRACT_YAML).unwrap());
        let mock = Arc::new(MockProtocolHandler::new(crate::contract::ProtocolKind::Rest));
        mock.script(
            "upsert",
            vec![
                HandlerOutcome::Timeout(HandlerTimeout { elapsed: Duration::from_millis(50), limit: Duration::from_millis(20) }),
                HandlerOutcome::Response(
                    HandlerResponse::ok(serde_json::json!({"result": {"operation_id": 1, "status": "ok"}}), 1.0)
                        .with_status(200),
                ),
            ],
        );
        let executor = Executor::new(contract, mock.clone(), HashMap::new());
        let output = executor.execute(input()).await;
        assert!(output.success);
        assert_eq!(mock.call_count(), 2);
    }

    #[tokio::test]
    async fn success_codes_and_input_payload_reach_the_handler_request() {
        let contract = Arc::new(Contract::load(CONTRACT_YAML).unwrap());
        let mock = Arc::new(MockProtocolHandler::new(crate::contract::ProtocolKind::Rest));
        mock.script(
            "upsert",
            vec![HandlerOutcome::Response(
                HandlerResponse::ok(serde_json::json!({"result": {"operation_id": 1, "status": "ok"}}), 1.0).with_status(200),
            )],
        );
        let executor = Executor::new(contract, mock.clone(), HashMap::new());
        executor.execute(input()).await;
        let calls = mock.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].success_codes, vec![200]);
        assert_eq!(calls[0].input_payload, input().params);
    }

    const VALIDATED_CONTRACT_YAML: &str = r#"
node_id: vector-score
version: {major: 1, minor: 0, patch: 0}
kind: effect
protocol_kind: rest
connection:
  url: "https://vectors.local"
operations:
  score:
    name: score
    description: "Score a vector"
    input_validation:
      required: ["vector_id"]
      types:
        vector_id: string
        weight: number
    request_template:
      protocol: rest
      method: POST
      path: "/score"
    success_codes: [200]
subscribe_topic: onex.vectors.cmd.v1
success_topic: onex.vectors.evt.v1
failure_topic: onex.vectors.error.v1
dlq_topic: onex.vectors.log.v1
consumer_group: vector-score-group
"#;

    #[tokio::test]
    async fn jsonschema_input_validation_rejects_missing_required_field() {
        let contract = Arc::new(Contract::load(VALIDATED_CONTRACT_YAML).unwrap());
        let mock = Arc::new(MockProtocolHandler::new(crate::contract::ProtocolKind::Rest));
        let executor = Executor::new(contract, mock.clone(), HashMap::new());
        let output = executor
            .execute(EffectInput {
                operation: "score".into(),
                params: serde_json::json!({"weight": 0.5}),
                correlation_id: "req-002".into(),
                context: serde_json::json!({}),
            })
            .await;
        assert!(!output.success);
        assert_eq!(output.error.unwrap().code, ErrorCode::ContractMismatch);
        assert_eq!(mock.call_count(), 0);
    }

    #[tokio::test]
    async fn jsonschema_input_validation_rejects_wrong_type() {
        let contract = Arc::new(Contract::load(VALIDATED_CONTRACT_YAML).unwrap());
        let mock = Arc::new(MockProtocolHandler::new(crate::contract::ProtocolKind::Rest));
        let executor = Executor::new(contract, mock.clone(), HashMap::new());
        let output = executor
            .execute(EffectInput {
                operation: "score".into(),
                params: serde_json::json!({"vector_id": "v1", "weight": "heavy"}),
                correlation_id: "req-003".into(),
                context: serde_json::json!({}),
            })
            .await;
        assert!(!output.success);
        assert_eq!(output.error.unwrap().code, ErrorCode::ContractMismatch);
        assert_eq!(mock.call_count(), 0);
    }

    const HALF_OPEN_CONTRACT_YAML: &str = r#"
node_id: vector-upsert-half-open
version: {major: 1, minor: 0, patch: 0}
kind: effect
protocol_kind: rest
connection:
  url: "https://vectors.local"
operations:
  upsert:
    name: upsert
    request_template:
      protocol: rest
      method: POST
      path: "/collections/${input.collection}/points"
    success_codes: [200]
resilience:
  retry: {max_attempts: 1, initial_delay_ms: 1, max_delay_ms: 5, backoff_multiplier: 2.0, jitter: false}
  circuit_breaker: {failure_threshold: 1, success_threshold: 2, open_timeout_ms: 20, half_open_max_probes: 1}
  timeout: {per_request_ms: 2000, per_operation_ms: 5000}
subscribe_topic: onex.vectors-half-open.cmd.v1
success_topic: onex.vectors-half-open.evt.v1
failure_topic: onex.vectors-half-open.error.v1
dlq_topic: onex.vectors-half-open.log.v1
consumer_group: vector-upsert-half-open-group
"#;

    #[tokio::test]
    async fn circuit_breaker_requires_success_threshold_consecutive_successes_to_close() {
        let contract = Arc::new(Contract::load(HALF_OPEN_CONTRACT_YAML).unwrap());
        let mock = Arc::new(MockProtocolHandler::new(crate::contract::ProtocolKind::Rest));
        let executor = Executor::new(contract, mock.clone(), HashMap::new());

        mock.script("upsert", vec![HandlerOutcome::Response(HandlerResponse::failure("connection reset", 1.0))]);
        let first = executor.execute(input()).await;
        assert!(!first.success);
        assert_eq!(executor.circuit_state(), CircuitState::Open, "failure_threshold of 1 opens immediately");

        tokio::time::sleep(Duration::from_millis(40)).await;

        mock.script("upsert", vec![HandlerOutcome::Response(HandlerResponse::ok(serde_json::json!({}), 1.0).with_status(200))]);
        let probe_one = executor.execute(input()).await;
        assert!(probe_one.success);
        assert_eq!(
            executor.circuit_state(),
            CircuitState::HalfOpen,
            "one success short of success_threshold=2 must stay half-open"
        );

        mock.script("upsert", vec![HandlerOutcome::Response(HandlerResponse::ok(serde_json::json!({}), 1.0).with_status(200))]);
        let probe_two = executor.execute(input()).await;
        assert!(probe_two.success);
        assert_eq!(
            executor.circuit_state(),
            CircuitState::Closed,
            "second consecutive probe success must close the breaker"
        );
    }

    const NON_DEFAULT_MULTIPLIER_CONTRACT_YAML: &str = r#"
node_id: vector-upsert-backoff
version: {major: 1, minor: 0, patch: 0}
kind: effect
protocol_kind: rest
connection:
  url: "https://vectors.local"
operations:
  upsert:
    name: upsert
    request_template:
      protocol: rest
      method: POST
      path: "/collections/${input.collection}/points"
    success_codes: [200]
resilience:
  retry: {max_attempts: 3, initial_delay_ms: 5, max_delay_ms: 1000, backoff_multiplier: 3.0, jitter: false}
  circuit_breaker: {failure_threshold: 5, success_threshold: 1, open_timeout_ms: 60000, half_open_max_probes: 1}
  timeout: {per_request_ms: 2000, per_operation_ms: 5000}
subscribe_topic: onex.vectors-backoff.cmd.v1
success_topic: onex.vectors-backoff.evt.v1
failure_topic: onex.vectors-backoff.error.v1
dlq_topic: onex.vectors-backoff.log.v1
consumer_group: vector-upsert-backoff-group
"#;

    #[tokio::test]
    async fn retry_delay_schedule_honors_a_non_default_backoff_multiplier() {
        let contract = Arc::new(Contract::load(NON_DEFAULT_MULTIPLIER_CONTRACT_YAML).unwrap());
        let mock = Arc::new(MockProtocolHandler::new(crate::contract::ProtocolKind::Rest));
        mock.script(
            "upsert",
            vec![
                HandlerOutcome::Response(HandlerResponse::failure("connection reset", 1.0)),
                HandlerOutcome::Response(HandlerResponse::failure("connection reset", 1.0)),
                HandlerOutcome::Response(HandlerResponse::ok(serde_json::json!({}), 1.0).with_status(200)),
            ],
        );
        let executor = Executor::new(contract, mock.clone(), HashMap::new());

        // delay(1) = 5ms * 3.0^0 = 5ms, delay(2) = 5ms * 3.0^1 = 15ms: a
        // base-2 schedule would instead wait 5ms + 10ms = 15ms total, so this
        // bound only holds if `backoff_multiplier: 3.0` is actually applied.
        let start = Instant::now();
        let output = executor.execute(input()).await;
        let elapsed = start.elapsed();

        assert!(output.success);
        assert_eq!(mock.call_count(), 3);
        assert!(elapsed >= Duration::from_millis(20), "elapsed {elapsed:?} is shorter than the 3.0x-multiplier schedule");
    }

    #[tokio::test]
    async fn jsonschema_input_validation_accepts_valid_input() {
        let contract = Arc::new(Contract::load(VALIDATED_CONTRACT_YAML).unwrap());
        let mock = Arc::new(MockProtocolHandler::new(crate::contract::ProtocolKind::Rest));
        mock.script(
            "score",
            vec![HandlerOutcome::Response(HandlerResponse::ok(serde_json::json!({}), 1.0).with_status(200))],
        );
        let executor = Executor::new(contract, mock.clone(), HashMap::new());
        let output = executor
            .execute(EffectInput {
                operation: "score".into(),
                params: serde_json::json!({"vector_id": "v1", "weight": 0.5}),
                correlation_id: "req-004".into(),
                context: serde_json::json!({}),
            })
            .await;
        assert!(output.success);
        assert_eq!(mock.call_count(), 1);
    }
}
