//! Protocol handler contract (C3, §4.3): the shared interface every
//! concrete handler crate (`nodeforge-rest`, `nodeforge-graph`,
//! `nodeforge-sql`, `nodeforge-broker-kafka`) implements, plus the
//! in-memory mock used by the `local-dev` profile and `simulate-workflow`.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use crate::contract::ConnectionConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerInitError {
    ConnectionFailed(String),
    InvalidConfig(String),
    TlsSetupFailed(String),
}

impl fmt::Display for HandlerInitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerInitError::ConnectionFailed(m) => write!(f, "handler connection failed: {m}"),
            HandlerInitError::InvalidConfig(m) => write!(f, "invalid handler config: {m}"),
            HandlerInitError::TlsSetupFailed(m) => write!(f, "tls setup failed: {m}"),
        }
    }
}

impl std::error::Error for HandlerInitError {}

/// One protocol-level call: the combined bindings map plus routing/timeout
/// metadata (§4.3).
#[derive(Debug, Clone)]
pub struct HandlerRequest {
    pub operation: String,
    pub params: Value,
    pub correlation_id: String,
    pub timeout_ms: u64,
    /// Response status codes the operation's contract treats as success.
    /// Empty means the handler falls back to its protocol's own default
    /// (2xx for REST); non-REST handlers ignore this field (§3, §4.3).
    pub success_codes: Vec<u16>,
    /// The operation's untemplated input payload, distinct from `params`
    /// (the rendered request template). Only `broker-produce` uses this —
    /// its outgoing message body is the input payload itself, not a
    /// template field (§4.3).
    pub input_payload: Value,
}

/// Outcome of one attempt. The handler itself never retries (§4.3); it
/// reports what happened to this one call.
#[derive(Debug, Clone)]
pub struct HandlerResponse {
    pub success: bool,
    pub status_code: Option<i64>,
    pub data: Option<Value>,
    pub error: Option<String>,
    pub duration_ms: f64,
    pub metadata: HashMap<String, String>,
}

impl HandlerResponse {
    pub fn ok(data: Value, duration_ms: f64) -> Self {
        Self { success: true, status_code: None, data: Some(data), error: None, duration_ms, metadata: HashMap::new() }
    }

    pub fn failure(error: impl Into<String>, duration_ms: f64) -> Self {
        Self { success: false, status_code: None, data: None, error: Some(error.into()), duration_ms, metadata: HashMap::new() }
    }

    pub fn with_status(mut self, status_code: i64) -> Self {
        self.status_code = Some(status_code);
        self
    }
}

/// Distinct from a generic [`HandlerResponse::failure`]: the handler-level
/// timeout classification the resilience pipeline and executor treat
/// specially (§4.3, §7).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerTimeout {
    pub elapsed: Duration,
    pub limit: Duration,
}

impl fmt::Display for HandlerTimeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handler call timed out after {:?} (limit {:?})", self.elapsed, self.limit)
    }
}

impl std::error::Error for HandlerTimeout {}

/// One attempt's outcome, distinguishing a reported failure from a
/// handler-level timeout so callers don't have to string-match `error`.
#[derive(Debug, Clone)]
pub enum HandlerOutcome {
    Response(HandlerResponse),
    Timeout(HandlerTimeout),
}

/// Connection-pooled client for one protocol kind (§3, §4.3). Shared
/// across every [`crate::executor::Executor`] that declares the same
/// handler-type + config (§3 ownership rules).
#[async_trait]
pub trait ProtocolHandler: Send + Sync {
    /// Establishes the connection pool. MUST be idempotent across a
    /// `shutdown -> init` boundary.
    async fn init(&self, config: &ConnectionConfig) -> Result<(), HandlerInitError>;

    /// Executes one attempt of one operation. MUST NOT retry internally.
    async fn execute(&self, request: HandlerRequest) -> HandlerOutcome;

    /// A lightweight health probe. MUST complete within 2s or return
    /// `false` — callers are expected to race this against their own
    /// 2s timeout rather than trust the implementation to self-bound.
    async fn health(&self) -> bool;

    /// Closes the pool, flushing any producer buffers within a bounded
    /// grace period (default 10s, §4.3).
    async fn shutdown(&self);

    /// The protocol kind this handler services, for registry binding.
    fn protocol_kind(&self) -> crate::contract::ProtocolKind;
}

pub mod memory {
    //! In-memory mock handler (§9 supplement): used by the `local-dev`
    //! runtime profile and the `simulate-workflow` CLI command so both can
    //! exercise the full dispatch/resilience path with no network
    //! dependency.

    use super::*;
    use std::sync::Mutex;
    use tokio::time::Instant;

    /// A scripted response, keyed by operation name, served in FIFO order
    /// per operation; the last entry for an operation repeats once
    /// exhausted.
    pub struct MockProtocolHandler {
        protocol_kind: crate::contract::ProtocolKind,
        scripts: Mutex<HashMap<String, Vec<HandlerOutcome>>>,
        calls: Mutex<Vec<HandlerRequest>>,
    }

    impl MockProtocolHandler {
        pub fn new(protocol_kind: crate::contract::ProtocolKind) -> Self {
            Self { protocol_kind, scripts: Mutex::new(HashMap::new()), calls: Mutex::new(Vec::new()) }
        }

        pub fn script(&self, operation: impl Into<String>, outcomes: Vec<HandlerOutcome>) {
            self.scripts.lock().expect("mock handler poisoned").insert(operation.into(), outcomes);
        }

        pub fn calls(&self) -> Vec<HandlerRequest> {
            self.calls.lock().expect("mock handler poisoned").clone()
        }

        pub fn call_count(&self) -> usize {
            self.calls.lock().expect("mock handler poisoned").len()
        }
    }

    #[async_trait]
    impl ProtocolHandler for MockProtocolHandler {
        async fn init(&self, _config: &ConnectionConfig) -> Result<(), HandlerInitError> {
            Ok(())
        }

        async fn execute(&self, request: HandlerRequest) -> HandlerOutcome {
            let start = Instant::now();
            self.calls.lock().expect("mock handler poisoned").push(request.clone());
            let mut scripts = self.scripts.lock().expect("mock handler poisoned");
            let outcome = match scripts.get_mut(&request.operation) {
                Some(queue) if queue.len() > 1 => queue.remove(0),
                Some(queue) => queue[0].clone(),
                None => HandlerOutcome::Response(HandlerResponse::ok(
                    serde_json::json!({}),
                    start.elapsed().as_secs_f64() * 1000.0,
                )),
            };
            outcome
        }

        async fn health(&self) -> bool {
            true
        }

        async fn shutdown(&self) {}

        fn protocol_kind(&self) -> crate::contract::ProtocolKind {
            self.protocol_kind
        }
    }

    impl Clone for HandlerOutcome {
        fn clone(&self) -> Self {
            match self {
                HandlerOutcome::Response(r) => HandlerOutcome::Response(r.clone()),
                HandlerOutcome::Timeout(t) => HandlerOutcome::Timeout(t.clone()),
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[tokio::test]
        async fn replays_scripted_responses_then_repeats_last() {
            let handler = MockProtocolHandler::new(crate::contract::ProtocolKind::Rest);
            handler.script(
                "upsert",
                vec![
                    HandlerOutcome::Response(HandlerResponse::failure("boom", 1.0)),
                    HandlerOutcome::Response(HandlerResponse::ok(serde_json::json!({"ok": true}), 1.0)),
                ],
            );

            let req = HandlerRequest {
                operation: "upsert".into(),
                params: serde_json::json!({}),
                correlation_id: "c1".into(),
                timeout_ms: 1000,
                success_codes: vec![],
                input_payload: serde_json::json!({}),
            };

            let first = handler.execute(req.clone()).await;
            assert!(matches!(first, HandlerOutcome::Response(r) if !r.success));
            let second = handler.execute(req.clone()).await;
            assert!(matches!(second, HandlerOutcome::Response(r) if r.success));
            let third = handler.execute(req).await;
            assert!(matches!(third, HandlerOutcome::Response(r) if r.success));
            assert_eq!(handler.call_count(), 3);
        }
    }
}
