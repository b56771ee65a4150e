//! Crate-wide error taxonomy (§7).
//!
//! Every error that can reach the failure topic or the DLQ carries one of
//! these codes. Codes are only ever attached here so the mapping table in
//! `DESIGN.md` stays exhaustive and auditable.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Structured error code surfaced on the failure topic or DLQ.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// The protocol handler could not complete an operation.
    HandlerFailure,
    /// Unknown topic→node mapping, unparseable envelope, or missing field.
    EnvelopeRoutingFailure,
    /// Input validation or response mapping failed against the observed shape.
    ContractMismatch,
    /// Target node is not enabled in the current runtime profile.
    ProfileViolation,
    /// A required handler was not available at dispatch time.
    DependencyMissing,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCode::HandlerFailure => "HANDLER_FAILURE",
            ErrorCode::EnvelopeRoutingFailure => "ENVELOPE_ROUTING_FAILURE",
            ErrorCode::ContractMismatch => "CONTRACT_MISMATCH",
            ErrorCode::ProfileViolation => "PROFILE_VIOLATION",
            ErrorCode::DependencyMissing => "DEPENDENCY_MISSING",
        };
        write!(f, "{s}")
    }
}

/// A structured error record: the shape published on the failure topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
    pub correlation_id: String,
    pub node_id: String,
    pub recoverable: bool,
}

impl ErrorRecord {
    pub fn new(
        code: ErrorCode,
        message: impl Into<String>,
        correlation_id: impl Into<String>,
        node_id: impl Into<String>,
        recoverable: bool,
    ) -> Self {
        Self {
            code,
            message: message.into(),
            context: None,
            correlation_id: correlation_id.into(),
            node_id: node_id.into(),
            recoverable,
        }
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = Some(context);
        self
    }
}

/// Top-level error type for contract loading, validation, and startup.
#[derive(Debug, thiserror::Error)]
pub enum NodeforgeError {
    #[error("contract schema error at {field_path}: {message}")]
    ContractSchema { field_path: String, message: String },

    #[error("fingerprint mismatch for node '{node_id}': declared {declared}, computed {computed}")]
    FingerprintMismatch {
        node_id: String,
        declared: String,
        computed: String,
    },

    #[error("unknown protocol handler kind: {0}")]
    UnknownProtocol(String),

    #[error("required handler missing for node '{node_id}': {handler_kind}")]
    RequiredHandlerMissing { node_id: String, handler_kind: String },

    #[error("dependency cycle detected: {0}")]
    DependencyCycle(String),

    #[error("duplicate node_id: {0}")]
    DuplicateNodeId(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("yaml parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("handler initialization failed: {0}")]
    HandlerInit(#[from] crate::handler::HandlerInitError),
}

impl From<crate::contract::ContractError> for NodeforgeError {
    fn from(err: crate::contract::ContractError) -> Self {
        use crate::contract::ContractError;
        match err {
            ContractError::Schema { field_path, message } => NodeforgeError::ContractSchema { field_path, message },
            ContractError::FingerprintMismatch { node_id, declared, computed } => {
                NodeforgeError::FingerprintMismatch { node_id, declared, computed }
            }
            ContractError::UnknownProtocol(kind) => NodeforgeError::UnknownProtocol(kind),
            ContractError::DuplicateOperation(name) => NodeforgeError::DuplicateNodeId(name),
            ContractError::InvalidTopic(topic) => {
                NodeforgeError::ContractSchema { field_path: "topic".to_string(), message: format!("invalid topic name: {topic}") }
            }
        }
    }
}

impl NodeforgeError {
    /// Exit code per §6's "Exit codes" table: 1 for validation/startup
    /// failures, 2 for I/O or file-access failures.
    pub fn exit_code(&self) -> i32 {
        match self {
            NodeforgeError::Io(_) => 2,
            _ => 1,
        }
    }
}
