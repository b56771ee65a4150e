//! Wire envelope (§3, §6) and correlation id sanitization.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Replacement written into any log field, message key, or persisted
/// identifier when a received correlation id fails sanitization.
pub const UNKNOWN_CORRELATION_ID: &str = "unknown";

const MAX_CORRELATION_LEN: usize = 128;
const TRUNCATE_LOG_LEN: usize = 50;

/// A sanitized correlation id: `[A-Za-z0-9_-]{1,128}`, or the literal
/// string `"unknown"` when the input did not conform.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Sanitizes an arbitrary input string per §3: values that don't match
    /// `[A-Za-z0-9_-]{1,128}`, or that contain a control character or
    /// escape sequence, become `"unknown"`. The original is truncated to
    /// 50 characters and logged once at warning — callers get that log
    /// line back so they can attach it to the surrounding request context
    /// instead of this type reaching into a global logger.
    pub fn sanitize(input: &str) -> (Self, Option<SanitizationWarning>) {
        if is_conforming(input) {
            return (Self(input.to_string()), None);
        }
        let truncated: String = input.chars().take(TRUNCATE_LOG_LEN).collect();
        (Self(UNKNOWN_CORRELATION_ID.to_string()), Some(SanitizationWarning { original_prefix: truncated }))
    }

    /// Wraps a value already known to conform (e.g. one freshly generated
    /// by this process). Falls back to `"unknown"` rather than panicking
    /// if it turns out not to.
    pub fn new_trusted(input: impl Into<String>) -> Self {
        let s = input.into();
        if is_conforming(&s) {
            Self(s)
        } else {
            Self(UNKNOWN_CORRELATION_ID.to_string())
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_unknown(&self) -> bool {
        self.0 == UNKNOWN_CORRELATION_ID
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Emitted once per sanitized-away correlation id; the caller logs it at
/// `warn` level next to the rest of the ingress context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SanitizationWarning {
    pub original_prefix: String,
}

fn is_conforming(s: &str) -> bool {
    if s.is_empty() || s.len() > MAX_CORRELATION_LEN {
        return false;
    }
    s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// The on-wire message envelope (§3, §6): carries one request or one
/// response, with routing metadata and an opaque `payload`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub event_id: String,
    #[serde(default = "default_event_type")]
    pub event_type: String,
    pub correlation_id: CorrelationId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
    pub source: EnvelopeSource,
    pub node_id: String,
    pub operation: String,
    pub payload: serde_json::Value,
}

fn default_event_type() -> String {
    "onex.event".to_string()
}

fn default_version() -> String {
    "1.0.0".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvelopeSource {
    pub service: String,
    pub instance_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
}

impl Envelope {
    /// Builds the response envelope for a request: correlation id carried
    /// over verbatim, `causation_id` set to the request's `event_id` (§3
    /// invariant), a fresh `event_id` for the response itself.
    pub fn respond(
        &self,
        event_id: impl Into<String>,
        node_id: impl Into<String>,
        operation: impl Into<String>,
        payload: serde_json::Value,
        source: EnvelopeSource,
        now: DateTime<Utc>,
    ) -> Envelope {
        Envelope {
            event_id: event_id.into(),
            event_type: default_event_type(),
            correlation_id: self.correlation_id.clone(),
            causation_id: Some(self.event_id.clone()),
            timestamp: now,
            version: default_version(),
            trace_id: self.trace_id.clone(),
            metadata: HashMap::new(),
            source,
            node_id: node_id.into(),
            operation: operation.into(),
            payload,
        }
    }
}

/// Runtime-visible description of a loaded node, produced from its
/// [`crate::contract::Contract`] (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeMeta {
    pub node_id: String,
    pub version: String,
    pub fingerprint: String,
    pub kind: String,
    pub handlers_required: Vec<String>,
    pub handlers_optional: Vec<String>,
    pub topics_subscribe: Vec<String>,
    pub topics_publish: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conforming_id_passes_through() {
        let (id, warning) = CorrelationId::sanitize("req-001");
        assert_eq!(id.as_str(), "req-001");
        assert!(warning.is_none());
    }

    #[test]
    fn control_characters_are_replaced() {
        let (id, warning) = CorrelationId::sanitize("valid-id\n[FAKE] ERR");
        assert_eq!(id.as_str(), "unknown");
        assert!(warning.is_some());
    }

    #[test]
    fn exactly_128_chars_is_accepted() {
        let input = "a".repeat(128);
        let (id, warning) = CorrelationId::sanitize(&input);
        assert_eq!(id.as_str(), input);
        assert!(warning.is_none());
    }

    #[test]
    fn exactly_129_chars_is_replaced() {
        let input = "a".repeat(129);
        let (id, warning) = CorrelationId::sanitize(&input);
        assert!(id.is_unknown());
        assert!(warning.is_some());
    }

    #[test]
    fn sanitize_is_idempotent() {
        for input in ["req-001", "valid-id\n[FAKE] ERR", "", &"x".repeat(200)] {
            let (once, _) = CorrelationId::sanitize(input);
            let (twice, _) = CorrelationId::sanitize(once.as_str());
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn sanitize_output_always_conforms_or_is_unknown() {
        for input in ["", "a/b", "ok_id-1", "\t\t", "emoji-\u{1F600}"] {
            let (id, _) = CorrelationId::sanitize(input);
            assert!(id.is_unknown() || is_conforming(id.as_str()));
        }
    }

    #[test]
    fn truncates_logged_prefix_to_50_chars() {
        let input = "x".repeat(500);
        let (_, warning) = CorrelationId::sanitize(&format!("{input}\n"));
        assert_eq!(warning.unwrap().original_prefix.chars().count(), 50);
    }
}
