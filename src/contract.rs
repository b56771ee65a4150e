//! Contract model, loader, and validator (C1, §3, §4.1).
//!
//! A [`Contract`] is the frozen, validated description of one node. It is
//! built once by [`Contract::load`] from a YAML document and never mutated
//! afterward — hot-reload is explicitly out of scope (§4.1).

use crate::path::PathExpression;
use crate::resilience::bulkhead::BulkheadPolicy as RuntimeBulkhead;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::fmt;

/// One of the four protocols a node's operations are executed against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProtocolKind {
    Rest,
    GraphCypher,
    Sql,
    BrokerProduce,
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProtocolKind::Rest => "rest",
            ProtocolKind::GraphCypher => "graph-cypher",
            ProtocolKind::Sql => "sql",
            ProtocolKind::BrokerProduce => "broker-produce",
        };
        write!(f, "{s}")
    }
}

/// A node's functional category (§3). Only `protocol_kind` determines which
/// [`crate::handler::ProtocolHandler`] services its operations; `kind` is
/// descriptive metadata carried through to [`crate::envelope::NodeMeta`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Compute,
    Effect,
    Reducer,
    Orchestrator,
}

/// Non-negative major/minor/patch, plus the bump rule from §3: a major bump
/// is required when a field outside the additive set changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl fmt::Display for ContractVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsConfig {
    #[serde(default)]
    pub ca_cert_path: Option<String>,
    #[serde(default)]
    pub client_cert_path: Option<String>,
    #[serde(default)]
    pub client_key_path: Option<String>,
    #[serde(default)]
    pub verify: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum AuthConfig {
    Bearer { token: String },
    Basic { username: String, password: String },
    ApiKey { header: String, value: String },
}

/// Protocol-specific connection description (§3). Unknown/extra fields are
/// retained in `extra` so each protocol handler crate can read its own
/// bespoke settings (e.g. the kafka handler's `bootstrap_servers`) without
/// the core needing to know about them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_pool_min")]
    pub pool_min: u32,
    #[serde(default = "default_pool_max")]
    pub pool_max: u32,
    #[serde(default)]
    pub tls: Option<TlsConfig>,
    #[serde(default)]
    pub auth: Option<AuthConfig>,
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

fn default_timeout_ms() -> u64 {
    5_000
}
fn default_pool_min() -> u32 {
    1
}
fn default_pool_max() -> u32 {
    10
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrimitiveType {
    String,
    Number,
    Boolean,
    Array,
    Object,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InputValidation {
    #[serde(default)]
    pub required: Vec<String>,
    #[serde(default)]
    pub types: HashMap<String, PrimitiveType>,
}

/// Compiles an [`InputValidation`] block into a JSON Schema document: a
/// `required` array plus a `properties` map from each typed field's
/// [`PrimitiveType`] to its schema `"type"` keyword. Extra, undeclared
/// fields are left unconstrained (§4.1).
pub fn build_input_schema(validation: &InputValidation) -> Value {
    let mut properties = serde_json::Map::new();
    for (field, ty) in &validation.types {
        properties.insert(field.clone(), serde_json::json!({"type": primitive_type_name(*ty)}));
    }
    serde_json::json!({
        "type": "object",
        "required": validation.required,
        "properties": properties,
    })
}

fn primitive_type_name(ty: PrimitiveType) -> &'static str {
    match ty {
        PrimitiveType::String => "string",
        PrimitiveType::Number => "number",
        PrimitiveType::Boolean => "boolean",
        PrimitiveType::Array => "array",
        PrimitiveType::Object => "object",
    }
}

/// One operation's protocol-specific request shape (§4.1 step 6, §4.3).
/// A tagged variant rather than a permissive document, so the substitutor
/// and each protocol handler share one statically-known shape per kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "kebab-case")]
pub enum RequestTemplate {
    Rest {
        method: String,
        path: String,
        #[serde(default)]
        query: HashMap<String, String>,
        #[serde(default)]
        headers: HashMap<String, String>,
        #[serde(default)]
        body: Option<Value>,
    },
    Cypher {
        query: String,
        #[serde(default)]
        param_mapping: HashMap<String, String>,
    },
    Sql {
        statement: String,
        #[serde(default)]
        param_mapping: Vec<String>,
    },
    Broker {
        topic: String,
        #[serde(default)]
        key: Option<String>,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
}

impl RequestTemplate {
    /// Every nested string leaf, scanned for `${…}` references.
    pub fn as_value(&self) -> Value {
        match self {
            RequestTemplate::Rest { method, path, query, headers, body } => serde_json::json!({
                "method": method, "path": path, "query": query, "headers": headers, "body": body,
            }),
            RequestTemplate::Cypher { query, param_mapping } => {
                serde_json::json!({"query": query, "param_mapping": param_mapping})
            }
            RequestTemplate::Sql { statement, param_mapping } => {
                serde_json::json!({"statement": statement, "param_mapping": param_mapping})
            }
            RequestTemplate::Broker { topic, key, headers } => {
                serde_json::json!({"topic": topic, "key": key, "headers": headers})
            }
        }
    }
}

/// One named request/response shape within a node (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub input_validation: InputValidation,
    /// `input_validation` compiled into a JSON Schema document by
    /// [`Contract::validate`]; [`crate::executor`] compiles this into a
    /// `jsonschema` validator per call rather than caching the compiled
    /// form, since a `jsonschema::JSONSchema` borrows the document it was
    /// compiled from and so can't be stored alongside it in a `Clone`
    /// struct without self-referencing.
    #[serde(skip)]
    pub input_schema: Value,
    pub request_template: RequestTemplate,
    #[serde(default)]
    pub response_mapping_raw: HashMap<String, String>,
    #[serde(skip)]
    pub response_mapping: HashMap<String, PathExpression>,
    #[serde(default)]
    pub success_codes: Vec<u16>,
    #[serde(default)]
    pub retryable_error_set: HashSet<String>,
    #[serde(default)]
    pub non_retryable_error_set: HashSet<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicyConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default)]
    pub jitter: bool,
}

fn default_max_attempts() -> usize {
    3
}
fn default_initial_delay_ms() -> u64 {
    100
}
fn default_max_delay_ms() -> u64 {
    10_000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicyConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerPolicyConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: usize,
    #[serde(default = "default_success_threshold")]
    pub success_threshold: usize,
    #[serde(default = "default_open_timeout_ms")]
    pub open_timeout_ms: u64,
    #[serde(default = "default_half_open_max_probes")]
    pub half_open_max_probes: usize,
}

fn default_failure_threshold() -> usize {
    5
}
fn default_success_threshold() -> usize {
    2
}
fn default_open_timeout_ms() -> u64 {
    30_000
}
fn default_half_open_max_probes() -> usize {
    1
}

impl Default for CircuitBreakerPolicyConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            open_timeout_ms: default_open_timeout_ms(),
            half_open_max_probes: default_half_open_max_probes(),
        }
    }
}

/// §3: "disabled is a distinct state, not zero."
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitPolicyConfig {
    Disabled,
    Enabled { requests_per_second: f64, burst: u32 },
}

impl Default for RateLimitPolicyConfig {
    fn default() -> Self {
        RateLimitPolicyConfig::Disabled
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutPolicyConfig {
    pub per_request_ms: u64,
    pub per_operation_ms: u64,
}

impl Default for TimeoutPolicyConfig {
    fn default() -> Self {
        Self { per_request_ms: 5_000, per_operation_ms: 30_000 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkheadPolicyConfig {
    pub max_concurrent: usize,
}

/// On-missing behavior for an optional handler dependency (§4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnMissingHandler {
    SkipSilently,
    WarnAndSkip,
    Degrade,
    Error,
}

impl Default for OnMissingHandler {
    fn default() -> Self {
        OnMissingHandler::WarnAndSkip
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResiliencePolicyConfig {
    #[serde(default)]
    pub retry: RetryPolicyConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerPolicyConfig,
    #[serde(default)]
    pub rate_limit: RateLimitPolicyConfig,
    #[serde(default)]
    pub timeout: TimeoutPolicyConfig,
    #[serde(default)]
    pub bulkhead: Option<BulkheadPolicyConfig>,
}

impl ResiliencePolicyConfig {
    /// Builds the runtime bulkhead primitive (or an unlimited one when
    /// unset) for the executor to install in its resilience pipeline.
    pub fn runtime_bulkhead(&self) -> RuntimeBulkhead {
        match &self.bulkhead {
            Some(cfg) => RuntimeBulkhead::new(cfg.max_concurrent),
            None => RuntimeBulkhead::unlimited(),
        }
    }
}

/// The frozen, validated description of one node (§3). Built once by
/// [`Contract::load`]; never mutated afterward.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contract {
    pub node_id: String,
    pub version: ContractVersion,
    pub fingerprint: String,
    pub kind: NodeKind,
    pub protocol_kind: ProtocolKind,
    pub connection: ConnectionConfig,
    pub operations: IndexMap<String, Operation>,
    #[serde(default)]
    pub resilience: ResiliencePolicyConfig,
    pub subscribe_topic: String,
    pub success_topic: String,
    pub failure_topic: String,
    pub dlq_topic: String,
    pub consumer_group: String,
    #[serde(default)]
    pub handlers_optional: Vec<String>,
    #[serde(default)]
    pub on_missing_handler: OnMissingHandler,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContractError {
    #[error("contract schema error at {field_path}: {message}")]
    Schema { field_path: String, message: String },
    #[error("fingerprint mismatch for node '{node_id}': declared {declared}, computed {computed}")]
    FingerprintMismatch { node_id: String, declared: String, computed: String },
    #[error("unknown protocol handler kind: {0}")]
    UnknownProtocol(String),
    #[error("duplicate operation name: {0}")]
    DuplicateOperation(String),
    #[error("invalid topic name '{0}': must match ^onex\\.[a-z]+\\.(cmd|evt|state|log|error)\\.v\\d+$")]
    InvalidTopic(String),
}

const REQUIRED_TOP_LEVEL: &[&str] = &[
    "node_id",
    "version",
    "kind",
    "protocol_kind",
    "connection",
    "operations",
    "subscribe_topic",
    "success_topic",
    "failure_topic",
    "dlq_topic",
    "consumer_group",
];

fn topic_matches(topic: &str) -> bool {
    let Some(rest) = topic.strip_prefix("onex.") else { return false };
    let mut parts = rest.splitn(3, '.');
    let domain = match parts.next() {
        Some(d) if !d.is_empty() && d.chars().all(|c| c.is_ascii_lowercase()) => d,
        _ => return false,
    };
    let _ = domain;
    let signal = match parts.next() {
        Some(s) => s,
        None => return false,
    };
    if !matches!(signal, "cmd" | "evt" | "state" | "log" | "error") {
        return false;
    }
    match parts.next() {
        Some(v) => {
            v.strip_prefix('v').is_some_and(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()))
        }
        None => false,
    }
}

/// Step 1 of §4.1: presence and primitive type of the required top-level
/// fields, before any strongly-typed parse is attempted. Returns the
/// `ContractSchemaError`-equivalent with a field path on the first miss.
fn check_required_fields(raw: &Value) -> Result<(), ContractError> {
    let obj = raw.as_object().ok_or_else(|| ContractError::Schema {
        field_path: "$".to_string(),
        message: "contract document must be a mapping".to_string(),
    })?;
    for key in REQUIRED_TOP_LEVEL {
        if !obj.contains_key(*key) {
            return Err(ContractError::Schema {
                field_path: key.to_string(),
                message: "required field missing".to_string(),
            });
        }
    }
    let version = obj.get("version").unwrap();
    for field in ["major", "minor", "patch"] {
        match version.get(field) {
            Some(v) if v.is_u64() => {}
            Some(_) => {
                return Err(ContractError::Schema {
                    field_path: format!("version.{field}"),
                    message: "must be a non-negative integer".to_string(),
                })
            }
            None => {
                return Err(ContractError::Schema {
                    field_path: format!("version.{field}"),
                    message: "required field missing".to_string(),
                })
            }
        }
    }
    match obj.get("operations").and_then(|v| v.as_object()) {
        Some(ops) if !ops.is_empty() => {}
        _ => {
            return Err(ContractError::Schema {
                field_path: "operations".to_string(),
                message: "must be a non-empty mapping".to_string(),
            })
        }
    }
    Ok(())
}

/// Canonicalizes a document for fingerprinting: `fingerprint` removed,
/// object keys sorted lexicographically at every level (the default
/// `serde_json::Map` backing — `BTreeMap`, since this crate does not
/// enable `preserve_order` — already guarantees this), sequences kept in
/// declaration order.
fn canonicalize_for_fingerprint(raw: &Value) -> Value {
    fn strip(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut out = serde_json::Map::new();
                for (k, v) in map {
                    if k == "fingerprint" {
                        continue;
                    }
                    out.insert(k.clone(), strip(v));
                }
                Value::Object(out)
            }
            Value::Array(items) => Value::Array(items.iter().map(strip).collect()),
            other => other.clone(),
        }
    }
    strip(raw)
}

fn compute_fingerprint(version: &ContractVersion, raw_without_fingerprint: &Value) -> String {
    let bytes = serde_json::to_vec(raw_without_fingerprint)
        .expect("a canonicalized contract value always serializes");
    let digest = Sha256::digest(&bytes);
    format!("{version}:sha256:{digest:x}")
}

impl Contract {
    /// `load` + `validate` (§4.1). `source` is a YAML document.
    pub fn load(source: &str) -> Result<Contract, ContractError> {
        let raw: Value = serde_yaml::from_str(source)
            .map(|y: serde_yaml::Value| yaml_to_json(y))
            .map_err(|e| ContractError::Schema { field_path: "$".to_string(), message: e.to_string() })?;
        Self::validate(raw)
    }

    /// Validates a parsed document tree into a frozen `Contract` (§4.1
    /// steps 1–6).
    pub fn validate(raw: Value) -> Result<Contract, ContractError> {
        check_required_fields(&raw)?;

        let protocol_kind_str = raw.get("protocol_kind").and_then(Value::as_str).ok_or_else(|| {
            ContractError::Schema { field_path: "protocol_kind".to_string(), message: "must be a string".into() }
        })?;
        if !matches!(protocol_kind_str, "rest" | "graph-cypher" | "sql" | "broker-produce") {
            return Err(ContractError::UnknownProtocol(protocol_kind_str.to_string()));
        }

        for (field, topic) in [
            ("subscribe_topic", raw.get("subscribe_topic")),
            ("success_topic", raw.get("success_topic")),
            ("failure_topic", raw.get("failure_topic")),
            ("dlq_topic", raw.get("dlq_topic")),
        ] {
            let topic = topic.and_then(Value::as_str).ok_or_else(|| ContractError::Schema {
                field_path: field.to_string(),
                message: "must be a string".to_string(),
            })?;
            if !topic_matches(topic) {
                return Err(ContractError::InvalidTopic(topic.to_string()));
            }
        }

        let mut contract: Contract = serde_json::from_value(raw.clone())
            .map_err(|e| ContractError::Schema { field_path: "$".to_string(), message: e.to_string() })?;

        let mut seen = HashSet::new();
        for name in contract.operations.keys() {
            if !seen.insert(name.clone()) {
                return Err(ContractError::DuplicateOperation(name.clone()));
            }
        }

        for op in contract.operations.values_mut() {
            for (field, raw_expr) in &op.response_mapping_raw {
                let expr = PathExpression::parse(raw_expr).map_err(|e| ContractError::Schema {
                    field_path: format!("operations.{}.response_mapping.{field}", op.name),
                    message: e.to_string(),
                })?;
                op.response_mapping.insert(field.clone(), expr);
            }

            op.input_schema = build_input_schema(&op.input_validation);
            jsonschema::JSONSchema::compile(&op.input_schema).map_err(|e| ContractError::Schema {
                field_path: format!("operations.{}.input_validation", op.name),
                message: e.to_string(),
            })?;

            let mut refs = Vec::new();
            crate::substitute::extract_references(&op.request_template.as_value(), &mut refs);
            for r in refs {
                let scope = r.split('.').next().unwrap_or("");
                if !matches!(scope, "env" | "input" | "context" | "config") {
                    return Err(ContractError::Schema {
                        field_path: format!("operations.{}.request_template", op.name),
                        message: format!("unresolvable template reference scope: ${{{r}}}"),
                    });
                }
            }
        }

        let canonical = canonicalize_for_fingerprint(&raw);
        let computed = compute_fingerprint(&contract.version, &canonical);
        if !contract.fingerprint.is_empty() {
            if contract.fingerprint != computed {
                return Err(ContractError::FingerprintMismatch {
                    node_id: contract.node_id.clone(),
                    declared: contract.fingerprint.clone(),
                    computed,
                });
            }
        } else {
            contract.fingerprint = computed;
        }

        Ok(contract)
    }

    pub fn node_meta(&self) -> crate::envelope::NodeMeta {
        crate::envelope::NodeMeta {
            node_id: self.node_id.clone(),
            version: self.version.to_string(),
            fingerprint: self.fingerprint.clone(),
            kind: format!("{:?}", self.kind).to_lowercase(),
            handlers_required: vec![self.protocol_kind.to_string()],
            handlers_optional: self.handlers_optional.clone(),
            topics_subscribe: vec![self.subscribe_topic.clone()],
            topics_publish: vec![
                self.success_topic.clone(),
                self.failure_topic.clone(),
                self.dlq_topic.clone(),
            ],
        }
    }
}

fn yaml_to_json(value: serde_yaml::Value) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID_CONTRACT: &str = r#"
node_id: vector-upsert
version: {major: 1, minor: 0, patch: 0}
kind: effect
protocol_kind: rest
connection:
  url: "https://vectors.local"
  timeout_ms: 3000
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
    success_codes: [200, 201]
subscribe_topic: onex.vectors.cmd.v1
success_topic: onex.vectors.evt.v1
failure_topic: onex.vectors.error.v1
dlq_topic: onex.vectors.log.v1
consumer_group: vector-upsert-group
"#;

    #[test]
    fn loads_a_valid_contract() {
        let contract = Contract::load(VALID_CONTRACT).unwrap();
        assert_eq!(contract.node_id, "vector-upsert");
        assert_eq!(contract.operations.len(), 1);
        assert!(contract.operations.contains_key("upsert"));
    }

    #[test]
    fn fingerprint_round_trips() {
        let contract = Contract::load(VALID_CONTRACT).unwrap();
        let reparsed = format!(
            "{}\nfingerprint: \"{}\"\n",
            VALID_CONTRACT.trim_end(),
            contract.fingerprint
        );
        let contract2 = Contract::load(&reparsed).unwrap();
        assert_eq!(contract.fingerprint, contract2.fingerprint);
    }

    #[test]
    fn fingerprint_mismatch_is_rejected() {
        let reparsed =
            format!("{}\nfingerprint: \"1.0.0:sha256:deadbeef\"\n", VALID_CONTRACT.trim_end());
        let err = Contract::load(&reparsed).unwrap_err();
        assert!(matches!(err, ContractError::FingerprintMismatch { .. }));
    }

    #[test]
    fn missing_required_field_is_schema_error() {
        let broken = VALID_CONTRACT.replace("node_id: vector-upsert\n", "");
        let err = Contract::load(&broken).unwrap_err();
        assert!(matches!(err, ContractError::Schema { .. }));
    }

    #[test]
    fn unknown_protocol_kind_is_rejected() {
        let broken = VALID_CONTRACT.replace("protocol_kind: rest", "protocol_kind: carrier-pigeon");
        let err = Contract::load(&broken).unwrap_err();
        assert!(matches!(err, ContractError::UnknownProtocol(_)));
    }

    #[test]
    fn invalid_topic_name_is_rejected() {
        let broken = VALID_CONTRACT.replace("onex.vectors.cmd.v1", "vectors-cmd");
        let err = Contract::load(&broken).unwrap_err();
        assert!(matches!(err, ContractError::InvalidTopic(_)));
    }

    #[test]
    fn unresolvable_template_scope_is_rejected() {
        let broken = VALID_CONTRACT.replace("${input.collection}", "${secret.collection}");
        let err = Contract::load(&broken).unwrap_err();
        assert!(matches!(err, ContractError::Schema { .. }));
    }

    #[test]
    fn topic_regex_accepts_and_rejects() {
        assert!(topic_matches("onex.vectors.cmd.v1"));
        assert!(topic_matches("onex.graph.error.v12"));
        assert!(!topic_matches("onex.vectors.cmd"));
        assert!(!topic_matches("vectors.cmd.v1"));
        assert!(!topic_matches("onex.Vectors.cmd.v1"));
        assert!(!topic_matches("onex.vectors.bogus.v1"));
    }
}
