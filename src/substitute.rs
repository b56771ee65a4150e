//! Variable substitutor (C2, §4.2): renders `${…}` references against
//! four binding scopes and maps raw responses back through path
//! expressions (§4.1.5, [`crate::path`]).

use crate::path::{PathExpression, PathMatch};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;

/// The four scopes a template reference may draw from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Env,
    Input,
    Context,
    Config,
}

impl Scope {
    fn parse(prefix: &str) -> Option<Self> {
        match prefix {
            "env" => Some(Scope::Env),
            "input" => Some(Scope::Input),
            "context" => Some(Scope::Context),
            "config" => Some(Scope::Config),
            _ => None,
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Scope::Env => "env",
            Scope::Input => "input",
            Scope::Context => "context",
            Scope::Config => "config",
        };
        write!(f, "{s}")
    }
}

/// The union of binding scopes a template is rendered against.
#[derive(Debug, Clone, Default)]
pub struct Bindings {
    pub env: HashMap<String, String>,
    pub input: Value,
    pub context: Value,
    pub config: Value,
}

impl Bindings {
    pub fn new(env: HashMap<String, String>, input: Value, context: Value, config: Value) -> Self {
        Self { env, input, context, config }
    }

    fn resolve(&self, scope: Scope, path: &[String]) -> Option<Value> {
        match scope {
            Scope::Env => {
                let key = path.join(".");
                self.env.get(&key).map(|v| Value::String(v.clone()))
            }
            Scope::Input => resolve_path(&self.input, path),
            Scope::Context => resolve_path(&self.context, path),
            Scope::Config => resolve_path(&self.config, path),
        }
    }
}

fn resolve_path(root: &Value, path: &[String]) -> Option<Value> {
    let mut current = root;
    for key in path {
        current = current.get(key)?;
    }
    Some(current.clone())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateError {
    /// `${scope.path}` referenced a binding that does not exist and carried
    /// no default.
    MissingBinding(String),
    /// The reference's scope prefix was not one of `env`/`input`/`context`/`config`.
    UnknownScope(String),
    /// `${}` with no reference body.
    EmptyReference,
}

impl fmt::Display for TemplateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TemplateError::MissingBinding(r) => write!(f, "unresolved template binding: ${{{r}}}"),
            TemplateError::UnknownScope(r) => write!(f, "unknown binding scope in reference: ${{{r}}}"),
            TemplateError::EmptyReference => write!(f, "empty template reference: ${{}}"),
        }
    }
}

impl std::error::Error for TemplateError {}

struct Reference {
    scope: Scope,
    path: Vec<String>,
    default: Option<Value>,
    raw: String,
}

fn parse_reference(inner: &str) -> Result<Reference, TemplateError> {
    if inner.is_empty() {
        return Err(TemplateError::EmptyReference);
    }
    let (refpart, default) = match inner.split_once(':') {
        Some((r, d)) => (r, Some(parse_default_literal(d))),
        None => (inner, None),
    };
    let mut parts = refpart.splitn(2, '.');
    let scope_str = parts.next().unwrap_or("");
    let path_str = parts.next().unwrap_or("");
    let scope = Scope::parse(scope_str).ok_or_else(|| TemplateError::UnknownScope(inner.to_string()))?;
    let path: Vec<String> = path_str.split('.').filter(|s| !s.is_empty()).map(String::from).collect();
    Ok(Reference { scope, path, default, raw: inner.to_string() })
}

fn parse_default_literal(literal: &str) -> Value {
    serde_json::from_str(literal).unwrap_or_else(|_| Value::String(literal.to_string()))
}

fn resolve_reference(reference: &Reference, bindings: &Bindings) -> Result<Value, TemplateError> {
    match bindings.resolve(reference.scope, &reference.path) {
        Some(v) => Ok(v),
        None => match &reference.default {
            Some(d) => Ok(d.clone()),
            None => Err(TemplateError::MissingBinding(reference.raw.clone())),
        },
    }
}

fn value_to_interp_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Finds every `${…}` span in `s`, returning `(byte_range, inner_text)`.
fn find_refs(s: &str) -> Vec<(std::ops::Range<usize>, &str)> {
    let mut out = Vec::new();
    let bytes = s.as_bytes();
    let mut i = 0;
    while i + 1 < bytes.len() {
        if bytes[i] == b'$' && bytes[i + 1] == b'{' {
            if let Some(rel_close) = s[i + 2..].find('}') {
                let close = i + 2 + rel_close;
                out.push((i..close + 1, &s[i + 2..close]));
                i = close + 1;
                continue;
            }
        }
        i += 1;
    }
    out
}

/// Renders a single string leaf. A string that consists of exactly one
/// whole `${…}` reference preserves the resolved value's structural type;
/// any other string interpolates resolved values as text.
fn render_string(s: &str, bindings: &Bindings) -> Result<Value, TemplateError> {
    let refs = find_refs(s);
    if refs.is_empty() {
        return Ok(Value::String(s.to_string()));
    }
    if refs.len() == 1 && refs[0].0 == (0..s.len()) {
        let reference = parse_reference(refs[0].1)?;
        return resolve_reference(&reference, bindings);
    }

    let mut out = String::with_capacity(s.len());
    let mut cursor = 0;
    for (range, inner) in refs {
        out.push_str(&s[cursor..range.start]);
        let reference = parse_reference(inner)?;
        let value = resolve_reference(&reference, bindings)?;
        out.push_str(&value_to_interp_string(&value));
        cursor = range.end;
    }
    out.push_str(&s[cursor..]);
    Ok(Value::String(out))
}

/// Renders every `${…}` reference in a nested template structure against
/// the combined bindings. A single pass is performed: values substituted
/// in are never re-scanned for further references.
pub fn render(template: &Value, bindings: &Bindings) -> Result<Value, TemplateError> {
    match template {
        Value::String(s) => render_string(s, bindings),
        Value::Array(items) => {
            let rendered: Result<Vec<Value>, TemplateError> =
                items.iter().map(|v| render(v, bindings)).collect();
            Ok(Value::Array(rendered?))
        }
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), render(v, bindings)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

/// Applies a `{out_field: path_expression}` response mapping to a raw
/// response tree, producing the flat output map described in §4.2.
pub fn map_response(
    mapping: &HashMap<String, PathExpression>,
    response: &Value,
) -> HashMap<String, Value> {
    let mut out = HashMap::with_capacity(mapping.len());
    for (field, expr) in mapping {
        match expr.evaluate(response) {
            PathMatch::Empty => {}
            PathMatch::Scalar(v) => {
                out.insert(field.clone(), v);
            }
            PathMatch::Sequence(values) => {
                out.insert(field.clone(), Value::Array(values));
            }
        }
    }
    out
}

/// Extracts every `${…}` reference's raw body from a nested template,
/// for load-time validation of scope prefixes (§4.1.6).
pub fn extract_references(template: &Value, out: &mut Vec<String>) {
    match template {
        Value::String(s) => {
            for (_, inner) in find_refs(s) {
                out.push(inner.to_string());
            }
        }
        Value::Array(items) => {
            for v in items {
                extract_references(v, out);
            }
        }
        Value::Object(map) => {
            for v in map.values() {
                extract_references(v, out);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bindings() -> Bindings {
        let mut env = HashMap::new();
        env.insert("API_KEY".to_string(), "secret".to_string());
        Bindings::new(
            env,
            json!({"collection": "demo", "embeddings": [0.1, 0.2, 0.3]}),
            json!({"correlation_id": "req-001"}),
            json!({"base_url": "https://vectors.local"}),
        )
    }

    #[test]
    fn whole_string_reference_preserves_structural_type() {
        let rendered = render(&json!("${input.embeddings}"), &bindings()).unwrap();
        assert_eq!(rendered, json!([0.1, 0.2, 0.3]));
    }

    #[test]
    fn partial_string_interpolates_as_text() {
        let rendered = render(&json!("/collections/${input.collection}/points"), &bindings()).unwrap();
        assert_eq!(rendered, json!("/collections/demo/points"));
    }

    #[test]
    fn env_scope_resolves_from_env_map() {
        let rendered = render(&json!("Bearer ${env.API_KEY}"), &bindings()).unwrap();
        assert_eq!(rendered, json!("Bearer secret"));
    }

    #[test]
    fn missing_binding_without_default_errors() {
        let err = render(&json!("${input.missing}"), &bindings()).unwrap_err();
        assert_eq!(err, TemplateError::MissingBinding("input.missing".into()));
    }

    #[test]
    fn missing_binding_with_default_literal_uses_it() {
        let rendered = render(&json!("${input.missing:42}"), &bindings()).unwrap();
        assert_eq!(rendered, json!(42));
    }

    #[test]
    fn missing_binding_with_raw_string_default() {
        let rendered = render(&json!("${input.missing:fallback}"), &bindings()).unwrap();
        assert_eq!(rendered, json!("fallback"));
    }

    #[test]
    fn unknown_scope_is_rejected() {
        let err = render(&json!("${secret.value}"), &bindings()).unwrap_err();
        assert_eq!(err, TemplateError::UnknownScope("secret.value".into()));
    }

    #[test]
    fn nested_structures_render_recursively() {
        let template = json!({
            "method": "POST",
            "path": "/collections/${input.collection}/points",
            "body": {"vector": "${input.embeddings}"}
        });
        let rendered = render(&template, &bindings()).unwrap();
        assert_eq!(
            rendered,
            json!({
                "method": "POST",
                "path": "/collections/demo/points",
                "body": {"vector": [0.1, 0.2, 0.3]}
            })
        );
    }

    #[test]
    fn response_mapping_produces_flat_output() {
        let mut mapping = HashMap::new();
        mapping.insert("operation_id".to_string(), PathExpression::parse("$.result.operation_id").unwrap());
        mapping.insert("status".to_string(), PathExpression::parse("$.result.status").unwrap());
        let response = json!({"result": {"operation_id": 42, "status": "completed"}});
        let out = map_response(&mapping, &response);
        assert_eq!(out.get("operation_id"), Some(&json!(42)));
        assert_eq!(out.get("status"), Some(&json!("completed")));
    }

    #[test]
    fn extract_references_finds_every_reference() {
        let mut refs = Vec::new();
        extract_references(
            &json!({"path": "/a/${input.x}", "q": "${context.correlation_id}"}),
            &mut refs,
        );
        refs.sort();
        assert_eq!(refs, vec!["context.correlation_id".to_string(), "input.x".to_string()]);
    }
}
