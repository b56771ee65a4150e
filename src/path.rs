//! Response path expressions: `$.a.b[0][*] ?? default` (§4.1.5, §4.2).
//!
//! A path expression selects zero, one, or many values out of a raw
//! protocol response tree. `[*]` is the only fan-out operator; everything
//! else is a plain field or a fixed index.

use serde_json::Value;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Field(String),
    Index(usize),
    Wildcard,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PathExpression {
    segments: Vec<PathSegment>,
    default: Option<Value>,
    has_wildcard: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathParseError {
    MissingRoot(String),
    EmptySegment(String),
    UnclosedBracket(String),
    InvalidIndex(String),
}

impl fmt::Display for PathParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathParseError::MissingRoot(s) => write!(f, "path expression must start with '$.': {s}"),
            PathParseError::EmptySegment(s) => write!(f, "empty segment in path expression: {s}"),
            PathParseError::UnclosedBracket(s) => write!(f, "unclosed '[' in path expression: {s}"),
            PathParseError::InvalidIndex(s) => write!(f, "non-integer index in path expression: {s}"),
        }
    }
}

impl std::error::Error for PathParseError {}

/// Result of evaluating a [`PathExpression`] against a response tree.
#[derive(Debug, Clone, PartialEq)]
pub enum PathMatch {
    /// No matches, and no default was configured.
    Empty,
    /// Exactly one match, on a path with no `[*]` segment.
    Scalar(Value),
    /// Zero or more matches on a path containing `[*]`, always a sequence
    /// even when it holds a single element.
    Sequence(Vec<Value>),
}

impl PathExpression {
    /// Parses `"$." + segment(.segment)* [" ?? " + literal]`.
    pub fn parse(raw: &str) -> Result<Self, PathParseError> {
        let (expr, default_literal) = match raw.split_once(" ?? ") {
            Some((expr, lit)) => (expr, Some(lit)),
            None => (raw, None),
        };

        let rest = expr
            .strip_prefix("$.")
            .ok_or_else(|| PathParseError::MissingRoot(raw.to_string()))?;

        let mut segments = Vec::new();
        let mut has_wildcard = false;
        for part in rest.split('.') {
            parse_part(part, raw, &mut segments)?;
        }
        for seg in &segments {
            if matches!(seg, PathSegment::Wildcard) {
                has_wildcard = true;
            }
        }

        let default = default_literal.map(parse_default_literal);
        Ok(Self { segments, default, has_wildcard })
    }

    pub fn has_default(&self) -> bool {
        self.default.is_some()
    }

    pub fn has_wildcard(&self) -> bool {
        self.has_wildcard
    }

    /// Evaluates the expression against a response tree, applying the
    /// configured default (if any) when there are zero matches.
    pub fn evaluate(&self, root: &Value) -> PathMatch {
        let matches = walk(&self.segments, root);

        if self.has_wildcard {
            if matches.is_empty() {
                if let Some(default) = &self.default {
                    return PathMatch::Sequence(vec![default.clone()]);
                }
            }
            return PathMatch::Sequence(matches);
        }

        match matches.len() {
            0 => match &self.default {
                Some(default) => PathMatch::Scalar(default.clone()),
                None => PathMatch::Empty,
            },
            _ => PathMatch::Scalar(matches.into_iter().next().unwrap()),
        }
    }
}

fn parse_default_literal(literal: &str) -> Value {
    serde_json::from_str(literal).unwrap_or_else(|_| Value::String(literal.to_string()))
}

fn parse_part(part: &str, raw: &str, out: &mut Vec<PathSegment>) -> Result<(), PathParseError> {
    match part.find('[') {
        None => {
            if part.is_empty() {
                return Err(PathParseError::EmptySegment(raw.to_string()));
            }
            out.push(PathSegment::Field(part.to_string()));
        }
        Some(bracket_pos) => {
            let ident = &part[..bracket_pos];
            if !ident.is_empty() {
                out.push(PathSegment::Field(ident.to_string()));
            }
            let mut remaining = &part[bracket_pos..];
            while !remaining.is_empty() {
                if !remaining.starts_with('[') {
                    return Err(PathParseError::EmptySegment(raw.to_string()));
                }
                let close = remaining
                    .find(']')
                    .ok_or_else(|| PathParseError::UnclosedBracket(raw.to_string()))?;
                let inner = &remaining[1..close];
                if inner == "*" {
                    out.push(PathSegment::Wildcard);
                } else {
                    let idx: usize = inner
                        .parse()
                        .map_err(|_| PathParseError::InvalidIndex(raw.to_string()))?;
                    out.push(PathSegment::Index(idx));
                }
                remaining = &remaining[close + 1..];
            }
        }
    }
    Ok(())
}

fn walk(segments: &[PathSegment], root: &Value) -> Vec<Value> {
    let mut frontier = vec![root.clone()];
    for seg in segments {
        let mut next = Vec::new();
        for value in frontier {
            match seg {
                PathSegment::Field(name) => {
                    if let Some(v) = value.get(name) {
                        next.push(v.clone());
                    }
                }
                PathSegment::Index(idx) => {
                    if let Some(v) = value.get(*idx) {
                        next.push(v.clone());
                    }
                }
                PathSegment::Wildcard => {
                    if let Some(arr) = value.as_array() {
                        next.extend(arr.iter().cloned());
                    }
                }
            }
        }
        frontier = next;
    }
    frontier
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_plain_field_path() {
        let expr = PathExpression::parse("$.result.operation_id").unwrap();
        assert_eq!(
            expr,
            PathExpression {
                segments: vec![
                    PathSegment::Field("result".into()),
                    PathSegment::Field("operation_id".into())
                ],
                default: None,
                has_wildcard: false,
            }
        );
    }

    #[test]
    fn parses_index_and_wildcard() {
        let expr = PathExpression::parse("$.records[0].values[*]").unwrap();
        assert!(expr.has_wildcard());
        assert!(!expr.has_default());
    }

    #[test]
    fn parses_default_literal_json() {
        let expr = PathExpression::parse("$.status ?? 0").unwrap();
        assert_eq!(expr.default, Some(json!(0)));
    }

    #[test]
    fn parses_default_literal_raw_string() {
        let expr = PathExpression::parse("$.status ?? pending").unwrap();
        assert_eq!(expr.default, Some(json!("pending")));
    }

    #[test]
    fn rejects_missing_root() {
        assert!(PathExpression::parse("result.id").is_err());
    }

    #[test]
    fn scalar_match_unwraps_single_value() {
        let expr = PathExpression::parse("$.result.operation_id").unwrap();
        let response = json!({"result": {"operation_id": 42, "status": "completed"}});
        assert_eq!(expr.evaluate(&response), PathMatch::Scalar(json!(42)));
    }

    #[test]
    fn zero_matches_without_default_is_empty() {
        let expr = PathExpression::parse("$.missing.field").unwrap();
        assert_eq!(expr.evaluate(&json!({})), PathMatch::Empty);
    }

    #[test]
    fn zero_matches_with_default_uses_default() {
        let expr = PathExpression::parse("$.missing ?? 0").unwrap();
        assert_eq!(expr.evaluate(&json!({})), PathMatch::Scalar(json!(0)));
    }

    #[test]
    fn wildcard_collects_sequence() {
        let expr = PathExpression::parse("$.records[*].id").unwrap();
        let response = json!({"records": [{"id": 1}, {"id": 2}, {"id": 3}]});
        assert_eq!(expr.evaluate(&response), PathMatch::Sequence(vec![json!(1), json!(2), json!(3)]));
    }

    #[test]
    fn wildcard_with_zero_matches_and_default() {
        let expr = PathExpression::parse("$.records[*].id ?? []").unwrap();
        let response = json!({"records": []});
        assert_eq!(expr.evaluate(&response), PathMatch::Sequence(vec![json!([])]));
    }

    #[test]
    fn fixed_index_out_of_bounds_is_empty() {
        let expr = PathExpression::parse("$.items[5]").unwrap();
        let response = json!({"items": [1, 2]});
        assert_eq!(expr.evaluate(&response), PathMatch::Empty);
    }
}
