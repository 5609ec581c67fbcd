//! Tree-walking helpers shared by the record parsers and emitters.
//!
//! Parsers walk a generic [`serde_yaml::Value`] and accumulate issues per
//! field instead of failing on the first problem, so one malformed user does
//! not hide the rest of the document. Emitters build mappings in a fixed key
//! order; serializing the result yields canonical YAML (two-space indent,
//! LF endings, trailing newline) that parses back byte-identically.

use crate::error::Issue;
use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;

pub fn as_mapping<'v>(value: &'v Value, path: &str, issues: &mut Vec<Issue>) -> Option<&'v Mapping> {
    match value {
        Value::Mapping(m) => Some(m),
        Value::Null => None,
        other => {
            issues.push(Issue::new(
                path,
                "expected_mapping",
                format!("expected a mapping, found {}", type_name(other)),
            ));
            None
        }
    }
}

pub fn get<'m>(map: &'m Mapping, key: &str) -> Option<&'m Value> {
    map.get(key)
}

pub fn req_str(map: &Mapping, key: &str, path: &str, issues: &mut Vec<Issue>) -> Option<String> {
    match get(map, key) {
        Some(Value::String(s)) => Some(s.clone()),
        Some(other) => {
            issues.push(Issue::new(
                format!("{path}.{key}"),
                "expected_string",
                format!("expected a string, found {}", type_name(other)),
            ));
            None
        }
        None => {
            issues.push(Issue::new(
                format!("{path}.{key}"),
                "required",
                "missing required field",
            ));
            None
        }
    }
}

pub fn opt_str(map: &Mapping, key: &str, path: &str, issues: &mut Vec<Issue>) -> Option<String> {
    match get(map, key) {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Null) | None => None,
        Some(other) => {
            issues.push(Issue::new(
                format!("{path}.{key}"),
                "expected_string",
                format!("expected a string, found {}", type_name(other)),
            ));
            None
        }
    }
}

pub fn str_or(map: &Mapping, key: &str, default: &str, path: &str, issues: &mut Vec<Issue>) -> String {
    opt_str(map, key, path, issues).unwrap_or_else(|| default.to_string())
}

pub fn bool_or(map: &Mapping, key: &str, default: bool, path: &str, issues: &mut Vec<Issue>) -> bool {
    match get(map, key) {
        Some(Value::Bool(b)) => *b,
        Some(Value::Null) | None => default,
        Some(other) => {
            issues.push(Issue::new(
                format!("{path}.{key}"),
                "expected_bool",
                format!("expected true/false, found {}", type_name(other)),
            ));
            default
        }
    }
}

pub fn opt_u16(map: &Mapping, key: &str, path: &str, issues: &mut Vec<Issue>) -> Option<u16> {
    match get(map, key) {
        Some(Value::Number(n)) => match n.as_u64() {
            Some(v) if v <= u64::from(u16::MAX) => Some(v as u16),
            _ => {
                issues.push(Issue::new(
                    format!("{path}.{key}"),
                    "port_ranges",
                    format!("{n} is not a valid port number"),
                ));
                None
            }
        },
        Some(Value::Null) | None => None,
        Some(other) => {
            issues.push(Issue::new(
                format!("{path}.{key}"),
                "expected_integer",
                format!("expected an integer, found {}", type_name(other)),
            ));
            None
        }
    }
}

pub fn string_list(map: &Mapping, key: &str, path: &str, issues: &mut Vec<Issue>) -> Vec<String> {
    match get(map, key) {
        Some(Value::Sequence(seq)) => {
            let mut out = Vec::with_capacity(seq.len());
            for (i, item) in seq.iter().enumerate() {
                match item {
                    Value::String(s) => out.push(s.clone()),
                    other => issues.push(Issue::new(
                        format!("{path}.{key}[{i}]"),
                        "expected_string",
                        format!("expected a string, found {}", type_name(other)),
                    )),
                }
            }
            out
        }
        Some(Value::Null) | None => Vec::new(),
        Some(other) => {
            issues.push(Issue::new(
                format!("{path}.{key}"),
                "expected_sequence",
                format!("expected a sequence, found {}", type_name(other)),
            ));
            Vec::new()
        }
    }
}

pub fn string_map(
    map: &Mapping,
    key: &str,
    path: &str,
    issues: &mut Vec<Issue>,
) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    match get(map, key) {
        Some(Value::Mapping(m)) => {
            for (k, v) in m {
                let (Value::String(k), Value::String(v)) = (k, v) else {
                    issues.push(Issue::new(
                        format!("{path}.{key}"),
                        "expected_string_map",
                        "keys and values must be strings",
                    ));
                    continue;
                };
                out.insert(k.clone(), v.clone());
            }
        }
        Some(Value::Null) | None => {}
        Some(other) => {
            issues.push(Issue::new(
                format!("{path}.{key}"),
                "expected_mapping",
                format!("expected a mapping, found {}", type_name(other)),
            ));
        }
    }
    out
}

/// Reject keys outside the allowed set. Strictly-validated documents call
/// this; opaque sections skip it and round-trip unknown keys verbatim.
pub fn reject_unknown(map: &Mapping, allowed: &[&str], path: &str, issues: &mut Vec<Issue>) {
    for key in map.keys() {
        if let Value::String(k) = key {
            if !allowed.contains(&k.as_str()) {
                issues.push(Issue::new(
                    format!("{path}.{k}"),
                    "unknown_field",
                    "unknown field",
                ));
            }
        }
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Sequence(_) => "a sequence",
        Value::Mapping(_) => "a mapping",
        Value::Tagged(_) => "a tagged value",
    }
}

/// Ordered mapping builder for emitters.
#[derive(Default)]
pub struct MapBuilder {
    map: Mapping,
}

impl MapBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn entry(mut self, key: &str, value: Value) -> Self {
        self.map.insert(Value::String(key.to_string()), value);
        self
    }

    /// Insert only when the sequence is non-empty, keeping emitted documents
    /// free of noise defaults.
    #[must_use]
    pub fn entry_if(self, key: &str, value: Value, keep: bool) -> Self {
        if keep {
            self.entry(key, value)
        } else {
            self
        }
    }

    #[must_use]
    pub fn build(self) -> Value {
        Value::Mapping(self.map)
    }
}

pub fn str_value(s: &str) -> Value {
    Value::String(s.to_string())
}

pub fn seq_of_strings<'a, I: IntoIterator<Item = &'a String>>(items: I) -> Value {
    Value::Sequence(items.into_iter().map(|s| str_value(s)).collect())
}

pub fn map_of_strings(map: &BTreeMap<String, String>) -> Value {
    let mut out = Mapping::new();
    for (k, v) in map {
        out.insert(str_value(k), str_value(v));
    }
    Value::Mapping(out)
}

/// Serialize a value tree to canonical YAML.
pub fn to_canonical_string(value: &Value) -> String {
    // serde_yaml already emits two-space indentation, LF endings and a
    // trailing newline; key order follows mapping insertion order.
    serde_yaml::to_string(value).unwrap_or_else(|_| String::from("{}\n"))
}
