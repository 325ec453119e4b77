//! Metadata filter expressions
//!
//! A filter maps a metadata field to either a scalar (equality) or an array
//! (any-of). Filters are kept in a sorted map so equivalent filters share one
//! canonical form, which the query cache relies on.

use super::Metadata;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Filter(BTreeMap<String, Value>);

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a field constraint
    pub fn with(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.0.insert(field.to_string(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Merge another filter into this one; fields in `other` win
    pub fn merge(&mut self, other: &Filter) {
        for (field, value) in &other.0 {
            self.0.insert(field.clone(), value.clone());
        }
    }

    /// Check whether chunk metadata satisfies every constraint
    pub fn matches(&self, metadata: &Metadata) -> bool {
        self.0.iter().all(|(field, expected)| {
            if is_unconstrained(expected) {
                return true;
            }
            match metadata.get(field) {
                Some(actual) => value_matches(expected, actual),
                None => false,
            }
        })
    }

    /// Canonical JSON rendering: sorted keys, scalar arrays sorted and deduplicated
    pub fn canonical(&self) -> String {
        let canonical: serde_json::Map<String, Value> = self
            .0
            .iter()
            .filter(|(_, v)| !is_unconstrained(v))
            .map(|(k, v)| (k.clone(), canonical_value(v)))
            .collect();
        Value::Object(canonical).to_string()
    }
}

impl From<BTreeMap<String, Value>> for Filter {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Self(map)
    }
}

fn is_unconstrained(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

fn value_matches(expected: &Value, actual: &Value) -> bool {
    match (expected, actual) {
        (Value::Array(wanted), Value::Array(present)) => {
            wanted.iter().any(|w| present.contains(w))
        }
        (Value::Array(wanted), scalar) => wanted.contains(scalar),
        (scalar, Value::Array(present)) => present.contains(scalar),
        (a, b) => a == b,
    }
}

fn canonical_value(value: &Value) -> Value {
    match value {
        Value::Array(items) => {
            let mut items: Vec<Value> = items.iter().map(canonical_value).collect();
            items.sort_by_key(|v| v.to_string());
            items.dedup();
            Value::Array(items)
        }
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k.clone(), canonical_value(v)))
                    .collect(),
            )
        }
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn meta(value: Value) -> Metadata {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_scalar_and_any_of_matching() {
        let filter = Filter::new()
            .with("domain", json!(["physics", "math"]))
            .with("difficulty_level", "beginner");

        assert!(filter.matches(&meta(json!({"domain": "math", "difficulty_level": "beginner"}))));
        assert!(!filter.matches(&meta(json!({"domain": "history", "difficulty_level": "beginner"}))));
        assert!(!filter.matches(&meta(json!({"domain": "math"}))));
    }

    #[test]
    fn test_array_metadata_intersects() {
        let filter = Filter::new().with("tags", json!(["rust"]));
        assert!(filter.matches(&meta(json!({"tags": ["go", "rust"]}))));
    }

    #[test]
    fn test_empty_values_do_not_constrain() {
        let filter = Filter::new().with("domain", json!([])).with("level", Value::Null);
        assert!(filter.matches(&Metadata::new()));
        assert_eq!(filter.canonical(), "{}");
    }

    #[test]
    fn test_canonical_is_order_independent() {
        let a: Filter = serde_json::from_value(json!({
            "domain": ["math", "physics", "math"],
            "level": "advanced"
        }))
        .unwrap();
        let b: Filter = serde_json::from_value(json!({
            "level": "advanced",
            "domain": ["physics", "math"]
        }))
        .unwrap();

        assert_eq!(a.canonical(), b.canonical());
    }

    #[test]
    fn test_merge_overrides_fields() {
        let mut base = Filter::new().with("domain", "math");
        base.merge(&Filter::new().with("domain", "physics").with("level", "intro"));
        assert_eq!(base.len(), 2);
        assert!(base.matches(&meta(json!({"domain": "physics", "level": "intro"}))));
    }
}
