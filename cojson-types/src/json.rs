//! Canonical JSON encoding.
//!
//! Hashes and signatures are computed over JSON text, so every peer has to
//! produce byte-identical output for the same value. Object keys are emitted
//! in lexicographic order at every nesting level and no whitespace is added.

use crate::Result;
use serde::Serialize;
use serde_json::{Map, Value};

/// Serializes `value` to canonical JSON text.
pub fn stable_json<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    let value = serde_json::to_value(value)?;
    Ok(serde_json::to_string(&canonicalize(value))?)
}

/// Rebuilds every object in `value` with its keys sorted.
pub fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let mut sorted = Map::new();
            for (key, value) in entries {
                sorted.insert(key, canonicalize(value));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn keys_are_sorted_at_every_level() {
        let value = json!({"b": 1, "a": {"z": true, "c": [ {"y": 1, "x": 2} ]}});
        assert_eq!(
            stable_json(&value).unwrap(),
            r#"{"a":{"c":[{"x":2,"y":1}],"z":true},"b":1}"#
        );
    }

    #[test]
    fn scalars_pass_through() {
        assert_eq!(stable_json(&json!("hi")).unwrap(), r#""hi""#);
        assert_eq!(stable_json(&json!(null)).unwrap(), "null");
    }
}
