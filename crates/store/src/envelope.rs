//! Versioned JSON envelope: `{"version", "minor_version", "key", "data"}`.
//!
//! Tools that rewrite a store file keep every envelope field other than
//! `data` exactly as found, including key order.

use serde_json::{Map, Value};

pub const ENVELOPE_VERSION: u64 = 1;
pub const ENVELOPE_MINOR_VERSION: u64 = 1;

const DATA_FIELD: &str = "data";

/// Wrap `data` in a fresh envelope for `key`.
pub fn new_envelope(key: &str, data: Value) -> Value {
    let mut map = Map::new();
    map.insert("version".into(), Value::from(ENVELOPE_VERSION));
    map.insert("minor_version".into(), Value::from(ENVELOPE_MINOR_VERSION));
    map.insert("key".into(), Value::from(key));
    map.insert(DATA_FIELD.into(), data);
    Value::Object(map)
}

/// Whether `doc` looks like an envelope rather than bare data.
pub fn is_envelope(doc: &Value) -> bool {
    doc.as_object()
        .is_some_and(|map| map.contains_key(DATA_FIELD) && map.contains_key("version"))
}

/// Replace the payload of `existing`, or build a new envelope when there is
/// no usable one.
pub fn rewrap(existing: Option<Value>, key: &str, data: Value) -> Value {
    match existing {
        Some(Value::Object(mut map)) if map.contains_key("version") => {
            // Overwriting in place keeps the field's original position.
            map.insert(DATA_FIELD.into(), data);
            Value::Object(map)
        }
        _ => new_envelope(key, data),
    }
}

/// Extract the payload of a stored document.
///
/// Bare documents written without an envelope are returned unchanged.
pub fn unwrap_data(doc: Value) -> Value {
    match doc {
        Value::Object(mut map) if map.contains_key("version") && map.contains_key(DATA_FIELD) => {
            map.remove(DATA_FIELD).unwrap_or(Value::Null)
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn new_envelope_has_expected_fields_in_order() {
        let env = new_envelope("lockly_activity", json!([]));
        let keys: Vec<&str> = env.as_object().unwrap().keys().map(String::as_str).collect();
        assert_eq!(keys, ["version", "minor_version", "key", "data"]);
        assert_eq!(env["version"], 1);
    }

    #[test]
    fn rewrap_preserves_metadata_and_order() {
        let existing: Value = serde_json::from_str(
            r#"{"key":"lockly_activity.abc","version":3,"data":[1],"minor_version":2}"#,
        )
        .unwrap();
        let out = rewrap(Some(existing), "ignored", json!([1, 2]));
        assert_eq!(
            serde_json::to_string(&out).unwrap(),
            r#"{"key":"lockly_activity.abc","version":3,"data":[1,2],"minor_version":2}"#
        );
    }

    #[test]
    fn rewrap_replaces_non_envelope() {
        let out = rewrap(Some(json!([1])), "k", json!([2]));
        assert!(is_envelope(&out));
        assert_eq!(out["key"], "k");
    }

    #[test]
    fn unwrap_returns_bare_documents() {
        assert_eq!(unwrap_data(json!([1, 2])), json!([1, 2]));
        assert_eq!(unwrap_data(new_envelope("k", json!({"a": 1}))), json!({"a": 1}));
    }
}
