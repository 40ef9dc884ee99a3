//! Variable scoping helpers.
//!
//! The visible scope of a command is built from the process globals plus the
//! locals of every frame on the thread's stack, merged oldest frame first so
//! that inner frames shadow outer ones.

use serde_json::Value;

use crate::error::VmError;

/// A string-keyed map of JSON values. Used for frame locals, task input,
/// process globals and evaluation scopes.
pub type Variables = serde_json::Map<String, Value>;

/// Interprets a value as a boolean condition.
///
/// Accepts real booleans plus the strings `"true"` / `"false"` (case
/// insensitive), which show up when conditions come from interpolated
/// sources. Anything else is rejected.
pub fn coerce_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) => {
            if s.eq_ignore_ascii_case("true") {
                Some(true)
            } else if s.eq_ignore_ascii_case("false") {
                Some(false)
            } else {
                None
            }
        }
        _ => None,
    }
}

/// Deep-merges `overlay` into `base`. Objects merge recursively; any other
/// kind of value in the overlay replaces the base value.
pub fn deep_merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (k, v) in overlay_map {
                match base_map.get_mut(k) {
                    Some(slot) => deep_merge(slot, v),
                    None => {
                        base_map.insert(k.clone(), v.clone());
                    }
                }
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}

/// Normalizes a loop source into a list of items.
///
/// Arrays are taken as-is. Objects become `{"key": ..., "value": ...}`
/// entries in key order. `null` yields an empty list. Scalars are rejected.
pub fn normalize_items(value: &Value) -> Result<Vec<Value>, VmError> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::Array(items) => Ok(items.clone()),
        Value::Object(map) => Ok(map
            .iter()
            .map(|(k, v)| {
                let mut entry = Variables::new();
                entry.insert("key".to_string(), Value::String(k.clone()));
                entry.insert("value".to_string(), v.clone());
                Value::Object(entry)
            })
            .collect()),
        other => Err(VmError::Type(format!(
            "cannot iterate over a value of this kind: {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn bool_coercion() {
        assert_eq!(coerce_bool(&json!(true)), Some(true));
        assert_eq!(coerce_bool(&json!("TRUE")), Some(true));
        assert_eq!(coerce_bool(&json!("false")), Some(false));
        assert_eq!(coerce_bool(&json!("yes")), None);
        assert_eq!(coerce_bool(&json!(1)), None);
        assert_eq!(coerce_bool(&json!(null)), None);
    }

    #[test]
    fn deep_merge_merges_nested_objects() {
        let mut base = json!({"a": {"x": 1, "y": 2}, "b": 1});
        deep_merge(&mut base, &json!({"a": {"y": 3, "z": 4}, "c": 5}));
        assert_eq!(base, json!({"a": {"x": 1, "y": 3, "z": 4}, "b": 1, "c": 5}));
    }

    #[test]
    fn deep_merge_replaces_scalars_and_arrays() {
        let mut base = json!({"a": [1, 2], "b": "old"});
        deep_merge(&mut base, &json!({"a": [3], "b": "new"}));
        assert_eq!(base, json!({"a": [3], "b": "new"}));
    }

    #[test]
    fn items_from_array_and_object() {
        assert_eq!(
            normalize_items(&json!([1, 2])).unwrap(),
            vec![json!(1), json!(2)]
        );
        let entries = normalize_items(&json!({"a": 1, "b": 2})).unwrap();
        assert_eq!(
            entries,
            vec![
                json!({"key": "a", "value": 1}),
                json!({"key": "b", "value": 2})
            ]
        );
        assert!(normalize_items(&json!(null)).unwrap().is_empty());
    }

    #[test]
    fn items_from_scalar_is_an_error() {
        assert!(matches!(
            normalize_items(&json!(42)),
            Err(VmError::Type(_))
        ));
    }
}
