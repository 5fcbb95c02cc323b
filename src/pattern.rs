//! Structural subset matching over JSON values
//!
//! This is the query language of every storage adapter. A pattern matches a
//! value when the pattern is structurally present inside it:
//!
//! - mapping vs mapping: every pattern key exists in the value and its
//!   sub-pattern matches; extra keys in the value are ignored
//! - sequence vs sequence: every pattern element matches *at least one*
//!   value element (existential, not positional, not injective)
//! - anything else: exact equality
//!
//! An empty mapping or an empty sequence matches every value.
//!
//! ```rust
//! use protos_db::pattern::matches;
//! use serde_json::json;
//!
//! assert!(matches(&json!({}), &json!(42)));
//! assert!(matches(&json!({"a": 1}), &json!({"a": 1, "b": 2})));
//! assert!(!matches(&json!({"a": 1}), &json!({"b": 2})));
//! assert!(matches(&json!([{"x": 1}]), &json!([{"x": 1, "y": 2}, {"z": 3}])));
//! ```

use serde_json::{Number, Value};

/// Does `pattern` structurally match a subset of `value`?
#[must_use]
pub fn matches(pattern: &Value, value: &Value) -> bool {
    match (pattern, value) {
        (Value::Object(pat), _) if pat.is_empty() => true,
        (Value::Array(pat), _) if pat.is_empty() => true,
        (Value::Object(pat), Value::Object(map)) => pat
            .iter()
            .all(|(key, sub)| map.get(key).is_some_and(|v| matches(sub, v))),
        (Value::Array(pat), Value::Array(items)) => pat
            .iter()
            .all(|sub| items.iter().any(|item| matches(sub, item))),
        _ => values_equal(pattern, value),
    }
}

/// Exact equality with numeric comparison across integer and float
/// representations (`1 == 1.0`).
#[must_use]
pub fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => numbers_equal(a, b),
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| values_equal(x, y))
        }
        (Value::Object(a), Value::Object(b)) => {
            a.len() == b.len()
                && a
                    .iter()
                    .all(|(key, x)| b.get(key).is_some_and(|y| values_equal(x, y)))
        }
        _ => left == right,
    }
}

#[allow(clippy::float_cmp)]
fn numbers_equal(a: &Number, b: &Number) -> bool {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        return x == y;
    }
    if let (Some(x), Some(y)) = (a.as_u64(), b.as_u64()) {
        return x == y;
    }
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_empty_mapping_matches_anything() {
        for value in [json!(null), json!(1), json!("s"), json!([1]), json!({"k": 1})] {
            assert!(matches(&json!({}), &value));
        }
    }

    #[test]
    fn test_empty_sequence_matches_anything() {
        assert!(matches(&json!([]), &json!([1, 2])));
        assert!(matches(&json!([]), &json!({"a": 1})));
        assert!(matches(&json!([]), &json!("scalar")));
    }

    #[test]
    fn test_mapping_subset() {
        assert!(matches(&json!({"a": 1}), &json!({"a": 1, "b": 2})));
        assert!(!matches(&json!({"a": 1}), &json!({"b": 2})));
        assert!(!matches(&json!({"a": 1}), &json!({"a": 2})));
    }

    #[test]
    fn test_nested_mapping() {
        let value = json!({"metadata": {"id": "x1", "tags": ["a", "b"]}, "data": {}});
        assert!(matches(&json!({"metadata": {"id": "x1"}}), &value));
        assert!(matches(&json!({"metadata": {"tags": ["b"]}}), &value));
        assert!(!matches(&json!({"metadata": {"tags": ["c"]}}), &value));
        assert!(matches(&json!({"data": {}}), &value));
        assert!(!matches(&json!({"files": {}}), &value));
    }

    #[test]
    fn test_sequence_is_existential_not_positional() {
        assert!(matches(&json!([{"x": 1}]), &json!([{"x": 1, "y": 2}, {"z": 3}])));
        assert!(matches(&json!([3, 1]), &json!([1, 2, 3])));
        assert!(!matches(&json!([4]), &json!([1, 2, 3])));
    }

    #[test]
    fn test_sequence_is_not_injective() {
        // Two identical sub-patterns may both match the same element.
        assert!(matches(&json!([{"x": 1}, {"x": 1}]), &json!([{"x": 1}])));
    }

    #[test]
    fn test_mismatched_shapes_fall_back_to_equality() {
        assert!(!matches(&json!({"a": 1}), &json!([{"a": 1}])));
        assert!(!matches(&json!([1]), &json!(1)));
        assert!(!matches(&json!(1), &json!([1])));
    }

    #[test]
    fn test_scalars() {
        assert!(matches(&json!("abc"), &json!("abc")));
        assert!(!matches(&json!("abc"), &json!("abd")));
        assert!(matches(&json!(null), &json!(null)));
        assert!(!matches(&json!(true), &json!(1)));
    }

    #[test]
    fn test_numeric_equality_across_representations() {
        assert!(matches(&json!(1), &json!(1.0)));
        assert!(matches(&json!({"p": 2.5}), &json!({"p": 2.5})));
        assert!(!matches(&json!(1), &json!(1.5)));
    }
}
