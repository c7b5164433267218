//! Dotted-path access and comparison helpers over JSON values.
//!
//! Paths are dot separated (`customer.address.city`). A numeric segment
//! indexes into an array; any other segment applied to an array is mapped
//! over its elements and the results are flattened one level.

use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashSet;

use crate::types::Record;

/// Resolve a dotted path against a value
pub fn resolve_path(value: &Value, path: &str) -> Option<Value> {
    if path.is_empty() {
        return Some(value.clone());
    }

    let (head, rest) = path.split_once('.').unwrap_or((path, ""));

    match value {
        Value::Object(map) => resolve_path(map.get(head)?, rest),
        Value::Array(items) => {
            if let Ok(index) = head.parse::<usize>() {
                return resolve_path(items.get(index)?, rest);
            }

            let mut collected = Vec::new();
            for item in items {
                match resolve_path(item, path) {
                    Some(Value::Array(nested)) => collected.extend(nested),
                    Some(found) => collected.push(found),
                    None => {}
                }
            }
            Some(Value::Array(collected))
        }
        _ => None,
    }
}

/// Resolve a dotted path against a record
pub fn resolve_in_record(record: &Record, path: &str) -> Option<Value> {
    let (head, rest) = path.split_once('.').unwrap_or((path, ""));
    resolve_path(record.get(head)?, rest)
}

/// Set a value at a dotted path, creating intermediate objects
pub fn set_path(record: &mut Record, path: &str, value: Value) {
    match path.split_once('.') {
        None => {
            record.insert(path.to_string(), value);
        }
        Some((head, rest)) => {
            let entry = record
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Record::new()));
            if !entry.is_object() {
                *entry = Value::Object(Record::new());
            }
            if let Value::Object(child) = entry {
                set_path(child, rest, value);
            }
        }
    }
}

/// Drop repeated values, keeping first occurrences in order
pub fn distinct(values: Vec<Value>) -> Vec<Value> {
    let mut seen = HashSet::new();
    values
        .into_iter()
        .filter(|v| seen.insert(v.to_string()))
        .collect()
}

pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// Equality that treats `1` and `1.0` as the same number
pub fn loosely_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => left == right,
    }
}

/// Ordering between two scalars of the same kind
pub fn compare(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_resolve_nested_object() {
        let value = json!({"customer": {"address": {"city": "Oslo"}}});
        assert_eq!(
            resolve_path(&value, "customer.address.city"),
            Some(json!("Oslo"))
        );
        assert_eq!(resolve_path(&value, "customer.phone"), None);
    }

    #[test]
    fn test_resolve_maps_over_arrays() {
        let value = json!({"lines": [{"sku": "a"}, {"sku": "b"}, {"qty": 1}]});
        assert_eq!(resolve_path(&value, "lines.sku"), Some(json!(["a", "b"])));
        assert_eq!(resolve_path(&value, "lines.1.sku"), Some(json!("b")));
    }

    #[test]
    fn test_set_path_creates_parents() {
        let mut record = Record::new();
        record.insert("meta".into(), json!("scalar"));
        set_path(&mut record, "meta.owner.name", json!("ada"));
        set_path(&mut record, "flat", json!(1));

        assert_eq!(
            Value::Object(record),
            json!({"meta": {"owner": {"name": "ada"}}, "flat": 1})
        );
    }

    #[test]
    fn test_distinct_keeps_order() {
        let values = vec![json!(2), json!(1), json!(2), json!("2"), json!(1)];
        assert_eq!(distinct(values), vec![json!(2), json!(1), json!("2")]);
    }

    #[test]
    fn test_loose_number_equality() {
        assert!(loosely_equal(&json!(1), &json!(1.0)));
        assert!(!loosely_equal(&json!(1), &json!("1")));
        assert_eq!(compare(&json!(2), &json!(10)), Some(Ordering::Less));
        assert_eq!(compare(&json!("b"), &json!("a")), Some(Ordering::Greater));
        assert_eq!(compare(&json!(1), &json!("a")), None);
    }
}
