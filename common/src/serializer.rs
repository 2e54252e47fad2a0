// Canonical JSON serialization
//
// Every hash in the protocol commits to a canonical rendering of its inputs:
// map keys ordered lexicographically, numbers in decimal, strings UTF-8,
// no insignificant whitespace. Two nodes serializing the same value must
// produce byte-identical output or their hashes will never agree.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::CommonError;

/// Serialize a value to its canonical JSON string.
pub fn to_canonical_json<T: Serialize>(value: &T) -> Result<String, CommonError> {
    let value = serde_json::to_value(value)?;
    Ok(canonicalize(&value).to_string())
}

/// Serialize a value to canonical JSON bytes, for hashing.
pub fn to_canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, CommonError> {
    Ok(to_canonical_json(value)?.into_bytes())
}

// Rebuild a JSON value with all object keys sorted.
// serde_json::Map preserves insertion order by default, so we re-insert
// keys in lexicographic order at every level.
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::with_capacity(map.len());
            for key in keys {
                sorted.insert(key.clone(), canonicalize(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(values) => Value::Array(values.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_keys_are_sorted() {
        let value = json!({"b": 1, "a": {"z": true, "y": false}, "c": [{"k": 2, "j": 1}]});
        let canonical = to_canonical_json(&value).unwrap();
        assert_eq!(canonical, r#"{"a":{"y":false,"z":true},"b":1,"c":[{"j":1,"k":2}]}"#);
    }

    #[test]
    fn test_insertion_order_does_not_matter() {
        let first = json!({"amount": 5, "fee": 1});
        let second = json!({"fee": 1, "amount": 5});
        assert_eq!(
            to_canonical_json(&first).unwrap(),
            to_canonical_json(&second).unwrap()
        );
    }

    #[test]
    fn test_scalars_pass_through() {
        assert_eq!(to_canonical_json(&42u64).unwrap(), "42");
        assert_eq!(to_canonical_json(&"hello").unwrap(), "\"hello\"");
    }
}
