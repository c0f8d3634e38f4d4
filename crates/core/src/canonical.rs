//! Canonical JSON encoding.
//!
//! The signing preimage of a transaction and the state machine snapshot both
//! use this encoding: object keys sorted ascending byte-wise, no insignificant
//! whitespace, UTF-8. Every replica must agree on these bytes exactly.

use crate::{CoreError, Result};
use serde::Serialize;
use serde_json::Value;

/// Encodes any serializable value canonically.
pub fn canonicalize<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let v = serde_json::to_value(value)
        .map_err(|e| CoreError::Internal(format!("canonical encode: {e}")))?;
    Ok(to_canonical_vec(&v))
}

/// Canonical byte encoding of a JSON value.
pub fn to_canonical_vec(value: &Value) -> Vec<u8> {
    to_canonical_string(value).into_bytes()
}

/// Canonical string encoding of a JSON value.
pub fn to_canonical_string(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        // Scalars already render compactly and deterministically.
        other => out.push_str(&other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sorts_object_keys_recursively() {
        let v = json!({"b": 1, "a": {"z": true, "m": [3, {"y": 1, "x": 2}]}});
        assert_eq!(
            to_canonical_string(&v),
            r#"{"a":{"m":[3,{"x":2,"y":1}],"z":true},"b":1}"#
        );
    }

    #[test]
    fn no_insignificant_whitespace() {
        let v = json!({"k": [1, 2, 3], "s": "a b"});
        assert_eq!(to_canonical_string(&v), r#"{"k":[1,2,3],"s":"a b"}"#);
    }

    #[test]
    fn escapes_strings() {
        let v = json!({"q": "he said \"hi\"\n"});
        assert_eq!(to_canonical_string(&v), r#"{"q":"he said \"hi\"\n"}"#);
    }

    #[test]
    fn encoding_is_insensitive_to_insertion_order() {
        let a: Value = serde_json::from_str(r#"{"x":1,"y":2}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"y":2,"x":1}"#).unwrap();
        assert_eq!(to_canonical_vec(&a), to_canonical_vec(&b));
    }
}
