use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// A structured value with a canonical, type-tagged digest.
///
/// Two logically equal values hash identically no matter how they were
/// constructed. Map keys are kept sorted and the digest of a map is
/// independent of insertion order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Wraps raw bytes as the base64 string form used by the canonical
    /// JSON encoding.
    #[must_use]
    pub fn base64_bytes(bytes: &[u8]) -> Self {
        Self::Str(BASE64.encode(bytes))
    }
}

/// Errors produced while decoding canonical JSON into a [`Value`].
#[derive(Debug, Error)]
pub enum ObjectHashError {
    #[error("malformed canonical JSON: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("canonical JSON does not permit non-integer numbers")]
    NonIntegerNumber,
}

const TAG_NULL: u8 = b'n';
const TAG_BOOL: u8 = b'b';
const TAG_INT: u8 = b'i';
const TAG_STR: u8 = b'u';
const TAG_BYTES: u8 = b'r';
const TAG_LIST: u8 = b'l';
const TAG_MAP: u8 = b'd';

fn tagged_hash(tag: u8, payload: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update([tag]);
    hasher.update(payload);
    hasher.finalize().into()
}

/// Computes the 32-byte canonical digest of `value`.
#[must_use]
pub fn object_hash(value: &Value) -> [u8; 32] {
    match value {
        Value::Null => tagged_hash(TAG_NULL, &[]),
        Value::Bool(b) => tagged_hash(TAG_BOOL, if *b { b"1" } else { b"0" }),
        Value::Int(i) => tagged_hash(TAG_INT, i.to_string().as_bytes()),
        Value::Str(s) => tagged_hash(TAG_STR, s.as_bytes()),
        Value::Bytes(b) => tagged_hash(TAG_BYTES, b),
        Value::List(items) => {
            let mut payload = Vec::with_capacity(items.len() * 32);
            for item in items {
                payload.extend_from_slice(&object_hash(item));
            }
            tagged_hash(TAG_LIST, &payload)
        }
        Value::Map(entries) => {
            let mut pairs: Vec<[u8; 64]> = entries
                .iter()
                .map(|(key, val)| {
                    let mut pair = [0u8; 64];
                    pair[..32].copy_from_slice(&object_hash(&Value::Str(key.clone())));
                    pair[32..].copy_from_slice(&object_hash(val));
                    pair
                })
                .collect();
            pairs.sort_unstable();
            let mut payload = Vec::with_capacity(pairs.len() * 64);
            for pair in &pairs {
                payload.extend_from_slice(pair);
            }
            tagged_hash(TAG_MAP, &payload)
        }
    }
}

/// Emits the canonical JSON encoding: sorted keys, no whitespace, integer
/// numbers only, byte fields pre-encoded as base64 strings.
#[must_use]
pub fn to_canonical_json(value: &Value) -> Vec<u8> {
    let mut out = String::new();
    write_json(value, &mut out);
    out.into_bytes()
}

fn write_json(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(true) => out.push_str("true"),
        Value::Bool(false) => out.push_str("false"),
        Value::Int(i) => out.push_str(&i.to_string()),
        Value::Str(s) => write_json_string(s, out),
        Value::Bytes(b) => write_json_string(&BASE64.encode(b), out),
        Value::List(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_json(item, out);
            }
            out.push(']');
        }
        Value::Map(entries) => {
            out.push('{');
            for (i, (key, val)) in entries.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_json_string(key, out);
                out.push(':');
                write_json(val, out);
            }
            out.push('}');
        }
    }
}

fn write_json_string(s: &str, out: &mut String) {
    // serde_json escapes deterministically; strings always encode the
    // same way regardless of the surrounding document.
    match serde_json::to_string(s) {
        Ok(quoted) => out.push_str(&quoted),
        Err(_) => unreachable!("string serialization is infallible"),
    }
}

/// Parses canonical JSON back into a [`Value`].
///
/// Byte fields stay in their base64 string form, which is exactly how the
/// digest treats them, so hashing a parsed document equals hashing the
/// value it was emitted from.
pub fn from_json(bytes: &[u8]) -> Result<Value, ObjectHashError> {
    let parsed: serde_json::Value = serde_json::from_slice(bytes)?;
    convert_json(parsed)
}

fn convert_json(value: serde_json::Value) -> Result<Value, ObjectHashError> {
    match value {
        serde_json::Value::Null => Ok(Value::Null),
        serde_json::Value::Bool(b) => Ok(Value::Bool(b)),
        serde_json::Value::Number(n) => {
            n.as_i64().map(Value::Int).ok_or(ObjectHashError::NonIntegerNumber)
        }
        serde_json::Value::String(s) => Ok(Value::Str(s)),
        serde_json::Value::Array(items) => {
            let mut converted = Vec::with_capacity(items.len());
            for item in items {
                converted.push(convert_json(item)?);
            }
            Ok(Value::List(converted))
        }
        serde_json::Value::Object(entries) => {
            let mut map = BTreeMap::new();
            for (key, val) in entries {
                map.insert(key, convert_json(val)?);
            }
            Ok(Value::Map(map))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_digest_ignores_insertion_order() {
        let mut left = BTreeMap::new();
        left.insert("x".to_string(), Value::Int(1));
        left.insert("y".to_string(), Value::Int(2));
        let mut right = BTreeMap::new();
        right.insert("y".to_string(), Value::Int(2));
        right.insert("x".to_string(), Value::Int(1));
        assert_eq!(object_hash(&Value::Map(left)), object_hash(&Value::Map(right)));
    }

    #[test]
    fn rebinding_a_value_to_another_key_changes_the_digest() {
        let mut left = BTreeMap::new();
        left.insert("x".to_string(), Value::Int(1));
        left.insert("y".to_string(), Value::Int(2));
        let mut right = BTreeMap::new();
        right.insert("x".to_string(), Value::Int(2));
        right.insert("y".to_string(), Value::Int(1));
        assert_ne!(object_hash(&Value::Map(left)), object_hash(&Value::Map(right)));
    }

    #[test]
    fn distinct_types_hash_distinctly() {
        let digests = [
            object_hash(&Value::Null),
            object_hash(&Value::Bool(false)),
            object_hash(&Value::Int(0)),
            object_hash(&Value::Str(String::new())),
            object_hash(&Value::Bytes(Vec::new())),
            object_hash(&Value::List(Vec::new())),
            object_hash(&Value::Map(BTreeMap::new())),
        ];
        for (i, a) in digests.iter().enumerate() {
            for b in &digests[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn one_bit_change_flips_the_digest() {
        let base = Value::Bytes(vec![0x00, 0x01, 0x02]);
        let flipped = Value::Bytes(vec![0x00, 0x01, 0x03]);
        assert_ne!(object_hash(&base), object_hash(&flipped));

        let base = Value::Str("profile".to_string());
        let flipped = Value::Str("profilf".to_string());
        assert_ne!(object_hash(&base), object_hash(&flipped));
    }

    #[test]
    fn json_round_trip_preserves_the_digest() {
        let mut map = BTreeMap::new();
        map.insert("commitment".to_string(), Value::base64_bytes(&[0xDE, 0xAD]));
        map.insert("revision".to_string(), Value::Int(7));
        map.insert(
            "keys".to_string(),
            Value::List(vec![Value::Str("k1".to_string()), Value::Null]),
        );
        let value = Value::Map(map);

        let encoded = to_canonical_json(&value);
        let decoded = from_json(&encoded).expect("canonical JSON parses");
        assert_eq!(object_hash(&value), object_hash(&decoded));
    }

    #[test]
    fn canonical_json_is_compact_and_sorted() {
        let mut map = BTreeMap::new();
        map.insert("b".to_string(), Value::Int(2));
        map.insert("a".to_string(), Value::Int(1));
        let encoded = to_canonical_json(&Value::Map(map));
        assert_eq!(encoded, br#"{"a":1,"b":2}"#.to_vec());
    }

    #[test]
    fn rejects_non_integer_numbers() {
        let err = from_json(br#"{"ratio":0.5}"#).expect_err("floats must be rejected");
        assert!(matches!(err, ObjectHashError::NonIntegerNumber));
    }
}
