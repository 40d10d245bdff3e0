//! Leaf codec and canonical hashing for entries.

use prost::Message;

use crate::api::Entry;
use crate::crypto::objecthash::{object_hash, Value};

/// Decodes sparse map leaf bytes into an entry.
///
/// Zero-length bytes — and an encoding of the all-defaults message — are
/// the canonical empty entry and decode to `None`.
pub fn parse_leaf(bytes: &[u8]) -> Result<Option<Entry>, prost::DecodeError> {
    if bytes.is_empty() {
        return Ok(None);
    }
    let entry = Entry::decode(bytes)?;
    if entry == Entry::default() {
        return Ok(None);
    }
    Ok(Some(entry))
}

/// Encodes an entry back to leaf bytes; the empty entry is zero bytes.
#[must_use]
pub fn leaf_value(entry: Option<&Entry>) -> Vec<u8> {
    match entry {
        Some(entry) => entry.encode_to_vec(),
        None => Vec::new(),
    }
}

/// Object hash of an entry as chained through the `previous` field.
///
/// The absent entry hashes as the null value, which seeds the chain for
/// brand-new entries. Present entries hash with their signatures included,
/// pinning the exact revision that was observed.
#[must_use]
pub fn entry_hash(entry: Option<&Entry>) -> [u8; 32] {
    match entry {
        Some(entry) => object_hash(&entry.canonical_value(false)),
        None => object_hash(&Value::Null),
    }
}
