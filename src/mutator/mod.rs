//! Entry mutations: codec, authorization, application, and the client-side
//! builder.
//!
//! The same [`mutate`] check runs on both sides of the wire: the builder
//! dry-runs it before submitting, and the monitor replays it against every
//! mutation the server publishes.

use prost::Message;
use thiserror::Error;

use crate::api::Entry;
use crate::crypto::sign::{self, SignError};

/// Parsing and canonical hashing of leaf entries.
pub mod entry;
/// Builder producing signed, authorized update requests.
pub mod mutation;

pub use mutation::Mutation;

/// Errors surfaced while constructing or applying mutations.
#[derive(Debug, Error)]
pub enum MutateError {
    #[error("mutation does not name any authorized keys")]
    MissingKey,
    #[error("mutation is not signed by an authorized key")]
    UnauthorizedSignature,
    #[error("duplicate signature for key id {0}")]
    DuplicateSignature(String),
    #[error("mutation replays the previous entry")]
    Replay,
    #[error("mutation changes the entry index")]
    IndexMismatch,
    #[error("mutation does not chain to the previous entry")]
    PreviousHashMismatch,
    #[error("malformed entry encoding")]
    Decode(#[from] prost::DecodeError),
    #[error(transparent)]
    Sign(#[from] SignError),
}

/// Applies `new_entry` on top of `prev_entry`, returning the entry that
/// now occupies the leaf.
///
/// This enforces the chaining, authorization, and replay rules; it is the
/// same check the server's mutator runs, so a mutation that passes here
/// will not be silently dropped later.
pub fn mutate(prev_entry: Option<&Entry>, new_entry: &Entry) -> Result<Entry, MutateError> {
    if new_entry.previous != entry::entry_hash(prev_entry) {
        // A resubmission of the entry already in the leaf chains to the
        // state before itself, so it surfaces here rather than as a
        // plain hash mismatch.
        if let Some(prev) = prev_entry {
            if prev.encode_to_vec() == new_entry.encode_to_vec() {
                return Err(MutateError::Replay);
            }
        }
        return Err(MutateError::PreviousHashMismatch);
    }
    verify_authorization(prev_entry, new_entry)?;
    if new_entry.authorized_keys.is_empty() {
        return Err(MutateError::MissingKey);
    }
    if let Some(prev) = prev_entry {
        if prev.index != new_entry.index {
            return Err(MutateError::IndexMismatch);
        }
    }
    Ok(new_entry.clone())
}

/// Checks that the signature set on `new_entry` authorizes the mutation.
///
/// Authorization is always judged against the *previous* entry's key set;
/// only the initial insert falls back to the keys the new entry declares.
/// Every signature present must verify over the new entry with its
/// signatures cleared, and at least one must come from the governing set.
pub(crate) fn verify_authorization(
    prev_entry: Option<&Entry>,
    new_entry: &Entry,
) -> Result<(), MutateError> {
    if new_entry.signatures.is_empty() {
        return Err(MutateError::UnauthorizedSignature);
    }
    let governing = match prev_entry {
        Some(prev) => &prev.authorized_keys,
        None => &new_entry.authorized_keys,
    };

    let signed_value = new_entry.canonical_value(true);
    let mut authorized_signature = false;
    for (key_id, signature) in &new_entry.signatures {
        let key = governing
            .iter()
            .chain(new_entry.authorized_keys.iter())
            .find(|key| key.key_id == *key_id)
            .ok_or(MutateError::UnauthorizedSignature)?;
        let verifying_key = sign::verifying_key_from_public(key)
            .map_err(|_| MutateError::UnauthorizedSignature)?;
        sign::verify_object(&verifying_key, &signed_value, signature)
            .map_err(|_| MutateError::UnauthorizedSignature)?;
        if governing.iter().any(|key| key.key_id == *key_id) {
            authorized_signature = true;
        }
    }
    if !authorized_signature {
        return Err(MutateError::UnauthorizedSignature);
    }
    Ok(())
}
