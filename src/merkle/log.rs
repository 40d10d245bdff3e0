//! Append-only log verification.
//!
//! The log stores serialized map roots as leaves in revision order. The
//! client advances a trusted [`SignedLogRoot`] through RFC 6962
//! consistency proofs and checks map-root membership with RFC 6962
//! inclusion proofs. Leaf hashing depends on the configured strategy:
//! plain prefixed SHA-256, or the object hash of the leaf parsed as
//! canonical JSON.

use p256::ecdsa::VerifyingKey;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::api::SignedLogRoot;
use crate::crypto::objecthash::{self, object_hash};
use crate::crypto::sign;

/// Leaf hashing strategy for the append-only log.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogHashStrategy {
    /// `H(0x00 ∥ leaf)` per RFC 6962.
    #[serde(rename = "RFC6962_SHA256")]
    Rfc6962Sha256,
    /// Object hash of the leaf parsed as canonical JSON; interior nodes
    /// stay RFC 6962.
    #[serde(rename = "OBJECT_RFC6962_SHA256")]
    ObjectRfc6962Sha256,
}

/// Errors surfaced while advancing or querying the trusted log root.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LogError {
    #[error("log root regressed from tree size {trusted} to {observed}")]
    Rewind { trusted: u64, observed: u64 },
    #[error("log consistency proof rejected")]
    ConsistencyInvalid,
    #[error("log inclusion proof rejected")]
    InclusionInvalid,
    #[error("log root signature rejected")]
    SignatureInvalid,
    #[error("log root hash must be 32 bytes")]
    MalformedRoot,
    #[error("log leaf is not canonical JSON")]
    MalformedLeaf,
    #[error("log proof element is not a 32-byte hash")]
    MalformedProof,
}

fn strategy_leaf_hash(strategy: LogHashStrategy, leaf: &[u8]) -> Result<[u8; 32], LogError> {
    match strategy {
        LogHashStrategy::Rfc6962Sha256 => {
            let mut hasher = Sha256::new();
            hasher.update([0x00]);
            hasher.update(leaf);
            Ok(hasher.finalize().into())
        }
        LogHashStrategy::ObjectRfc6962Sha256 => {
            let value = objecthash::from_json(leaf).map_err(|_| LogError::MalformedLeaf)?;
            Ok(object_hash(&value))
        }
    }
}

fn node_hash(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update([0x01]);
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

fn root_bytes(root: &SignedLogRoot) -> Result<[u8; 32], LogError> {
    root.root_hash.as_slice().try_into().map_err(|_| LogError::MalformedRoot)
}

fn proof_element(proof: &[Vec<u8>], index: usize) -> Result<[u8; 32], LogError> {
    let element = proof.get(index).ok_or(LogError::ConsistencyInvalid)?;
    element.as_slice().try_into().map_err(|_| LogError::MalformedProof)
}

/// Verifies log roots and membership against a configured log key.
#[derive(Clone)]
pub struct LogVerifier {
    public_key: VerifyingKey,
    strategy: LogHashStrategy,
}

impl LogVerifier {
    #[must_use]
    pub fn new(public_key: VerifyingKey, strategy: LogHashStrategy) -> Self {
        Self { public_key, strategy }
    }

    /// Hashes leaf bytes under the configured strategy.
    pub fn leaf_hash(&self, leaf: &[u8]) -> Result<[u8; 32], LogError> {
        strategy_leaf_hash(self.strategy, leaf)
    }

    fn verify_signature(&self, root: &SignedLogRoot) -> Result<(), LogError> {
        let signature = root.signature.as_ref().ok_or(LogError::SignatureInvalid)?;
        sign::verify_object(&self.public_key, &root.canonical_value(true), signature)
            .map_err(|_| LogError::SignatureInvalid)
    }

    /// Validates `new_root` against the currently trusted root and returns
    /// it as the next trusted root.
    ///
    /// A trusted size of zero is the bootstrap case: only the signature is
    /// checked. Shrinking logs fail with [`LogError::Rewind`]; same-size
    /// roots must match byte for byte.
    pub fn verify_root(
        &self,
        trusted: &SignedLogRoot,
        new_root: &SignedLogRoot,
        consistency: &[Vec<u8>],
    ) -> Result<SignedLogRoot, LogError> {
        if trusted.tree_size > 0 && new_root.tree_size < trusted.tree_size {
            return Err(LogError::Rewind {
                trusted: trusted.tree_size,
                observed: new_root.tree_size,
            });
        }
        self.verify_signature(new_root)?;
        if trusted.tree_size == 0 {
            return Ok(new_root.clone());
        }

        let old_root = root_bytes(trusted)?;
        let observed = root_bytes(new_root)?;
        if new_root.tree_size == trusted.tree_size {
            if old_root != observed || !consistency.is_empty() {
                return Err(LogError::ConsistencyInvalid);
            }
            return Ok(new_root.clone());
        }

        verify_consistency(trusted.tree_size, new_root.tree_size, old_root, observed, consistency)?;
        Ok(new_root.clone())
    }

    /// Verifies inclusion of `leaf` at `leaf_index` within `trusted`.
    pub fn verify_inclusion_at_index(
        &self,
        trusted: &SignedLogRoot,
        leaf: &[u8],
        leaf_index: u64,
        proof: &[Vec<u8>],
    ) -> Result<(), LogError> {
        if leaf_index >= trusted.tree_size {
            return Err(LogError::InclusionInvalid);
        }
        let expected = root_bytes(trusted)?;
        let mut hash = self.leaf_hash(leaf)?;

        let mut node = leaf_index;
        let mut last_node = trusted.tree_size - 1;
        let mut used = 0usize;
        while last_node > 0 {
            if node & 1 == 1 {
                let sibling = proof_element(proof, used).map_err(inclusion_err)?;
                used += 1;
                hash = node_hash(&sibling, &hash);
            } else if node < last_node {
                let sibling = proof_element(proof, used).map_err(inclusion_err)?;
                used += 1;
                hash = node_hash(&hash, &sibling);
            }
            node >>= 1;
            last_node >>= 1;
        }

        if used == proof.len() && hash == expected {
            Ok(())
        } else {
            Err(LogError::InclusionInvalid)
        }
    }
}

fn inclusion_err(err: LogError) -> LogError {
    match err {
        LogError::MalformedProof => LogError::MalformedProof,
        _ => LogError::InclusionInvalid,
    }
}

fn verify_consistency(
    old_size: u64,
    new_size: u64,
    old_root: [u8; 32],
    new_root: [u8; 32],
    proof: &[Vec<u8>],
) -> Result<(), LogError> {
    if old_size == 0 || old_size > new_size {
        return Err(LogError::ConsistencyInvalid);
    }
    if old_size == new_size {
        if proof.is_empty() && old_root == new_root {
            return Ok(());
        }
        return Err(LogError::ConsistencyInvalid);
    }
    if proof.is_empty() {
        return Err(LogError::ConsistencyInvalid);
    }

    let mut node = old_size - 1;
    let mut last_node = new_size - 1;
    while node & 1 == 1 {
        node >>= 1;
        last_node >>= 1;
    }

    let mut used = 0usize;
    let mut old_hash;
    let mut new_hash;
    if node > 0 {
        old_hash = proof_element(proof, used)?;
        used += 1;
    } else {
        old_hash = old_root;
    }
    new_hash = old_hash;

    while node > 0 {
        if node & 1 == 1 {
            let sibling = proof_element(proof, used)?;
            used += 1;
            old_hash = node_hash(&sibling, &old_hash);
            new_hash = node_hash(&sibling, &new_hash);
        } else if node < last_node {
            let sibling = proof_element(proof, used)?;
            used += 1;
            new_hash = node_hash(&new_hash, &sibling);
        }
        node >>= 1;
        last_node >>= 1;
    }

    while last_node > 0 {
        let sibling = proof_element(proof, used)?;
        used += 1;
        new_hash = node_hash(&new_hash, &sibling);
        last_node >>= 1;
    }

    if used == proof.len() && old_hash == old_root && new_hash == new_root {
        Ok(())
    } else {
        Err(LogError::ConsistencyInvalid)
    }
}
