//! Sparse Merkle map verification in the CONIKS construction.
//!
//! The map has a fixed depth of 256 with one leaf slot per possible index.
//! Empty subtrees have a fixed hash per level, so an inclusion proof only
//! carries the sibling hashes that differ from the empty table; absent
//! slots are zero-length. Hashing is SHA-512/256 with single-byte domain
//! separation for leaf, empty, and interior nodes.

use std::collections::HashMap;
use std::sync::OnceLock;

use sha2::{Digest, Sha512_256};
use thiserror::Error;

/// Depth of the sparse map; one level per index bit.
pub const TREE_DEPTH: usize = 256;
/// Length of a map index in bytes.
pub const INDEX_LEN: usize = 32;

const LEAF_TAG: u8 = b'L';
const EMPTY_TAG: u8 = b'E';
const INTERIOR_TAG: u8 = b'I';

/// Interior node hashes harvested from inclusion proofs, keyed by
/// `(depth, masked index prefix)`.
pub type ProofNodes = HashMap<(usize, [u8; INDEX_LEN]), [u8; 32]>;

/// Errors surfaced while checking sparse map proofs.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SparseProofError {
    #[error("map index must be {INDEX_LEN} bytes")]
    IndexLength,
    #[error("inclusion proof must carry {TREE_DEPTH} sibling slots, got {0}")]
    ProofLength(usize),
    #[error("sibling hash at level {0} is malformed")]
    MalformedSibling(usize),
    #[error("expected root hash must be 32 bytes")]
    MalformedRoot,
    #[error("computed sparse root does not match the expected root")]
    RootMismatch,
    #[error("inclusion proofs disagree about a shared interior node")]
    InconsistentNodes,
    #[error("duplicate map index in leaf set")]
    DuplicateIndex,
}

/// Hashes a populated leaf at `index`.
#[must_use]
pub fn hash_leaf(map_id: i64, index: &[u8; INDEX_LEN], leaf: &[u8]) -> [u8; 32] {
    let mut hasher = Sha512_256::new();
    hasher.update([LEAF_TAG]);
    hasher.update(map_id.to_be_bytes());
    hasher.update(index);
    hasher.update(leaf);
    hasher.finalize().into()
}

/// Hashes an interior node from its two children.
#[must_use]
pub fn hash_children(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha512_256::new();
    hasher.update([INTERIOR_TAG]);
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

/// The fixed hash of an empty subtree rooted at each depth; index
/// `TREE_DEPTH` is the empty leaf.
pub fn empty_hashes() -> &'static [[u8; 32]; TREE_DEPTH + 1] {
    static TABLE: OnceLock<[[u8; 32]; TREE_DEPTH + 1]> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut table = [[0u8; 32]; TREE_DEPTH + 1];
        table[TREE_DEPTH] = Sha512_256::digest([EMPTY_TAG]).into();
        for depth in (0..TREE_DEPTH).rev() {
            table[depth] = hash_children(&table[depth + 1], &table[depth + 1]);
        }
        table
    })
}

/// Root hash of a map holding nothing.
#[must_use]
pub fn empty_root() -> [u8; 32] {
    empty_hashes()[0]
}

fn bit(index: &[u8; INDEX_LEN], position: usize) -> u8 {
    (index[position / 8] >> (7 - position % 8)) & 1
}

fn set_bit(index: &mut [u8; INDEX_LEN], position: usize) {
    index[position / 8] |= 1 << (7 - position % 8);
}

fn mask_index(index: &[u8; INDEX_LEN], depth: usize) -> [u8; INDEX_LEN] {
    let mut masked = [0u8; INDEX_LEN];
    let full_bytes = depth / 8;
    masked[..full_bytes].copy_from_slice(&index[..full_bytes]);
    let rest = depth % 8;
    if rest > 0 {
        masked[full_bytes] = index[full_bytes] & (0xFFu8 << (8 - rest));
    }
    masked
}

fn leaf_or_empty_hash(map_id: i64, index: &[u8; INDEX_LEN], leaf: &[u8]) -> [u8; 32] {
    if leaf.is_empty() {
        empty_hashes()[TREE_DEPTH]
    } else {
        hash_leaf(map_id, index, leaf)
    }
}

/// Verifies that `leaf` sits at `index` under `expected_root`.
///
/// `siblings` carries one slot per level ordered leaf to root; empty slots
/// are replaced by the per-level empty-subtree hash. An empty `leaf` is a
/// proof of absence and verifies through the same walk.
pub fn verify_inclusion(
    map_id: i64,
    index: &[u8],
    leaf: &[u8],
    expected_root: &[u8],
    siblings: &[Vec<u8>],
) -> Result<(), SparseProofError> {
    let index: &[u8; INDEX_LEN] = index.try_into().map_err(|_| SparseProofError::IndexLength)?;
    let expected: [u8; 32] = expected_root
        .try_into()
        .map_err(|_| SparseProofError::MalformedRoot)?;
    if siblings.len() != TREE_DEPTH {
        return Err(SparseProofError::ProofLength(siblings.len()));
    }

    let empties = empty_hashes();
    let mut running = leaf_or_empty_hash(map_id, index, leaf);
    for (level, slot) in siblings.iter().enumerate() {
        let depth = TREE_DEPTH - level;
        let sibling: [u8; 32] = if slot.is_empty() {
            empties[depth]
        } else {
            slot.as_slice()
                .try_into()
                .map_err(|_| SparseProofError::MalformedSibling(level))?
        };
        running = if bit(index, depth - 1) == 0 {
            hash_children(&running, &sibling)
        } else {
            hash_children(&sibling, &running)
        };
    }

    if running == expected {
        Ok(())
    } else {
        Err(SparseProofError::RootMismatch)
    }
}

/// Records the interior nodes an inclusion proof pins down, so a set of
/// proofs can later anchor a whole-map root recomputation. Two proofs
/// that disagree about a shared node fail here.
pub fn collect_proof_nodes(
    index: &[u8; INDEX_LEN],
    siblings: &[Vec<u8>],
    nodes: &mut ProofNodes,
) -> Result<(), SparseProofError> {
    if siblings.len() != TREE_DEPTH {
        return Err(SparseProofError::ProofLength(siblings.len()));
    }
    for (level, slot) in siblings.iter().enumerate() {
        if slot.is_empty() {
            continue;
        }
        let depth = TREE_DEPTH - level;
        let hash: [u8; 32] = slot
            .as_slice()
            .try_into()
            .map_err(|_| SparseProofError::MalformedSibling(level))?;
        let mut prefix = mask_index(index, depth);
        if bit(index, depth - 1) == 0 {
            set_bit(&mut prefix, depth - 1);
        } else {
            prefix[(depth - 1) / 8] &= !(1 << (7 - (depth - 1) % 8));
        }
        match nodes.insert((depth, prefix), hash) {
            Some(existing) if existing != hash => return Err(SparseProofError::InconsistentNodes),
            _ => {}
        }
    }
    Ok(())
}

/// Recomputes the map root from a set of leaves plus the interior nodes
/// pinned down by their prior inclusion proofs. Subtrees containing no
/// given leaf fall back to a pinned node, or to the empty table.
pub fn compute_root(
    map_id: i64,
    mut leaves: Vec<([u8; INDEX_LEN], Vec<u8>)>,
    nodes: &ProofNodes,
) -> Result<[u8; 32], SparseProofError> {
    leaves.sort_unstable_by(|(a, _), (b, _)| a.cmp(b));
    if leaves.windows(2).any(|pair| pair[0].0 == pair[1].0) {
        return Err(SparseProofError::DuplicateIndex);
    }
    Ok(subtree_root(map_id, 0, [0u8; INDEX_LEN], &leaves, nodes))
}

fn subtree_root(
    map_id: i64,
    depth: usize,
    prefix: [u8; INDEX_LEN],
    leaves: &[([u8; INDEX_LEN], Vec<u8>)],
    nodes: &ProofNodes,
) -> [u8; 32] {
    let empties = empty_hashes();
    if leaves.is_empty() {
        return nodes.get(&(depth, prefix)).copied().unwrap_or(empties[depth]);
    }
    if depth == TREE_DEPTH {
        let (index, value) = &leaves[0];
        return leaf_or_empty_hash(map_id, index, value);
    }
    let split = leaves.partition_point(|(index, _)| bit(index, depth) == 0);
    let left = subtree_root(map_id, depth + 1, prefix, &leaves[..split], nodes);
    let mut right_prefix = prefix;
    set_bit(&mut right_prefix, depth);
    let right = subtree_root(map_id, depth + 1, right_prefix, &leaves[split..], nodes);
    hash_children(&left, &right)
}

/// Test-only prover: builds the inclusion proof for `index` in a map
/// holding exactly `leaves`.
#[cfg(test)]
pub(crate) fn prove(
    map_id: i64,
    leaves: &[([u8; INDEX_LEN], Vec<u8>)],
    index: &[u8; INDEX_LEN],
) -> Vec<Vec<u8>> {
    let mut sorted = leaves.to_vec();
    sorted.sort_unstable_by(|(a, _), (b, _)| a.cmp(b));
    let empties = empty_hashes();
    let none = ProofNodes::new();

    let mut siblings = vec![Vec::new(); TREE_DEPTH];
    for (level, slot) in siblings.iter_mut().enumerate() {
        let depth = TREE_DEPTH - level;
        let mut prefix = mask_index(index, depth);
        prefix[(depth - 1) / 8] ^= 1 << (7 - (depth - 1) % 8);
        let subtree: Vec<_> = sorted
            .iter()
            .filter(|(leaf_index, _)| mask_index(leaf_index, depth) == prefix)
            .cloned()
            .collect();
        let hash = subtree_root(map_id, depth, prefix, &subtree, &none);
        if hash != empties[depth] {
            *slot = hash.to_vec();
        }
    }
    siblings
}
