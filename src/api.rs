//! Wire messages exchanged with the key transparency service.
//!
//! The transport is out of scope; these types carry the semantic fields the
//! verifier, mutator, and monitor operate on. Encoding is length-delimited
//! binary via prost. Entry signatures live in an ordered map so the encoded
//! form is deterministic, and an all-defaults [`Entry`] encodes to zero
//! bytes, which is the canonical empty leaf.

use std::collections::BTreeMap;

use crate::crypto::objecthash::Value;

/// Algorithm tag for ECDSA over NIST P-256 with SHA-256 digests.
pub const ALGORITHM_ECDSA_P256: i32 = 1;

/// Public key authorized to sign mutations of an entry.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PublicKey {
    /// Opaque identifier the signature map is keyed by.
    #[prost(string, tag = "1")]
    pub key_id: String,
    #[prost(int32, tag = "2")]
    pub algorithm: i32,
    /// SEC1-encoded point material.
    #[prost(bytes = "vec", tag = "3")]
    pub material: Vec<u8>,
}

/// A digital signature together with its algorithm tag.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DigitallySigned {
    #[prost(int32, tag = "1")]
    pub algorithm: i32,
    /// DER-encoded signature bytes.
    #[prost(bytes = "vec", tag = "2")]
    pub signature: Vec<u8>,
}

/// The unit of per-user state stored in the sparse map.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Entry {
    /// 32-byte sparse map position derived from the VRF.
    #[prost(bytes = "vec", tag = "1")]
    pub index: Vec<u8>,
    /// Hiding commitment to the profile data.
    #[prost(bytes = "vec", tag = "2")]
    pub commitment: Vec<u8>,
    /// Keys permitted to sign the next mutation of this entry.
    #[prost(message, repeated, tag = "3")]
    pub authorized_keys: Vec<PublicKey>,
    /// Object hash of the prior entry, chaining revisions together.
    #[prost(bytes = "vec", tag = "4")]
    pub previous: Vec<u8>,
    /// Signatures over this entry with the signatures field cleared,
    /// keyed by key id.
    #[prost(btree_map = "string, message", tag = "5")]
    pub signatures: BTreeMap<String, DigitallySigned>,
}

/// An opened commitment: the nonce and the committed profile data.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Committed {
    #[prost(bytes = "vec", tag = "1")]
    pub nonce: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub data: Vec<u8>,
}

/// A sparse map leaf together with its inclusion path.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MapLeafInclusion {
    /// Serialized [`Entry`]; empty bytes denote the empty leaf.
    #[prost(bytes = "vec", tag = "1")]
    pub leaf: Vec<u8>,
    /// One sibling slot per tree level ordered leaf to root; a zero-length
    /// slot stands for the empty subtree at that level.
    #[prost(bytes = "vec", repeated, tag = "2")]
    pub inclusion: Vec<Vec<u8>>,
}

/// Signed snapshot of the sparse map at one revision.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SignedMapRoot {
    #[prost(int64, tag = "1")]
    pub map_id: i64,
    #[prost(uint64, tag = "2")]
    pub map_revision: u64,
    #[prost(bytes = "vec", tag = "3")]
    pub root_hash: Vec<u8>,
    #[prost(int64, tag = "4")]
    pub timestamp_nanos: i64,
    #[prost(bytes = "vec", tag = "5")]
    pub metadata: Vec<u8>,
    #[prost(message, optional, tag = "6")]
    pub signature: Option<DigitallySigned>,
}

/// Signed root of the append-only log holding serialized map roots.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SignedLogRoot {
    #[prost(int64, tag = "1")]
    pub log_id: i64,
    #[prost(uint64, tag = "2")]
    pub tree_size: u64,
    #[prost(bytes = "vec", tag = "3")]
    pub root_hash: Vec<u8>,
    #[prost(int64, tag = "4")]
    pub timestamp_nanos: i64,
    #[prost(message, optional, tag = "5")]
    pub signature: Option<DigitallySigned>,
}

/// Lookup request for one user's entry.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetEntryRequest {
    #[prost(string, tag = "1")]
    pub domain_id: String,
    #[prost(string, tag = "2")]
    pub app_id: String,
    #[prost(string, tag = "3")]
    pub user_id: String,
    /// Size of the log root the client currently trusts; the server
    /// proves consistency from here.
    #[prost(uint64, tag = "4")]
    pub first_tree_size: u64,
}

/// Lookup response bundling every proof the verifier consumes.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetEntryResponse {
    #[prost(bytes = "vec", tag = "1")]
    pub vrf_proof: Vec<u8>,
    /// Absent for proofs of absence and for opaque lookups.
    #[prost(message, optional, tag = "2")]
    pub committed: Option<Committed>,
    #[prost(message, optional, tag = "3")]
    pub leaf_proof: Option<MapLeafInclusion>,
    #[prost(message, optional, tag = "4")]
    pub smr: Option<SignedMapRoot>,
    #[prost(message, optional, tag = "5")]
    pub log_root: Option<SignedLogRoot>,
    #[prost(bytes = "vec", repeated, tag = "6")]
    pub log_consistency: Vec<Vec<u8>>,
    #[prost(bytes = "vec", repeated, tag = "7")]
    pub log_inclusion: Vec<Vec<u8>>,
}

/// A signed mutation together with its opened commitment.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EntryUpdate {
    #[prost(message, optional, tag = "1")]
    pub mutation: Option<Entry>,
    #[prost(message, optional, tag = "2")]
    pub committed: Option<Committed>,
}

/// Submission of a mutation for one user.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UpdateEntryRequest {
    #[prost(string, tag = "1")]
    pub domain_id: String,
    #[prost(string, tag = "2")]
    pub app_id: String,
    #[prost(string, tag = "3")]
    pub user_id: String,
    #[prost(uint64, tag = "4")]
    pub first_tree_size: u64,
    #[prost(message, optional, tag = "5")]
    pub entry_update: Option<EntryUpdate>,
}

/// Server echo for an update: the current proof for the mutated user.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UpdateEntryResponse {
    #[prost(message, optional, tag = "1")]
    pub proof: Option<GetEntryResponse>,
}

/// Paged request for a user's entry history.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ListEntryHistoryRequest {
    #[prost(string, tag = "1")]
    pub domain_id: String,
    #[prost(string, tag = "2")]
    pub user_id: String,
    #[prost(string, tag = "3")]
    pub app_id: String,
    #[prost(uint64, tag = "4")]
    pub start: u64,
    #[prost(int32, tag = "5")]
    pub page_size: i32,
    #[prost(uint64, tag = "6")]
    pub first_tree_size: u64,
}

/// One page of verified-entry history.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ListEntryHistoryResponse {
    #[prost(message, repeated, tag = "1")]
    pub values: Vec<GetEntryResponse>,
    /// Next epoch to request, or zero when the listing is exhausted.
    #[prost(uint64, tag = "2")]
    pub next_start: u64,
}

/// A map revision: its signed root, the log proofs anchoring it, and the
/// mutations that produced it.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Epoch {
    #[prost(message, optional, tag = "1")]
    pub smr: Option<SignedMapRoot>,
    #[prost(message, optional, tag = "2")]
    pub log_root: Option<SignedLogRoot>,
    #[prost(bytes = "vec", repeated, tag = "3")]
    pub log_consistency: Vec<Vec<u8>>,
    #[prost(bytes = "vec", repeated, tag = "4")]
    pub log_inclusion: Vec<Vec<u8>>,
    #[prost(message, repeated, tag = "5")]
    pub mutations: Vec<MutationProof>,
}

/// A mutation plus the sparse-tree proof of its prior leaf.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MutationProof {
    #[prost(message, optional, tag = "1")]
    pub mutation: Option<Entry>,
    /// Inclusion of the pre-mutation leaf at the previous revision.
    #[prost(message, optional, tag = "2")]
    pub leaf_proof: Option<MapLeafInclusion>,
}

impl PublicKey {
    pub(crate) fn canonical_value(&self) -> Value {
        let mut map = BTreeMap::new();
        map.insert("algorithm".to_string(), Value::Int(i64::from(self.algorithm)));
        map.insert("key_id".to_string(), Value::Str(self.key_id.clone()));
        map.insert("material".to_string(), Value::base64_bytes(&self.material));
        Value::Map(map)
    }
}

impl DigitallySigned {
    pub(crate) fn canonical_value(&self) -> Value {
        let mut map = BTreeMap::new();
        map.insert("algorithm".to_string(), Value::Int(i64::from(self.algorithm)));
        map.insert("signature".to_string(), Value::base64_bytes(&self.signature));
        Value::Map(map)
    }
}

impl Entry {
    /// Lowers the entry to its canonical object form. Zero-valued fields
    /// are omitted so the digest of a default entry never depends on
    /// which fields were touched. `clear_signatures` drops the signature
    /// map, which is the form every signature covers.
    #[must_use]
    pub fn canonical_value(&self, clear_signatures: bool) -> Value {
        let mut map = BTreeMap::new();
        if !self.index.is_empty() {
            map.insert("index".to_string(), Value::base64_bytes(&self.index));
        }
        if !self.commitment.is_empty() {
            map.insert("commitment".to_string(), Value::base64_bytes(&self.commitment));
        }
        if !self.authorized_keys.is_empty() {
            map.insert(
                "authorized_keys".to_string(),
                Value::List(self.authorized_keys.iter().map(PublicKey::canonical_value).collect()),
            );
        }
        if !self.previous.is_empty() {
            map.insert("previous".to_string(), Value::base64_bytes(&self.previous));
        }
        if !clear_signatures && !self.signatures.is_empty() {
            let sigs = self
                .signatures
                .iter()
                .map(|(key_id, sig)| (key_id.clone(), sig.canonical_value()))
                .collect();
            map.insert("signatures".to_string(), Value::Map(sigs));
        }
        Value::Map(map)
    }
}

impl SignedMapRoot {
    /// Lowers the map root to its canonical object form; `clear_signature`
    /// yields the form the map key signed.
    #[must_use]
    pub fn canonical_value(&self, clear_signature: bool) -> Value {
        let mut map = BTreeMap::new();
        map.insert("map_id".to_string(), Value::Int(self.map_id));
        map.insert("map_revision".to_string(), Value::Int(self.map_revision as i64));
        map.insert("root_hash".to_string(), Value::base64_bytes(&self.root_hash));
        map.insert("timestamp_nanos".to_string(), Value::Int(self.timestamp_nanos));
        if !self.metadata.is_empty() {
            map.insert("metadata".to_string(), Value::base64_bytes(&self.metadata));
        }
        if !clear_signature {
            if let Some(signature) = &self.signature {
                map.insert("signature".to_string(), signature.canonical_value());
            }
        }
        Value::Map(map)
    }
}

impl SignedLogRoot {
    /// Lowers the log root to the canonical form its signature covers.
    #[must_use]
    pub fn canonical_value(&self, clear_signature: bool) -> Value {
        let mut map = BTreeMap::new();
        map.insert("log_id".to_string(), Value::Int(self.log_id));
        map.insert("tree_size".to_string(), Value::Int(self.tree_size as i64));
        map.insert("root_hash".to_string(), Value::base64_bytes(&self.root_hash));
        map.insert("timestamp_nanos".to_string(), Value::Int(self.timestamp_nanos));
        if !clear_signature {
            if let Some(signature) = &self.signature {
                map.insert("signature".to_string(), signature.canonical_value());
            }
        }
        Value::Map(map)
    }
}
