//! Client-side construction of signed entry updates.

use std::collections::BTreeMap;

use crate::api::{Committed, Entry, EntryUpdate, PublicKey, UpdateEntryRequest};
use crate::crypto::commitment;
use crate::crypto::sign::ObjectSigner;
use crate::mutator::{entry, mutate, verify_authorization, MutateError};

/// An in-flight update to one entry.
///
/// A builder is scoped to a single update attempt: seed it with
/// [`Mutation::new`], chain it to the current leaf with `set_previous`,
/// change the value with `set_commitment` and `replace_authorized_keys`,
/// and finalize with `serialize_and_sign`. Not safe for concurrent use.
#[derive(Debug)]
pub struct Mutation {
    domain_id: String,
    app_id: String,
    user_id: String,
    data: Vec<u8>,
    nonce: Vec<u8>,
    prev_entry: Option<Entry>,
    entry: Entry,
}

impl Mutation {
    /// Starts a mutation for the user at `index`. The next entry chains
    /// to the empty value until `set_previous` observes a real leaf.
    #[must_use]
    pub fn new(index: &[u8], domain_id: &str, app_id: &str, user_id: &str) -> Self {
        Self {
            domain_id: domain_id.to_string(),
            app_id: app_id.to_string(),
            user_id: user_id.to_string(),
            data: Vec::new(),
            nonce: Vec::new(),
            prev_entry: None,
            entry: Entry {
                index: index.to_vec(),
                previous: entry::entry_hash(None).to_vec(),
                ..Default::default()
            },
        }
    }

    /// Chains the next entry to `old_leaf`, the current leaf bytes.
    ///
    /// With `copy_previous` the authorized keys and commitment are carried
    /// over as well; the submission retry loop uses this to keep a stable
    /// request after the server echoes an intermediate state.
    pub fn set_previous(&mut self, old_leaf: &[u8], copy_previous: bool) -> Result<(), MutateError> {
        let prev_entry = entry::parse_leaf(old_leaf)?;
        self.entry.previous = entry::entry_hash(prev_entry.as_ref()).to_vec();
        if copy_previous {
            if let Some(prev) = &prev_entry {
                self.entry.authorized_keys = prev.authorized_keys.clone();
                self.entry.commitment = prev.commitment.clone();
            }
        }
        self.prev_entry = prev_entry;
        Ok(())
    }

    /// Commits the entry to `data` under a fresh nonce.
    pub fn set_commitment(&mut self, data: &[u8]) {
        let nonce = commitment::generate_nonce();
        self.data = data.to_vec();
        self.nonce = nonce.to_vec();
        self.entry.commitment =
            commitment::commit(&self.user_id, &self.app_id, data, &nonce).to_vec();
    }

    /// Replaces the keys authorized to sign the *next* mutation.
    pub fn replace_authorized_keys(&mut self, pubkeys: &[PublicKey]) -> Result<(), MutateError> {
        if pubkeys.is_empty() {
            return Err(MutateError::MissingKey);
        }
        self.entry.authorized_keys = pubkeys.to_vec();
        Ok(())
    }

    /// Signs the entry with each signer, checks the result against the
    /// previous entry's authorization rules, dry-runs the applier, and
    /// emits the submission request.
    pub fn serialize_and_sign(
        &mut self,
        signers: &[ObjectSigner],
        trusted_tree_size: u64,
    ) -> Result<UpdateEntryRequest, MutateError> {
        self.sign(signers)?;
        verify_authorization(self.prev_entry.as_ref(), &self.entry)?;
        // Reject locally anything the server-side applier would drop.
        mutate(self.prev_entry.as_ref(), &self.entry)?;

        Ok(UpdateEntryRequest {
            domain_id: self.domain_id.clone(),
            app_id: self.app_id.clone(),
            user_id: self.user_id.clone(),
            first_tree_size: trusted_tree_size,
            entry_update: Some(EntryUpdate {
                mutation: Some(self.entry.clone()),
                committed: Some(Committed { nonce: self.nonce.clone(), data: self.data.clone() }),
            }),
        })
    }

    fn sign(&mut self, signers: &[ObjectSigner]) -> Result<(), MutateError> {
        self.entry.signatures.clear();
        let signed_value = self.entry.canonical_value(true);
        let mut signatures = BTreeMap::new();
        for signer in signers {
            let signature = signer.sign(&signed_value)?;
            if signatures.insert(signer.key_id().to_string(), signature).is_some() {
                return Err(MutateError::DuplicateSignature(signer.key_id().to_string()));
            }
        }
        self.entry.signatures = signatures;
        Ok(())
    }

    /// Whether `leaf` already equals the mutation being requested; the
    /// update loop retries until the server echo matches.
    pub fn matches_requested(&self, leaf: &[u8]) -> Result<bool, MutateError> {
        Ok(entry::parse_leaf(leaf)?.as_ref() == Some(&self.entry))
    }

    /// Whether `leaf` equals the entry this mutation was chained to.
    pub fn matches_previous(&self, leaf: &[u8]) -> Result<bool, MutateError> {
        Ok(entry::parse_leaf(leaf)? == self.prev_entry)
    }
}
