//! Response verification for entry lookups.
//!
//! [`Verifier::verify_get_entry_response`] runs the fixed six-step check:
//! commitment opening, VRF, sparse map inclusion, map-root signature, log
//! consistency, and log inclusion of the map root. The caller owns the
//! trusted log root; it only advances after the whole response checks out,
//! so trust never regresses and a rejected response changes nothing.

use p256::ecdsa::VerifyingKey;
use thiserror::Error;
use tracing::debug;

use crate::api::{GetEntryResponse, SignedLogRoot};
use crate::crypto::commitment::{self, CommitmentError};
use crate::crypto::objecthash::to_canonical_json;
use crate::crypto::sign::{self, SignError};
use crate::crypto::vrf::{self, VrfError, VrfPublicKey};
use crate::merkle::log::{LogError, LogVerifier};
use crate::merkle::sparse::{self, SparseProofError};
use crate::mutator::entry;

/// Errors surfaced while verifying a lookup response. Verification
/// failures are fatal for the operation and leave the trusted root
/// untouched.
#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("response is missing {0}")]
    MissingField(&'static str),
    #[error("malformed leaf encoding")]
    Decode(#[from] prost::DecodeError),
    #[error(transparent)]
    Commitment(#[from] CommitmentError),
    #[error(transparent)]
    Vrf(#[from] VrfError),
    #[error(transparent)]
    Sparse(#[from] SparseProofError),
    #[error("signed map root signature rejected")]
    SmrSignature(#[source] SignError),
    #[error(transparent)]
    Log(#[from] LogError),
}

/// Client-side verifier for one directory.
pub struct Verifier {
    vrf: VrfPublicKey,
    map_public_key: VerifyingKey,
    log: LogVerifier,
    allow_unopened_entries: bool,
}

impl Verifier {
    #[must_use]
    pub fn new(vrf: VrfPublicKey, map_public_key: VerifyingKey, log: LogVerifier) -> Self {
        Self { vrf, map_public_key, log, allow_unopened_entries: false }
    }

    /// Permits responses that return a populated leaf without opening its
    /// commitment. Off by default: a present leaf must come with its
    /// committed data or the lookup is rejected.
    #[must_use]
    pub fn allow_unopened_entries(mut self, allow: bool) -> Self {
        self.allow_unopened_entries = allow;
        self
    }

    /// Derives the sparse map index for a user by verifying the VRF proof.
    pub fn index(
        &self,
        vrf_proof: &[u8],
        domain_id: &str,
        app_id: &str,
        user_id: &str,
    ) -> Result<[u8; 32], VerifyError> {
        let alpha = vrf::alpha(domain_id, app_id, user_id);
        Ok(self.vrf.proof_to_index(&alpha, vrf_proof)?)
    }

    /// Verifies a lookup response for `(domain_id, app_id, user_id)`.
    ///
    /// On success `trusted` is advanced to the response's log root.
    /// Callers sharing a trusted root must serialize their calls.
    pub fn verify_get_entry_response(
        &self,
        domain_id: &str,
        app_id: &str,
        user_id: &str,
        trusted: &mut SignedLogRoot,
        response: &GetEntryResponse,
    ) -> Result<(), VerifyError> {
        let leaf_proof = response.leaf_proof.as_ref().ok_or(VerifyError::MissingField("leaf_proof"))?;
        let leaf = entry::parse_leaf(&leaf_proof.leaf)?;

        // The committed data must open the leaf's commitment. A proof of
        // absence carries neither; anything in between is rejected unless
        // the client opted into opaque lookups.
        match (&response.committed, &leaf) {
            (Some(committed), Some(entry)) => {
                commitment::verify(
                    user_id,
                    app_id,
                    &entry.commitment,
                    &committed.data,
                    &committed.nonce,
                )?;
            }
            (Some(_), None) => return Err(CommitmentError::Mismatch.into()),
            (None, None) => {}
            (None, Some(entry)) => {
                if !self.allow_unopened_entries || entry.commitment.is_empty() {
                    return Err(CommitmentError::Mismatch.into());
                }
            }
        }
        debug!("commitment verified");

        let index = self.index(&response.vrf_proof, domain_id, app_id, user_id)?;
        debug!("vrf verified");

        let smr = response.smr.as_ref().ok_or(VerifyError::MissingField("smr"))?;
        sparse::verify_inclusion(
            smr.map_id,
            &index,
            &leaf_proof.leaf,
            &smr.root_hash,
            &leaf_proof.inclusion,
        )?;
        debug!("sparse map inclusion verified");

        let smr_signature = smr.signature.as_ref().ok_or(VerifyError::MissingField("smr.signature"))?;
        sign::verify_object(&self.map_public_key, &smr.canonical_value(true), smr_signature)
            .map_err(VerifyError::SmrSignature)?;
        debug!("map root signature verified");

        let log_root = response.log_root.as_ref().ok_or(VerifyError::MissingField("log_root"))?;
        let candidate = self.log.verify_root(trusted, log_root, &response.log_consistency)?;
        debug!(tree_size = candidate.tree_size, "log root consistent");

        let smr_leaf = to_canonical_json(&smr.canonical_value(false));
        self.log
            .verify_inclusion_at_index(&candidate, &smr_leaf, smr.map_revision, &response.log_inclusion)?;
        debug!(revision = smr.map_revision, "map root included in log");

        // Commit the new trust anchor only once every step has passed.
        *trusted = candidate;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::SignedMapRoot;
    use crate::testutil::FakeDirectory;

    const DOMAIN: &str = "example.com";
    const APP: &str = "app";

    fn rejected_root_is_unchanged(trusted: &SignedLogRoot, before: &SignedLogRoot) {
        assert_eq!(trusted, before);
    }

    #[test]
    fn proof_of_absence_verifies_with_a_bootstrap_root() {
        let directory = FakeDirectory::new(DOMAIN);
        let verifier = directory.verifier();
        let response = directory.get_entry_response(APP, "alice", 0);
        assert!(response.committed.is_none());
        assert!(response.leaf_proof.as_ref().expect("leaf proof").leaf.is_empty());

        let mut trusted = SignedLogRoot::default();
        verifier
            .verify_get_entry_response(DOMAIN, APP, "alice", &mut trusted, &response)
            .expect("absence proof verifies");
        assert_eq!(trusted.tree_size, directory.log_size());
    }

    #[test]
    fn present_entry_round_trips_the_profile() {
        let mut directory = FakeDirectory::new(DOMAIN);
        let profile = vec![0xDE, 0xAD, 0xBE, 0xEF];
        directory.publish_profile(APP, "alice", &profile, 1);
        let verifier = directory.verifier();

        let response = directory.get_entry_response(APP, "alice", 0);
        let mut trusted = SignedLogRoot::default();
        verifier
            .verify_get_entry_response(DOMAIN, APP, "alice", &mut trusted, &response)
            .expect("present entry verifies");
        assert_eq!(
            response.committed.expect("profile data returned").data,
            profile
        );
    }

    #[test]
    fn tampered_commitment_data_is_rejected() {
        let mut directory = FakeDirectory::new(DOMAIN);
        directory.publish_profile(APP, "alice", &[0xDE, 0xAD, 0xBE, 0xEF], 1);
        let verifier = directory.verifier();

        let mut response = directory.get_entry_response(APP, "alice", 0);
        response.committed.as_mut().expect("committed present").data[0] ^= 1;

        let mut trusted = SignedLogRoot::default();
        let before = trusted.clone();
        let err = verifier
            .verify_get_entry_response(DOMAIN, APP, "alice", &mut trusted, &response)
            .expect_err("tampered data must fail");
        assert!(matches!(err, VerifyError::Commitment(CommitmentError::Mismatch)));
        rejected_root_is_unchanged(&trusted, &before);
    }

    #[test]
    fn tampered_sparse_proof_is_rejected() {
        let mut directory = FakeDirectory::new(DOMAIN);
        directory.publish_profile(APP, "alice", &[0xDE, 0xAD, 0xBE, 0xEF], 1);
        // A second entry populates at least one sibling on alice's path.
        directory.publish_profile(APP, "bob", &[0x01], 2);
        let verifier = directory.verifier();

        let mut response = directory.get_entry_response(APP, "alice", 0);
        let inclusion = &mut response.leaf_proof.as_mut().expect("leaf proof").inclusion;
        let level = inclusion
            .iter()
            .rposition(|slot| !slot.is_empty())
            .expect("populated sibling");
        inclusion[level][0] ^= 1;

        let mut trusted = SignedLogRoot::default();
        let before = trusted.clone();
        let err = verifier
            .verify_get_entry_response(DOMAIN, APP, "alice", &mut trusted, &response)
            .expect_err("tampered proof must fail");
        assert!(matches!(err, VerifyError::Sparse(SparseProofError::RootMismatch)));
        rejected_root_is_unchanged(&trusted, &before);
    }

    #[test]
    fn forked_log_is_rejected_on_the_second_lookup() {
        let mut directory = FakeDirectory::new(DOMAIN);
        directory.publish_profile(APP, "alice", &[1, 2, 3], 1);
        let verifier = directory.verifier();

        let mut trusted = SignedLogRoot::default();
        let response = directory.get_entry_response(APP, "alice", 0);
        verifier
            .verify_get_entry_response(DOMAIN, APP, "alice", &mut trusted, &response)
            .expect("honest response verifies");

        // Same tree size, different root hash: a fork of the log.
        let mut forked = directory.get_entry_response(APP, "alice", trusted.tree_size);
        let log_root = forked.log_root.as_mut().expect("log root present");
        log_root.root_hash[0] ^= 1;
        directory.resign_log_root(log_root);

        let before = trusted.clone();
        let err = verifier
            .verify_get_entry_response(DOMAIN, APP, "alice", &mut trusted, &forked)
            .expect_err("forked log must fail");
        assert!(matches!(err, VerifyError::Log(LogError::ConsistencyInvalid)));
        rejected_root_is_unchanged(&trusted, &before);
    }

    #[test]
    fn unopened_present_leaf_is_rejected_by_default() {
        let mut directory = FakeDirectory::new(DOMAIN);
        directory.publish_profile(APP, "alice", &[1, 2, 3], 1);
        let verifier = directory.verifier();

        let mut response = directory.get_entry_response(APP, "alice", 0);
        response.committed = None;

        let mut trusted = SignedLogRoot::default();
        let err = verifier
            .verify_get_entry_response(DOMAIN, APP, "alice", &mut trusted, &response)
            .expect_err("unopened entry must fail");
        assert!(matches!(err, VerifyError::Commitment(CommitmentError::Mismatch)));

        // The opt-in accepts the same response.
        let opaque = directory.verifier().allow_unopened_entries(true);
        opaque
            .verify_get_entry_response(DOMAIN, APP, "alice", &mut trusted, &response)
            .expect("opaque lookup verifies when opted in");
    }

    #[test]
    fn forged_map_root_signature_is_rejected() {
        let mut directory = FakeDirectory::new(DOMAIN);
        directory.publish_profile(APP, "alice", &[1, 2, 3], 1);
        let verifier = directory.verifier();

        let mut response = directory.get_entry_response(APP, "alice", 0);
        let smr: &mut SignedMapRoot = response.smr.as_mut().expect("smr present");
        smr.timestamp_nanos += 1;

        let mut trusted = SignedLogRoot::default();
        let err = verifier
            .verify_get_entry_response(DOMAIN, APP, "alice", &mut trusted, &response)
            .expect_err("edited map root must fail");
        assert!(matches!(err, VerifyError::SmrSignature(_)));
    }
}
