//! In-memory fake directory used by the verifier, client, and monitor
//! tests. It maintains a real sparse map and append-only log, signs map
//! and log roots with fixed test keys, and serves fully-proven responses.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use prost::Message;

use crate::api::{
    Committed, Epoch, GetEntryResponse, ListEntryHistoryRequest, ListEntryHistoryResponse,
    MapLeafInclusion, MutationProof, SignedLogRoot, SignedMapRoot, UpdateEntryRequest,
    UpdateEntryResponse,
};
use crate::client::{KtService, ServiceError};
use crate::config::{DirectoryConfig, MapHashStrategy, TrustAnchors};
use crate::crypto::objecthash::to_canonical_json;
use crate::crypto::sign::{test_signer, ObjectSigner};
use crate::crypto::vrf::{self, test_secret_key, VrfSecretKey};
use crate::merkle::log::testsupport::TestLog;
use crate::merkle::log::LogHashStrategy;
use crate::merkle::sparse::{self, ProofNodes, INDEX_LEN};
use crate::mutator::{self, entry, Mutation};
use crate::verify::Verifier;

const MAP_ID: i64 = 21;
const LOG_ID: i64 = 22;

struct Revision {
    leaves: Vec<([u8; INDEX_LEN], Vec<u8>)>,
    committed: HashMap<[u8; INDEX_LEN], Committed>,
    smr: SignedMapRoot,
    mutations: Vec<MutationProof>,
}

pub(crate) struct FakeDirectory {
    domain_id: String,
    vrf_sk: VrfSecretKey,
    map_signer: ObjectSigner,
    log_signer: ObjectSigner,
    log: TestLog,
    revisions: Vec<Revision>,
}

impl FakeDirectory {
    pub(crate) fn new(domain_id: &str) -> Self {
        let mut directory = Self {
            domain_id: domain_id.to_string(),
            vrf_sk: test_secret_key(101),
            map_signer: test_signer(102),
            log_signer: test_signer(103),
            log: TestLog::new(LogHashStrategy::ObjectRfc6962Sha256),
            revisions: Vec::new(),
        };
        // Revision zero: the empty map.
        directory.seal_revision(Vec::new(), HashMap::new(), Vec::new());
        directory
    }

    pub(crate) fn config(&self) -> DirectoryConfig {
        DirectoryConfig {
            version: 1,
            domain_id: self.domain_id.clone(),
            vrf_public_key: hex::encode(self.vrf_sk.public_key().to_sec1_bytes()),
            map_public_key: hex::encode(
                self.map_signer.verifying_key().to_encoded_point(true).as_bytes(),
            ),
            log_public_key: hex::encode(
                self.log_signer.verifying_key().to_encoded_point(true).as_bytes(),
            ),
            map_hash_strategy: MapHashStrategy::ConiksSha512_256,
            log_hash_strategy: LogHashStrategy::ObjectRfc6962Sha256,
            retry_count: 2,
            retry_delay_ms: 0,
            page_size: 16,
            allow_unopened_entries: false,
        }
    }

    pub(crate) fn anchors(&self) -> TrustAnchors {
        self.config().trust_anchors().expect("test config is valid")
    }

    pub(crate) fn verifier(&self) -> Verifier {
        self.anchors().verifier()
    }

    pub(crate) fn log_size(&self) -> u64 {
        self.log.size()
    }

    pub(crate) fn latest_revision(&self) -> u64 {
        (self.revisions.len() - 1) as u64
    }

    fn current(&self) -> &Revision {
        self.revisions.last().expect("revision zero always exists")
    }

    pub(crate) fn index_for(&self, app_id: &str, user_id: &str) -> ([u8; INDEX_LEN], Vec<u8>) {
        let alpha = vrf::alpha(&self.domain_id, app_id, user_id);
        self.vrf_sk.evaluate(&alpha).expect("vrf evaluation succeeds")
    }

    fn seal_revision(
        &mut self,
        leaves: Vec<([u8; INDEX_LEN], Vec<u8>)>,
        committed: HashMap<[u8; INDEX_LEN], Committed>,
        mutations: Vec<MutationProof>,
    ) {
        let root = sparse::compute_root(MAP_ID, leaves.clone(), &ProofNodes::new())
            .expect("map root computes");
        let revision = self.revisions.len() as u64;
        let mut smr = SignedMapRoot {
            map_id: MAP_ID,
            map_revision: revision,
            root_hash: root.to_vec(),
            timestamp_nanos: 1_700_000_000_000 + revision as i64,
            metadata: Vec::new(),
            signature: None,
        };
        let signature = self
            .map_signer
            .sign(&smr.canonical_value(true))
            .expect("map root signs");
        smr.signature = Some(signature);

        self.log.append(to_canonical_json(&smr.canonical_value(false)));
        self.revisions.push(Revision { leaves, committed, smr, mutations });
    }

    /// Applies a signed update request the way the server's mutator would
    /// and seals the resulting revision.
    pub(crate) fn apply_update(&mut self, request: &UpdateEntryRequest) {
        let update = request.entry_update.as_ref().expect("entry update present");
        let mutation = update.mutation.as_ref().expect("mutation present");
        let committed = update.committed.as_ref().expect("committed present");
        let index: [u8; INDEX_LEN] =
            mutation.index.as_slice().try_into().expect("32-byte index");

        let current = self.current();
        let old_leaf = current
            .leaves
            .iter()
            .find(|(leaf_index, _)| *leaf_index == index)
            .map(|(_, value)| value.clone())
            .unwrap_or_default();
        let inclusion = sparse::prove(MAP_ID, &current.leaves, &index);
        let prev_entry = entry::parse_leaf(&old_leaf).expect("old leaf decodes");
        let applied =
            mutator::mutate(prev_entry.as_ref(), mutation).expect("update applies cleanly");

        let mut leaves = current.leaves.clone();
        let mut committed_map = current.committed.clone();
        leaves.retain(|(leaf_index, _)| *leaf_index != index);
        leaves.push((index, applied.encode_to_vec()));
        committed_map.insert(index, committed.clone());

        let proof = MutationProof {
            mutation: Some(applied),
            leaf_proof: Some(MapLeafInclusion { leaf: old_leaf, inclusion }),
        };
        self.seal_revision(leaves, committed_map, vec![proof]);
    }

    /// Publishes a profile for a user, signed by the fixed test signer for
    /// `signer_seed`, creating or mutating the entry as needed.
    pub(crate) fn publish_profile(
        &mut self,
        app_id: &str,
        user_id: &str,
        profile: &[u8],
        signer_seed: u8,
    ) {
        let signer = test_signer(signer_seed);
        let (index, _) = self.index_for(app_id, user_id);
        let old_leaf = self
            .current()
            .leaves
            .iter()
            .find(|(leaf_index, _)| *leaf_index == index)
            .map(|(_, value)| value.clone())
            .unwrap_or_default();

        let mut mutation = Mutation::new(&index, &self.domain_id, app_id, user_id);
        mutation.set_previous(&old_leaf, false).expect("old leaf decodes");
        mutation.set_commitment(profile);
        mutation
            .replace_authorized_keys(&[signer.public_key()])
            .expect("non-empty key set");
        let request = mutation
            .serialize_and_sign(&[signer], self.log_size())
            .expect("update signs");
        self.apply_update(&request);
    }

    fn signed_log_root(&self) -> SignedLogRoot {
        self.signed_log_root_at(self.log.size())
    }

    fn signed_log_root_at(&self, size: u64) -> SignedLogRoot {
        let mut root = SignedLogRoot {
            log_id: LOG_ID,
            tree_size: size,
            root_hash: self.log.root_at(size as usize).to_vec(),
            timestamp_nanos: 1_700_000_000_000 + size as i64,
            signature: None,
        };
        self.resign_log_root(&mut root);
        root
    }

    /// Re-signs a log root after a test edited it.
    pub(crate) fn resign_log_root(&self, root: &mut SignedLogRoot) {
        root.signature = None;
        let signature = self
            .log_signer
            .sign(&root.canonical_value(true))
            .expect("log root signs");
        root.signature = Some(signature);
    }

    /// Serves a lookup response for the latest revision.
    pub(crate) fn get_entry_response(
        &self,
        app_id: &str,
        user_id: &str,
        first_tree_size: u64,
    ) -> GetEntryResponse {
        self.get_entry_response_at(app_id, user_id, first_tree_size, self.latest_revision())
    }

    /// Serves a lookup response pinned to an historical revision; the log
    /// proofs still anchor it under the newest log root.
    pub(crate) fn get_entry_response_at(
        &self,
        app_id: &str,
        user_id: &str,
        first_tree_size: u64,
        revision: u64,
    ) -> GetEntryResponse {
        let snapshot = &self.revisions[revision as usize];
        let (index, vrf_proof) = self.index_for(app_id, user_id);
        let leaf = snapshot
            .leaves
            .iter()
            .find(|(leaf_index, _)| *leaf_index == index)
            .map(|(_, value)| value.clone())
            .unwrap_or_default();
        let inclusion = sparse::prove(MAP_ID, &snapshot.leaves, &index);
        let committed = if leaf.is_empty() {
            None
        } else {
            snapshot.committed.get(&index).cloned()
        };

        let size = self.log.size();
        GetEntryResponse {
            vrf_proof,
            committed,
            leaf_proof: Some(MapLeafInclusion { leaf, inclusion }),
            smr: Some(snapshot.smr.clone()),
            log_root: Some(self.signed_log_root()),
            log_consistency: self.log.consistency_proof(first_tree_size as usize, size as usize),
            log_inclusion: self.log.inclusion_proof(revision as usize, size as usize),
        }
    }

    /// Serves the epoch for `revision`, with log proofs anchored at the
    /// log size the revision was sealed at, so a monitor that never skips
    /// advances one revision at a time.
    pub(crate) fn epoch(&self, revision: u64) -> Option<Epoch> {
        let snapshot = self.revisions.get(revision as usize)?;
        let sealed_size = (revision + 1) as usize;
        Some(Epoch {
            smr: Some(snapshot.smr.clone()),
            log_root: Some(self.signed_log_root_at(sealed_size as u64)),
            log_consistency: self.log.consistency_proof(revision as usize, sealed_size),
            log_inclusion: self.log.inclusion_proof(revision as usize, sealed_size),
            mutations: snapshot.mutations.clone(),
        })
    }
}

/// [`KtService`] over a shared [`FakeDirectory`]. Epochs past the latest
/// revision fail with an unavailable error, which ends monitor runs
/// deterministically. `lag_updates` makes the next N update submissions
/// seal nothing, so the client's retry loop has something to chew on.
#[derive(Clone)]
pub(crate) struct FakeService {
    directory: Arc<Mutex<FakeDirectory>>,
    lag_updates: Arc<AtomicU32>,
}

impl FakeService {
    pub(crate) fn new(directory: FakeDirectory) -> Self {
        Self {
            directory: Arc::new(Mutex::new(directory)),
            lag_updates: Arc::new(AtomicU32::new(0)),
        }
    }

    pub(crate) fn lag_next_updates(&self, count: u32) {
        self.lag_updates.store(count, Ordering::SeqCst);
    }

    pub(crate) fn with_directory<R>(&self, f: impl FnOnce(&mut FakeDirectory) -> R) -> R {
        let mut directory = self.directory.lock().expect("directory lock");
        f(&mut directory)
    }
}

#[async_trait]
impl KtService for FakeService {
    async fn get_entry(
        &self,
        request: crate::api::GetEntryRequest,
    ) -> Result<GetEntryResponse, ServiceError> {
        let directory = self.directory.lock().expect("directory lock");
        Ok(directory.get_entry_response(&request.app_id, &request.user_id, request.first_tree_size))
    }

    async fn update_entry(
        &self,
        request: UpdateEntryRequest,
    ) -> Result<UpdateEntryResponse, ServiceError> {
        let mut directory = self.directory.lock().expect("directory lock");
        if self
            .lag_updates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_err()
        {
            directory.apply_update(&request);
        }
        Ok(UpdateEntryResponse {
            proof: Some(directory.get_entry_response(
                &request.app_id,
                &request.user_id,
                request.first_tree_size,
            )),
        })
    }

    async fn list_entry_history(
        &self,
        request: ListEntryHistoryRequest,
    ) -> Result<ListEntryHistoryResponse, ServiceError> {
        let directory = self.directory.lock().expect("directory lock");
        let latest = directory.latest_revision();
        if request.start > latest {
            return Ok(ListEntryHistoryResponse { values: Vec::new(), next_start: 0 });
        }
        let page = (request.page_size.max(1) as u64).min(latest - request.start + 1);
        let mut values = Vec::with_capacity(page as usize);
        for offset in 0..page {
            // Only the first value in a page advances the caller's trusted
            // root; the rest ride on the already-advanced root.
            let first_tree_size = if offset == 0 {
                request.first_tree_size
            } else {
                directory.log_size()
            };
            values.push(directory.get_entry_response_at(
                &request.app_id,
                &request.user_id,
                first_tree_size,
                request.start + offset,
            ));
        }
        let served_through = request.start + page - 1;
        let next_start = if served_through >= latest { 0 } else { served_through + 1 };
        Ok(ListEntryHistoryResponse { values, next_start })
    }

    async fn get_epoch(&self, domain_id: &str, revision: u64) -> Result<Option<Epoch>, ServiceError> {
        let directory = self.directory.lock().expect("directory lock");
        if domain_id != directory.domain_id {
            return Err(ServiceError::Rejected(format!("unknown domain {domain_id}")));
        }
        directory
            .epoch(revision)
            .map(Some)
            .ok_or_else(|| ServiceError::Unavailable("end of epoch stream".to_string()))
    }
}
