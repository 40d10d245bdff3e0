//! Epoch monitoring: stream revisions, pair them, and check that each
//! epoch's mutation set transforms the previous map into the next one.
//!
//! Three cooperating tasks form the pipeline: the epoch streamer polls the
//! service, the pair former turns the stream into adjacent pairs, and the
//! verifier loop checks and stores each pair serially. The stages connect
//! through capacity-1 channels; every channel is closed by its producer,
//! and closure is the cancellation signal — when any stage exits, the rest
//! unwind. The coordinator then drains both background tasks and surfaces
//! the streamer's error first.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use p256::ecdsa::VerifyingKey;
use prost::Message;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time;
use tracing::{debug, warn};

use crate::api::{Epoch, SignedLogRoot, SignedMapRoot};
use crate::client::{KtService, ServiceError};
use crate::config::TrustAnchors;
use crate::crypto::objecthash::to_canonical_json;
use crate::crypto::sign::{self, ObjectSigner, SignError};
use crate::merkle::log::LogVerifier;
use crate::merkle::sparse::{self, ProofNodes, INDEX_LEN};
use crate::mutator::{self, entry};
use crate::verify::VerifyError;

/// Per-revision storage of monitor verdicts.
pub mod storage;

pub use storage::{MemoryStorage, MonitorResult, MonitorStorage, StorageError};

/// Errors that abort the monitor loop. Verification findings do not; they
/// are captured in the stored result and the loop moves on.
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error(transparent)]
    Service(#[from] ServiceError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("epoch is missing {0}")]
    MalformedEpoch(&'static str),
    #[error(transparent)]
    Sign(#[from] SignError),
    #[error("background task failed: {0}")]
    Task(String),
}

/// Two adjacent epochs.
#[derive(Clone, Debug)]
pub struct EpochPair {
    pub a: Epoch,
    pub b: Epoch,
}

/// Consumes epochs `(0, 1, 2, …)` and produces pairs `((0,1), (1,2), …)`.
/// Returns when the epoch channel closes or the pair consumer goes away.
pub async fn epoch_pairs(
    mut epochs: mpsc::Receiver<Epoch>,
    pairs: mpsc::Sender<EpochPair>,
) -> Result<(), MonitorError> {
    let mut previous: Option<Epoch> = None;
    while let Some(epoch) = epochs.recv().await {
        let Some(a) = previous.replace(epoch.clone()) else {
            continue;
        };
        if pairs.send(EpochPair { a, b: epoch }).await.is_err() {
            break;
        }
    }
    Ok(())
}

/// Polls the service for sealed epochs starting at `start`, sleeping for
/// `poll_period` whenever the next revision is not available yet.
async fn stream_epochs<S: KtService>(
    service: Arc<S>,
    domain_id: String,
    start: u64,
    epochs: mpsc::Sender<Epoch>,
    poll_period: Duration,
) -> Result<(), MonitorError> {
    let mut next = start;
    loop {
        match service.get_epoch(&domain_id, next).await {
            Ok(Some(epoch)) => {
                if epochs.send(epoch).await.is_err() {
                    return Ok(());
                }
                next += 1;
            }
            Ok(None) => time::sleep(poll_period).await,
            Err(err) => return Err(MonitorError::Service(err)),
        }
    }
}

/// Verifies the epoch stream of one directory and countersigns every
/// revision that checks out.
pub struct Monitor<S, T> {
    service: Arc<S>,
    map_public_key: VerifyingKey,
    log: LogVerifier,
    signer: ObjectSigner,
    store: T,
    trusted: SignedLogRoot,
    poll_period: Duration,
}

impl<S, T> Monitor<S, T>
where
    S: KtService + 'static,
    T: MonitorStorage,
{
    #[must_use]
    pub fn new(
        service: Arc<S>,
        anchors: &TrustAnchors,
        signer: ObjectSigner,
        store: T,
        poll_period: Duration,
    ) -> Self {
        Self {
            service,
            map_public_key: *anchors.map_public_key(),
            log: anchors.log_verifier(),
            signer,
            store,
            trusted: SignedLogRoot::default(),
            poll_period,
        }
    }

    #[must_use]
    pub fn storage(&self) -> &T {
        &self.store
    }

    /// Runs the pipeline from `start` until a stage fails. The monitor
    /// never skips an epoch: a fetch failure halts the loop and is
    /// reported upstream rather than stepped over.
    pub async fn process_loop(&mut self, domain_id: &str, start: u64) -> Result<(), MonitorError> {
        let (epoch_tx, epoch_rx) = mpsc::channel(1);
        let (pair_tx, mut pair_rx) = mpsc::channel(1);
        let streamer = tokio::spawn(stream_epochs(
            self.service.clone(),
            domain_id.to_string(),
            start,
            epoch_tx,
            self.poll_period,
        ));
        let pairer = tokio::spawn(epoch_pairs(epoch_rx, pair_tx));

        let mut loop_error = None;
        while let Some(pair) = pair_rx.recv().await {
            if let Err(err) = self.process_pair(&pair) {
                loop_error = Some(err);
                break;
            }
        }
        // Dropping the pair receiver unwinds the upstream stages.
        drop(pair_rx);

        let streamer_result = streamer.await;
        let pairer_result = pairer.await;
        match streamer_result {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(err),
            Err(join) => return Err(MonitorError::Task(join.to_string())),
        }
        match pairer_result {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(err),
            Err(join) => return Err(MonitorError::Task(join.to_string())),
        }
        match loop_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Verifies one pair and stores the verdict for epoch B's revision.
    fn process_pair(&mut self, pair: &EpochPair) -> Result<(), MonitorError> {
        let smr =
            pair.b.smr.as_ref().ok_or(MonitorError::MalformedEpoch("smr"))?.clone();
        let revision = smr.map_revision;
        debug!(revision, "epoch pair received");

        let findings = self.verify_pair(pair);
        let result = if findings.is_empty() {
            let countersigned = self.countersign(&smr)?;
            debug!(revision, "epoch verified and countersigned");
            MonitorResult { smr: Some(countersigned), seen_at: SystemTime::now(), errors: Vec::new() }
        } else {
            warn!(revision, findings = findings.len(), "epoch failed verification");
            MonitorResult { smr: None, seen_at: SystemTime::now(), errors: findings }
        };

        self.store.set(revision, result)?;
        debug!(revision, "verdict stored");
        Ok(())
    }

    /// All verification findings for a pair; empty means the epoch
    /// checked out end to end.
    fn verify_pair(&mut self, pair: &EpochPair) -> Vec<String> {
        if let Err(err) = self.verify_epoch(&pair.b) {
            return vec![err.to_string()];
        }
        debug!("epoch map root and log anchoring verified");
        let findings = self.verify_mutations(pair);
        if findings.is_empty() {
            debug!("mutation set reproduces the signed map root");
        }
        findings
    }

    /// Checks epoch B's own anchoring: map-root signature, log root
    /// consistency against the monitor's trusted root, and log inclusion
    /// of the map root at its revision. Trust advances only when all
    /// three hold.
    fn verify_epoch(&mut self, epoch: &Epoch) -> Result<(), VerifyError> {
        let smr = epoch.smr.as_ref().ok_or(VerifyError::MissingField("smr"))?;
        let signature = smr.signature.as_ref().ok_or(VerifyError::MissingField("smr.signature"))?;
        sign::verify_object(&self.map_public_key, &smr.canonical_value(true), signature)
            .map_err(VerifyError::SmrSignature)?;

        let log_root = epoch.log_root.as_ref().ok_or(VerifyError::MissingField("log_root"))?;
        let candidate = self.log.verify_root(&self.trusted, log_root, &epoch.log_consistency)?;

        let smr_leaf = to_canonical_json(&smr.canonical_value(false));
        self.log.verify_inclusion_at_index(
            &candidate,
            &smr_leaf,
            smr.map_revision,
            &epoch.log_inclusion,
        )?;

        self.trusted = candidate;
        Ok(())
    }

    /// Replays epoch B's mutation set on top of epoch A's map and checks
    /// that the recomputed sparse root matches the signed one.
    fn verify_mutations(&self, pair: &EpochPair) -> Vec<String> {
        let Some(smr_a) = pair.a.smr.as_ref() else {
            return vec!["previous epoch is missing its map root".to_string()];
        };
        let Some(smr_b) = pair.b.smr.as_ref() else {
            return vec!["epoch is missing its map root".to_string()];
        };
        let map_id = smr_b.map_id;

        if pair.b.mutations.is_empty() {
            if smr_a.root_hash == smr_b.root_hash {
                return Vec::new();
            }
            return vec!["map root changed but the epoch carries no mutations".to_string()];
        }

        let mut findings = Vec::new();
        let mut new_leaves: Vec<([u8; INDEX_LEN], Vec<u8>)> = Vec::new();
        let mut nodes = ProofNodes::new();
        for (position, proof) in pair.b.mutations.iter().enumerate() {
            let Some(mutation) = proof.mutation.as_ref() else {
                findings.push(format!("mutation {position} is missing its entry"));
                continue;
            };
            let Some(leaf_proof) = proof.leaf_proof.as_ref() else {
                findings.push(format!("mutation {position} is missing its leaf proof"));
                continue;
            };
            let Ok(index) = <[u8; INDEX_LEN]>::try_from(mutation.index.as_slice()) else {
                findings.push(format!("mutation {position} has a malformed index"));
                continue;
            };

            if let Err(err) = sparse::verify_inclusion(
                map_id,
                &mutation.index,
                &leaf_proof.leaf,
                &smr_a.root_hash,
                &leaf_proof.inclusion,
            ) {
                findings.push(format!("mutation {position}: prior leaf proof: {err}"));
                continue;
            }
            let prev_entry = match entry::parse_leaf(&leaf_proof.leaf) {
                Ok(prev) => prev,
                Err(err) => {
                    findings.push(format!("mutation {position}: prior leaf: {err}"));
                    continue;
                }
            };
            let applied = match mutator::mutate(prev_entry.as_ref(), mutation) {
                Ok(applied) => applied,
                Err(err) => {
                    findings.push(format!("mutation {position}: {err}"));
                    continue;
                }
            };
            if let Err(err) = sparse::collect_proof_nodes(&index, &leaf_proof.inclusion, &mut nodes)
            {
                findings.push(format!("mutation {position}: {err}"));
                continue;
            }
            new_leaves.push((index, applied.encode_to_vec()));
        }
        if !findings.is_empty() {
            return findings;
        }

        match sparse::compute_root(map_id, new_leaves, &nodes) {
            Ok(computed) if computed.as_slice() == smr_b.root_hash => Vec::new(),
            Ok(_) => vec!["recomputed sparse root does not match the signed map root".to_string()],
            Err(err) => vec![format!("sparse root recomputation failed: {err}")],
        }
    }

    /// Countersigns a verified map root with the monitor's key.
    fn countersign(&self, smr: &SignedMapRoot) -> Result<SignedMapRoot, MonitorError> {
        let mut countersigned = smr.clone();
        let signature = self.signer.sign(&smr.canonical_value(true))?;
        countersigned.signature = Some(signature);
        Ok(countersigned)
    }
}
