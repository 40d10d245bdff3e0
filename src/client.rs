//! Verified client flows against the directory service.
//!
//! [`Client`] wraps an RPC-neutral [`KtService`] and verifies every
//! response before surfacing it. It owns the trusted log root for its
//! directory; the root only advances through successful verification.

use async_trait::async_trait;
use thiserror::Error;
use tokio::time;
use tracing::debug;

use crate::api::{
    Epoch, GetEntryRequest, GetEntryResponse, ListEntryHistoryRequest, ListEntryHistoryResponse,
    PublicKey, SignedLogRoot, SignedMapRoot, UpdateEntryRequest, UpdateEntryResponse,
};
use crate::config::TrustAnchors;
use crate::crypto::sign::ObjectSigner;
use crate::mutator::{MutateError, Mutation};
use crate::verify::{Verifier, VerifyError};

/// Transport-level failures; the transport itself lives outside this
/// crate.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("directory service unavailable: {0}")]
    Unavailable(String),
    #[error("directory service rejected the request: {0}")]
    Rejected(String),
}

/// The RPC surface the client and monitor consume.
#[async_trait]
pub trait KtService: Send + Sync {
    async fn get_entry(&self, request: GetEntryRequest) -> Result<GetEntryResponse, ServiceError>;
    async fn update_entry(
        &self,
        request: UpdateEntryRequest,
    ) -> Result<UpdateEntryResponse, ServiceError>;
    async fn list_entry_history(
        &self,
        request: ListEntryHistoryRequest,
    ) -> Result<ListEntryHistoryResponse, ServiceError>;
    /// Fetches one epoch, or `None` when the revision is not sealed yet.
    async fn get_epoch(&self, domain_id: &str, revision: u64)
        -> Result<Option<Epoch>, ServiceError>;
}

/// Errors surfaced by the client flows.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Service(#[from] ServiceError),
    #[error(transparent)]
    Verify(#[from] VerifyError),
    #[error(transparent)]
    Mutate(#[from] MutateError),
    #[error("update not yet visible on the server")]
    Retry,
    #[error("account history ended before the requested epoch")]
    Incomplete,
}

/// A verified client for one directory.
pub struct Client<S> {
    service: S,
    domain_id: String,
    verifier: Verifier,
    retry_count: u32,
    retry_delay: std::time::Duration,
    page_size: u32,
    trusted: SignedLogRoot,
}

impl<S: KtService> Client<S> {
    #[must_use]
    pub fn new(service: S, anchors: &TrustAnchors) -> Self {
        Self {
            service,
            domain_id: anchors.domain_id().to_string(),
            verifier: anchors.verifier(),
            retry_count: anchors.retry_count(),
            retry_delay: anchors.retry_delay(),
            page_size: anchors.page_size(),
            trusted: SignedLogRoot::default(),
        }
    }

    /// The log root this client currently trusts; tree size zero until
    /// the first verified response.
    #[must_use]
    pub fn trusted_log_root(&self) -> &SignedLogRoot {
        &self.trusted
    }

    /// Looks up a user's profile. Returns `None` for a verified proof of
    /// absence, along with the map root the answer is anchored in.
    pub async fn get_entry(
        &mut self,
        app_id: &str,
        user_id: &str,
    ) -> Result<(Option<Vec<u8>>, SignedMapRoot), ClientError> {
        let response = self
            .service
            .get_entry(GetEntryRequest {
                domain_id: self.domain_id.clone(),
                app_id: app_id.to_string(),
                user_id: user_id.to_string(),
                first_tree_size: self.trusted.tree_size,
            })
            .await?;
        self.verifier.verify_get_entry_response(
            &self.domain_id,
            app_id,
            user_id,
            &mut self.trusted,
            &response,
        )?;

        let smr = response.smr.ok_or(VerifyError::MissingField("smr"))?;
        Ok((response.committed.map(|committed| committed.data), smr))
    }

    /// Publishes `profile` for a user: reads and verifies the current
    /// entry, builds a signed mutation on top of it, and submits until the
    /// server echo matches, up to the configured retry budget.
    pub async fn update(
        &mut self,
        app_id: &str,
        user_id: &str,
        profile: &[u8],
        signers: &[ObjectSigner],
        authorized_keys: &[PublicKey],
    ) -> Result<Mutation, ClientError> {
        let response = self
            .service
            .get_entry(GetEntryRequest {
                domain_id: self.domain_id.clone(),
                app_id: app_id.to_string(),
                user_id: user_id.to_string(),
                first_tree_size: self.trusted.tree_size,
            })
            .await?;
        self.verifier.verify_get_entry_response(
            &self.domain_id,
            app_id,
            user_id,
            &mut self.trusted,
            &response,
        )?;

        let index = self
            .verifier
            .index(&response.vrf_proof, &self.domain_id, app_id, user_id)?;
        let leaf = response
            .leaf_proof
            .as_ref()
            .ok_or(VerifyError::MissingField("leaf_proof"))?
            .leaf
            .clone();

        let mut mutation = Mutation::new(&index, &self.domain_id, app_id, user_id);
        mutation.set_previous(&leaf, false)?;
        mutation.set_commitment(profile);
        mutation.replace_authorized_keys(authorized_keys)?;

        let mut result = self.try_update(&mut mutation, signers).await;
        let mut attempts = 0;
        while matches!(result, Err(ClientError::Retry)) && attempts < self.retry_count {
            time::sleep(self.retry_delay).await;
            debug!(attempt = attempts + 1, "update not visible yet, retrying");
            result = self.try_update(&mut mutation, signers).await;
            attempts += 1;
        }
        result.map(|()| mutation)
    }

    /// One submission round: sign, submit, verify the echoed proof, and
    /// re-chain the mutation to whatever leaf the server reported.
    async fn try_update(
        &mut self,
        mutation: &mut Mutation,
        signers: &[ObjectSigner],
    ) -> Result<(), ClientError> {
        let request = mutation.serialize_and_sign(signers, self.trusted.tree_size)?;
        let response = self.service.update_entry(request.clone()).await?;
        let proof = response.proof.ok_or(VerifyError::MissingField("proof"))?;
        self.verifier.verify_get_entry_response(
            &self.domain_id,
            &request.app_id,
            &request.user_id,
            &mut self.trusted,
            &proof,
        )?;

        let leaf = &proof
            .leaf_proof
            .as_ref()
            .ok_or(VerifyError::MissingField("leaf_proof"))?
            .leaf;
        let applied = mutation.matches_requested(leaf)?;
        mutation.set_previous(leaf, false)?;
        if !applied {
            return Err(ClientError::Retry);
        }
        Ok(())
    }

    /// Lists verified profiles between `start` and `end` inclusive,
    /// compressing runs of identical consecutive profiles. A range that
    /// spans no epochs is an empty listing; fails with
    /// [`ClientError::Incomplete`] when the server stops early.
    pub async fn list_history(
        &mut self,
        app_id: &str,
        user_id: &str,
        start: u64,
        end: u64,
    ) -> Result<Vec<(SignedMapRoot, Vec<u8>)>, ClientError> {
        let epochs_want = if end < start { 0 } else { end - start + 1 };
        let mut epochs_received = 0u64;
        let mut next = start;
        let mut current_profile: Vec<u8> = Vec::new();
        let mut profiles = Vec::new();

        while epochs_received < epochs_want {
            let page_size = u64::min(end - next + 1, u64::from(self.page_size)) as i32;
            let response = self
                .service
                .list_entry_history(ListEntryHistoryRequest {
                    domain_id: self.domain_id.clone(),
                    user_id: user_id.to_string(),
                    app_id: app_id.to_string(),
                    start: next,
                    page_size,
                    first_tree_size: self.trusted.tree_size,
                })
                .await?;
            epochs_received += response.values.len() as u64;

            for value in &response.values {
                self.verifier.verify_get_entry_response(
                    &self.domain_id,
                    app_id,
                    user_id,
                    &mut self.trusted,
                    value,
                )?;

                // Absent epochs carry an empty profile; runs of equal
                // profiles collapse to their first occurrence.
                let profile = value
                    .committed
                    .as_ref()
                    .map(|committed| committed.data.clone())
                    .unwrap_or_default();
                if profile == current_profile {
                    continue;
                }
                let smr = value.smr.clone().ok_or(VerifyError::MissingField("smr"))?;
                profiles.push((smr, profile.clone()));
                current_profile = profile;
            }

            if response.next_start == 0 {
                break;
            }
            next = response.next_start;
        }

        if epochs_received < epochs_want {
            return Err(ClientError::Incomplete);
        }
        Ok(profiles)
    }
}
