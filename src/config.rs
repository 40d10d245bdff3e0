//! Per-directory client configuration.
//!
//! A [`DirectoryConfig`] is the serialized trust bundle a client is
//! provisioned with: identifiers, hex-encoded public keys, and hashing
//! strategies. Parsing it yields [`TrustAnchors`], the validated form the
//! verifier, client, and monitor are built from.

use std::time::Duration;

use p256::ecdsa::VerifyingKey;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::sign;
use crate::crypto::vrf::{VrfError, VrfPublicKey};
use crate::merkle::log::{LogHashStrategy, LogVerifier};
use crate::verify::Verifier;

const SUPPORTED_VERSION: u32 = 1;

fn default_retry_count() -> u32 {
    1
}

fn default_retry_delay_ms() -> u64 {
    3_000
}

fn default_page_size() -> u32 {
    16
}

/// Hashing strategy for the sparse user map.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MapHashStrategy {
    /// CONIKS construction over SHA-512/256.
    #[serde(rename = "CONIKS_SHA512_256")]
    ConiksSha512_256,
}

/// Serialized trust bundle for one directory.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DirectoryConfig {
    pub version: u32,
    pub domain_id: String,
    /// Hex-encoded SEC1 P-256 point.
    pub vrf_public_key: String,
    /// Hex-encoded SEC1 P-256 point.
    pub map_public_key: String,
    /// Hex-encoded SEC1 P-256 point.
    pub log_public_key: String,
    pub map_hash_strategy: MapHashStrategy,
    pub log_hash_strategy: LogHashStrategy,
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default)]
    pub allow_unopened_entries: bool,
}

/// Errors surfaced while validating a directory configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unsupported directory config version {version}")]
    UnsupportedVersion { version: u32 },
    #[error("domain identifier must not be empty")]
    EmptyDomainId,
    #[error("invalid VRF public key encoding")]
    InvalidVrfKey(#[source] VrfError),
    #[error("invalid map public key encoding")]
    InvalidMapKey,
    #[error("invalid log public key encoding")]
    InvalidLogKey,
    #[error("page size must be nonzero")]
    ZeroPageSize,
}

impl DirectoryConfig {
    /// Validates the config and parses its key material.
    pub fn trust_anchors(&self) -> Result<TrustAnchors, ConfigError> {
        if self.version != SUPPORTED_VERSION {
            return Err(ConfigError::UnsupportedVersion { version: self.version });
        }
        if self.domain_id.is_empty() {
            return Err(ConfigError::EmptyDomainId);
        }
        if self.page_size == 0 {
            return Err(ConfigError::ZeroPageSize);
        }

        let vrf_bytes = hex::decode(&self.vrf_public_key)
            .map_err(|_| ConfigError::InvalidVrfKey(VrfError::MalformedKey))?;
        let vrf = VrfPublicKey::from_sec1_bytes(&vrf_bytes).map_err(ConfigError::InvalidVrfKey)?;

        let map_bytes = hex::decode(&self.map_public_key).map_err(|_| ConfigError::InvalidMapKey)?;
        let map_public_key =
            sign::verifying_key_from_sec1(&map_bytes).map_err(|_| ConfigError::InvalidMapKey)?;

        let log_bytes = hex::decode(&self.log_public_key).map_err(|_| ConfigError::InvalidLogKey)?;
        let log_public_key =
            sign::verifying_key_from_sec1(&log_bytes).map_err(|_| ConfigError::InvalidLogKey)?;

        Ok(TrustAnchors {
            domain_id: self.domain_id.clone(),
            vrf,
            map_public_key,
            log_public_key,
            map_hash_strategy: self.map_hash_strategy,
            log_hash_strategy: self.log_hash_strategy,
            retry_count: self.retry_count,
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            page_size: self.page_size,
            allow_unopened_entries: self.allow_unopened_entries,
        })
    }
}

/// Validated trust anchors for one directory.
#[derive(Clone, Debug)]
pub struct TrustAnchors {
    domain_id: String,
    vrf: VrfPublicKey,
    map_public_key: VerifyingKey,
    log_public_key: VerifyingKey,
    map_hash_strategy: MapHashStrategy,
    log_hash_strategy: LogHashStrategy,
    retry_count: u32,
    retry_delay: Duration,
    page_size: u32,
    allow_unopened_entries: bool,
}

impl TrustAnchors {
    #[must_use]
    pub fn domain_id(&self) -> &str {
        &self.domain_id
    }

    #[must_use]
    pub fn map_public_key(&self) -> &VerifyingKey {
        &self.map_public_key
    }

    #[must_use]
    pub fn map_hash_strategy(&self) -> MapHashStrategy {
        self.map_hash_strategy
    }

    #[must_use]
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    #[must_use]
    pub fn retry_delay(&self) -> Duration {
        self.retry_delay
    }

    #[must_use]
    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    /// Builds the log verifier for this directory.
    #[must_use]
    pub fn log_verifier(&self) -> LogVerifier {
        LogVerifier::new(self.log_public_key, self.log_hash_strategy)
    }

    /// Builds the response verifier for this directory.
    #[must_use]
    pub fn verifier(&self) -> Verifier {
        Verifier::new(self.vrf.clone(), self.map_public_key, self.log_verifier())
            .allow_unopened_entries(self.allow_unopened_entries)
    }
}
