//! Storage interface for monitor verdicts.
//!
//! Persistent backends live outside this crate; the monitor only needs an
//! append-only mapping from revision to result. Results are write-once:
//! the verdict for a revision never changes after it is recorded.

use std::collections::BTreeMap;
use std::time::SystemTime;

use thiserror::Error;

use crate::api::SignedMapRoot;

/// Outcome of verifying one epoch: either the countersigned map root, or
/// the list of verification findings.
#[derive(Clone, Debug)]
pub struct MonitorResult {
    pub smr: Option<SignedMapRoot>,
    pub seen_at: SystemTime,
    pub errors: Vec<String>,
}

/// Errors surfaced by monitor storage backends.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("revision {0} already has a stored result")]
    Duplicate(u64),
    #[error("revision {0} has no stored result")]
    NotFound(u64),
}

/// Write-once storage for per-revision monitor results.
pub trait MonitorStorage: Send {
    fn set(&mut self, revision: u64, result: MonitorResult) -> Result<(), StorageError>;
    fn get(&self, revision: u64) -> Result<&MonitorResult, StorageError>;
    /// Highest revision with a stored result.
    fn latest(&self) -> Option<u64>;
}

/// In-memory storage, sufficient for tests and short-lived monitors.
#[derive(Default)]
pub struct MemoryStorage {
    results: BTreeMap<u64, MonitorResult>,
}

impl MemoryStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl MonitorStorage for MemoryStorage {
    fn set(&mut self, revision: u64, result: MonitorResult) -> Result<(), StorageError> {
        if self.results.contains_key(&revision) {
            return Err(StorageError::Duplicate(revision));
        }
        self.results.insert(revision, result);
        Ok(())
    }

    fn get(&self, revision: u64) -> Result<&MonitorResult, StorageError> {
        self.results.get(&revision).ok_or(StorageError::NotFound(revision))
    }

    fn latest(&self) -> Option<u64> {
        self.results.keys().next_back().copied()
    }
}
