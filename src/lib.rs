#![forbid(unsafe_code)]

//! Client-side verification and mutation building for a key transparency
//! directory.
//!
//! The directory maps `(domain, application, user)` identifiers to opaque
//! profile data and answers lookups with cryptographic proofs. This crate
//! checks those proofs so a client can accept or reject each response
//! without trusting the server: commitment openings, VRF-derived map
//! indexes, sparse Merkle inclusion, signed map roots, and append-only
//! log consistency. It also builds signed, authorized mutations for
//! publishing updates, and runs the monitor pipeline that replays every
//! epoch's mutation set against the signed map roots.
//!
//! The RPC transport, key provisioning, and the log/map servers
//! themselves live outside this crate; [`client::KtService`] is the seam
//! they plug into.

/// Wire messages and their canonical object forms.
pub mod api;
/// Verified lookup, update, and history flows.
pub mod client;
/// Per-directory configuration and trust anchors.
pub mod config;
/// Commitments, object hashing, signatures, and the VRF.
pub mod crypto;
/// Sparse map and append-only log proof verification.
pub mod merkle;
/// Epoch stream verification and countersigning.
pub mod monitor;
/// Entry mutations: codec, builder, and applier.
pub mod mutator;
/// The six-step lookup response verifier.
pub mod verify;

#[cfg(test)]
mod testutil;

pub use client::{Client, ClientError, KtService, ServiceError};
pub use config::{DirectoryConfig, TrustAnchors};
pub use monitor::Monitor;
pub use mutator::Mutation;
pub use verify::{Verifier, VerifyError};
