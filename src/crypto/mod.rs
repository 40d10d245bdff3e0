//! Cryptographic building blocks shared by the verifier, mutator, and
//! monitor.

/// Hiding, binding commitments to profile data.
pub mod commitment;
/// Canonical type-tagged hashing of structured values.
pub mod objecthash;
/// Digital signatures over canonicalized objects.
pub mod sign;
/// Verifiable random function mapping identities to map indexes.
pub mod vrf;
