//! Verifiable random function over NIST P-256.
//!
//! The VRF maps a user identity to its 32-byte sparse map index. The proof
//! is `s(32) ∥ t(32) ∥ vrf_point(65)` where `vrf_point = [k]H1(alpha)` in
//! uncompressed SEC1 form, and the index is `SHA-256(vrf_point)`. `H1`
//! hashes to the curve by try-and-increment over compressed candidates;
//! `H2` hashes to a scalar in `[1, n-1]` by simple discard.

use p256::elliptic_curve::bigint::{ArrayEncoding, U256};
use p256::elliptic_curve::sec1::{FromEncodedPoint, ToEncodedPoint};
use p256::elliptic_curve::{Curve, PrimeField};
use p256::{AffinePoint, EncodedPoint, NistP256, NonZeroScalar, ProjectivePoint, Scalar};
use rand_core::OsRng;
use sha2::{Digest, Sha256, Sha512};
use subtle::ConstantTimeEq;
use thiserror::Error;

/// Length of a serialized VRF proof.
pub const PROOF_LEN: usize = 32 + 32 + 65;

const H1_MAX_ATTEMPTS: u32 = 100;

/// Errors surfaced while evaluating or verifying VRF proofs.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum VrfError {
    #[error("vrf proof rejected")]
    Invalid,
    #[error("malformed vrf public key")]
    MalformedKey,
}

/// Builds the VRF input for a lookup: each identifier is length-prefixed
/// so distinct identity tuples never collide.
#[must_use]
pub fn alpha(domain_id: &str, app_id: &str, user_id: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(12 + domain_id.len() + app_id.len() + user_id.len());
    for part in [domain_id, app_id, user_id] {
        out.extend_from_slice(&(part.len() as u32).to_be_bytes());
        out.extend_from_slice(part.as_bytes());
    }
    out
}

fn marshal(point: &ProjectivePoint) -> Vec<u8> {
    point.to_affine().to_encoded_point(false).as_bytes().to_vec()
}

/// Hashes a message to a curve point by incrementing a counter until the
/// digest is the x-coordinate of a point.
fn hash_to_curve(message: &[u8]) -> Result<ProjectivePoint, VrfError> {
    for counter in 0..H1_MAX_ATTEMPTS {
        let mut hasher = Sha512::new();
        hasher.update(counter.to_be_bytes());
        hasher.update(message);
        let digest = hasher.finalize();

        let mut candidate = [0u8; 33];
        candidate[0] = 0x02;
        candidate[1..].copy_from_slice(&digest[..32]);
        let Ok(encoded) = EncodedPoint::from_bytes(candidate) else {
            continue;
        };
        if let Some(point) = Option::<AffinePoint>::from(AffinePoint::from_encoded_point(&encoded)) {
            return Ok(ProjectivePoint::from(point));
        }
    }
    Err(VrfError::Invalid)
}

/// Hashes a message to a scalar in `[1, n-1]` by discarding candidates
/// outside the range.
fn hash_to_scalar(message: &[u8]) -> Scalar {
    let order_minus_one = NistP256::ORDER.wrapping_sub(&U256::ONE);
    let mut counter = 0u32;
    loop {
        let mut hasher = Sha512::new();
        hasher.update(counter.to_be_bytes());
        hasher.update(message);
        let digest = hasher.finalize();

        let candidate = U256::from_be_slice(&digest[..32]);
        if candidate < order_minus_one {
            let repr = candidate.wrapping_add(&U256::ONE).to_be_byte_array();
            if let Some(scalar) = Option::<Scalar>::from(Scalar::from_repr(repr)) {
                return scalar;
            }
        }
        counter = counter.wrapping_add(1);
    }
}

fn scalar_from_slice(bytes: &[u8]) -> Result<Scalar, VrfError> {
    let array: [u8; 32] = bytes.try_into().map_err(|_| VrfError::Invalid)?;
    Option::<Scalar>::from(Scalar::from_repr(array.into())).ok_or(VrfError::Invalid)
}

/// Public half of the VRF; sufficient to verify proofs and derive indexes.
#[derive(Clone, Debug, PartialEq)]
pub struct VrfPublicKey {
    point: ProjectivePoint,
}

impl VrfPublicKey {
    /// Parses a SEC1-encoded curve point.
    pub fn from_sec1_bytes(bytes: &[u8]) -> Result<Self, VrfError> {
        let encoded = EncodedPoint::from_bytes(bytes).map_err(|_| VrfError::MalformedKey)?;
        let point = Option::<AffinePoint>::from(AffinePoint::from_encoded_point(&encoded))
            .ok_or(VrfError::MalformedKey)?;
        Ok(Self { point: ProjectivePoint::from(point) })
    }

    /// Compressed SEC1 encoding of the public point.
    #[must_use]
    pub fn to_sec1_bytes(&self) -> Vec<u8> {
        self.point.to_affine().to_encoded_point(true).as_bytes().to_vec()
    }

    /// Checks `proof` against `alpha` and returns the 32-byte index it
    /// commits to.
    pub fn proof_to_index(&self, alpha: &[u8], proof: &[u8]) -> Result<[u8; 32], VrfError> {
        if proof.len() != PROOF_LEN {
            return Err(VrfError::Invalid);
        }
        let s = scalar_from_slice(&proof[..32])?;
        let t = scalar_from_slice(&proof[32..64])?;
        let vrf_bytes = &proof[64..];
        let encoded = EncodedPoint::from_bytes(vrf_bytes).map_err(|_| VrfError::Invalid)?;
        let vrf_point = Option::<AffinePoint>::from(AffinePoint::from_encoded_point(&encoded))
            .ok_or(VrfError::Invalid)?;
        let vrf_point = ProjectivePoint::from(vrf_point);

        // [t]G + [s]PK = [r]G and [t]H + [s]VRF = [r]H exactly when the
        // prover knew k with PK = [k]G and VRF = [k]H.
        let u = ProjectivePoint::GENERATOR * t + self.point * s;
        let h = hash_to_curve(alpha)?;
        let v = h * t + vrf_point * s;

        let mut transcript = Vec::new();
        transcript.extend_from_slice(&marshal(&ProjectivePoint::GENERATOR));
        transcript.extend_from_slice(&marshal(&h));
        transcript.extend_from_slice(&marshal(&self.point));
        transcript.extend_from_slice(vrf_bytes);
        transcript.extend_from_slice(&marshal(&u));
        transcript.extend_from_slice(&marshal(&v));
        let expected = hash_to_scalar(&transcript);

        if bool::from(expected.to_repr().as_slice().ct_eq(&proof[..32])) {
            Ok(Sha256::digest(vrf_bytes).into())
        } else {
            Err(VrfError::Invalid)
        }
    }
}

/// Private half of the VRF, held by the directory; the client verifier
/// never uses it, but key owners and fixtures evaluate with it.
#[derive(Clone)]
pub struct VrfSecretKey {
    scalar: NonZeroScalar,
}

impl VrfSecretKey {
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self, VrfError> {
        let scalar = Option::<NonZeroScalar>::from(NonZeroScalar::from_repr((*bytes).into()))
            .ok_or(VrfError::MalformedKey)?;
        Ok(Self { scalar })
    }

    #[must_use]
    pub fn public_key(&self) -> VrfPublicKey {
        VrfPublicKey { point: ProjectivePoint::GENERATOR * *self.scalar }
    }

    /// Evaluates the VRF at `alpha`, returning the index and a proof.
    pub fn evaluate(&self, alpha: &[u8]) -> Result<([u8; 32], Vec<u8>), VrfError> {
        let k = *self.scalar;
        let h = hash_to_curve(alpha)?;
        let vrf_point = h * k;
        let vrf_bytes = marshal(&vrf_point);

        let r = *NonZeroScalar::random(&mut OsRng);
        let mut transcript = Vec::new();
        transcript.extend_from_slice(&marshal(&ProjectivePoint::GENERATOR));
        transcript.extend_from_slice(&marshal(&h));
        transcript.extend_from_slice(&marshal(&(ProjectivePoint::GENERATOR * k)));
        transcript.extend_from_slice(&vrf_bytes);
        transcript.extend_from_slice(&marshal(&(ProjectivePoint::GENERATOR * r)));
        transcript.extend_from_slice(&marshal(&(h * r)));
        let s = hash_to_scalar(&transcript);
        let t = r - s * k;

        let mut proof = Vec::with_capacity(PROOF_LEN);
        proof.extend_from_slice(&s.to_repr());
        proof.extend_from_slice(&t.to_repr());
        proof.extend_from_slice(&vrf_bytes);

        Ok((Sha256::digest(&vrf_bytes).into(), proof))
    }
}

#[cfg(test)]
pub(crate) fn test_secret_key(seed: u8) -> VrfSecretKey {
    let mut bytes = [0u8; 32];
    bytes[31] = seed;
    VrfSecretKey::from_bytes(&bytes).expect("nonzero scalar")
}
