use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use sha2::{Digest, Sha256};
use signature::hazmat::{PrehashSigner, PrehashVerifier};
use thiserror::Error;

use crate::api::{DigitallySigned, PublicKey, ALGORITHM_ECDSA_P256};
use crate::crypto::objecthash::{object_hash, Value};

/// Errors surfaced while signing or verifying canonicalized objects.
#[derive(Debug, Error)]
pub enum SignError {
    #[error("signature algorithm {0} is not supported")]
    UnsupportedAlgorithm(i32),
    #[error("malformed public key encoding")]
    MalformedKey,
    #[error("malformed signature encoding")]
    MalformedSignature,
    #[error("signature rejected")]
    Invalid,
    #[error("signing failed")]
    Signing,
}

/// Derives the opaque key id for a verifying key: the hex digest of its
/// compressed SEC1 encoding.
#[must_use]
pub fn key_id(key: &VerifyingKey) -> String {
    let encoded = key.to_encoded_point(true);
    hex::encode(Sha256::digest(encoded.as_bytes()))
}

/// Parses a SEC1-encoded P-256 verifying key.
pub fn verifying_key_from_sec1(bytes: &[u8]) -> Result<VerifyingKey, SignError> {
    VerifyingKey::from_sec1_bytes(bytes).map_err(|_| SignError::MalformedKey)
}

/// Resolves an authorized-key record into a verifying key.
pub fn verifying_key_from_public(key: &PublicKey) -> Result<VerifyingKey, SignError> {
    if key.algorithm != ALGORITHM_ECDSA_P256 {
        return Err(SignError::UnsupportedAlgorithm(key.algorithm));
    }
    verifying_key_from_sec1(&key.material)
}

/// Signs canonicalized objects with a P-256 key.
///
/// The object is lowered to its canonical form by the caller (with any
/// in-band signature field cleared), object-hashed, and the 32-byte digest
/// is signed directly.
#[derive(Clone)]
pub struct ObjectSigner {
    key: SigningKey,
    key_id: String,
}

impl ObjectSigner {
    #[must_use]
    pub fn new(key: SigningKey) -> Self {
        let key_id = key_id(key.verifying_key());
        Self { key, key_id }
    }

    #[must_use]
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    #[must_use]
    pub fn verifying_key(&self) -> &VerifyingKey {
        self.key.verifying_key()
    }

    /// Returns the authorized-key record for this signer.
    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            key_id: self.key_id.clone(),
            algorithm: ALGORITHM_ECDSA_P256,
            material: self.verifying_key().to_encoded_point(true).as_bytes().to_vec(),
        }
    }

    pub fn sign(&self, value: &Value) -> Result<DigitallySigned, SignError> {
        let digest = object_hash(value);
        let signature: Signature = self.key.sign_prehash(&digest).map_err(|_| SignError::Signing)?;
        Ok(DigitallySigned {
            algorithm: ALGORITHM_ECDSA_P256,
            signature: signature.to_der().as_bytes().to_vec(),
        })
    }
}

/// Verifies a signature over the canonical form of `value`.
pub fn verify_object(
    key: &VerifyingKey,
    value: &Value,
    signature: &DigitallySigned,
) -> Result<(), SignError> {
    if signature.algorithm != ALGORITHM_ECDSA_P256 {
        return Err(SignError::UnsupportedAlgorithm(signature.algorithm));
    }
    let parsed = Signature::from_der(&signature.signature).map_err(|_| SignError::MalformedSignature)?;
    let digest = object_hash(value);
    key.verify_prehash(&digest, &parsed).map_err(|_| SignError::Invalid)
}

#[cfg(test)]
pub(crate) fn test_signer(seed: u8) -> ObjectSigner {
    let mut bytes = [0u8; 32];
    bytes[31] = seed;
    let key = SigningKey::from_bytes(&bytes.into()).expect("nonzero scalar");
    ObjectSigner::new(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::Entry;

    fn sample_entry() -> Entry {
        Entry {
            index: vec![5; 32],
            commitment: vec![6; 32],
            previous: vec![7; 32],
            ..Default::default()
        }
    }

    #[test]
    fn sign_verify_round_trip() {
        let signer = test_signer(42);
        let entry = sample_entry();
        let value = entry.canonical_value(true);
        let signature = signer.sign(&value).expect("signing succeeds");
        verify_object(signer.verifying_key(), &value, &signature).expect("signature verifies");
    }

    #[test]
    fn any_field_edit_invalidates_the_signature() {
        let signer = test_signer(42);
        let entry = sample_entry();
        let signature = signer.sign(&entry.canonical_value(true)).expect("signing succeeds");

        let mut edited = entry;
        edited.commitment[0] ^= 1;
        let err = verify_object(signer.verifying_key(), &edited.canonical_value(true), &signature)
            .expect_err("edited object must not verify");
        assert!(matches!(err, SignError::Invalid));
    }

    #[test]
    fn wrong_key_is_rejected() {
        let signer = test_signer(42);
        let other = test_signer(43);
        let value = sample_entry().canonical_value(true);
        let signature = signer.sign(&value).expect("signing succeeds");
        assert!(matches!(
            verify_object(other.verifying_key(), &value, &signature),
            Err(SignError::Invalid)
        ));
    }

    #[test]
    fn key_id_is_stable_and_distinct() {
        let a = test_signer(1);
        let b = test_signer(2);
        assert_eq!(a.key_id(), key_id(a.verifying_key()));
        assert_ne!(a.key_id(), b.key_id());
        assert_eq!(a.public_key().key_id, a.key_id());
    }

    #[test]
    fn unsupported_algorithm_is_rejected() {
        let signer = test_signer(42);
        let value = sample_entry().canonical_value(true);
        let mut signature = signer.sign(&value).expect("signing succeeds");
        signature.algorithm = 99;
        assert!(matches!(
            verify_object(signer.verifying_key(), &value, &signature),
            Err(SignError::UnsupportedAlgorithm(99))
        ));
    }
}
