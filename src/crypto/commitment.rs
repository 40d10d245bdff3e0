use hmac::{Hmac, Mac};
use rand_core::{OsRng, RngCore};
use sha2::Sha512_256;
use subtle::ConstantTimeEq;
use thiserror::Error;

/// Length of the opening nonce in bytes.
pub const NONCE_LEN: usize = 16;

// Domain separation for profile commitments. The nonce keys the MAC so the
// commitment hides the profile until the server chooses to open it.
const COMMITMENT_PREFIX: &[u8] = b"Key Transparency Commitment";

type CommitmentMac = Hmac<Sha512_256>;

/// Errors surfaced while opening a profile commitment.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommitmentError {
    #[error("commitment does not open to the supplied profile data")]
    Mismatch,
    #[error("commitment nonce must be {NONCE_LEN} bytes, got {0}")]
    NonceLength(usize),
}

/// Draws a fresh commitment nonce from the system entropy source.
#[must_use]
pub fn generate_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Commits to `data` under `(user_id, app_id)`, keyed by `nonce`.
///
/// Identifiers are length-prefixed so no two argument tuples share an
/// input stream.
#[must_use]
pub fn commit(user_id: &str, app_id: &str, data: &[u8], nonce: &[u8; NONCE_LEN]) -> [u8; 32] {
    let mut mac = match <CommitmentMac as Mac>::new_from_slice(nonce) {
        Ok(mac) => mac,
        Err(_) => unreachable!("HMAC accepts {NONCE_LEN}-byte keys"),
    };
    mac.update(COMMITMENT_PREFIX);
    mac.update(&(user_id.len() as u32).to_be_bytes());
    mac.update(user_id.as_bytes());
    mac.update(&(app_id.len() as u32).to_be_bytes());
    mac.update(app_id.as_bytes());
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Recomputes the commitment and compares it in constant time.
pub fn verify(
    user_id: &str,
    app_id: &str,
    commitment: &[u8],
    data: &[u8],
    nonce: &[u8],
) -> Result<(), CommitmentError> {
    let nonce: &[u8; NONCE_LEN] = nonce
        .try_into()
        .map_err(|_| CommitmentError::NonceLength(nonce.len()))?;
    let expected = commit(user_id, app_id, data, nonce);
    if commitment.ct_eq(&expected).into() {
        Ok(())
    } else {
        Err(CommitmentError::Mismatch)
    }
}
