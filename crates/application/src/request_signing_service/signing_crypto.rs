use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use fleetguard_core::{AppError, AppResult};

type HmacSha256 = Hmac<Sha256>;

/// Length of generated nonces in bytes before hex encoding.
const NONCE_BYTES: usize = 16;

/// Longest nonce accepted from callers, in hex characters.
pub(super) const MAX_NONCE_LENGTH: usize = 128;

/// Generates a random hex nonce from the operating system RNG.
pub(super) fn generate_nonce() -> AppResult<String> {
    let mut bytes = [0u8; NONCE_BYTES];
    getrandom::fill(&mut bytes)
        .map_err(|error| AppError::Internal(format!("failed to generate nonce: {error}")))?;

    Ok(hex::encode(bytes))
}

/// Computes the hex HMAC-SHA256 of `message` under `secret`.
pub(super) fn compute_signature(secret: &[u8], message: &[u8]) -> AppResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|error| AppError::Validation(format!("invalid signing secret: {error}")))?;
    mac.update(message);

    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Checks a hex signature in constant time. Malformed hex never matches.
pub(super) fn signature_matches(secret: &[u8], message: &[u8], signature_hex: &str) -> bool {
    let Ok(signature) = hex::decode(signature_hex) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    mac.update(message);

    mac.verify_slice(signature.as_slice()).is_ok()
}

/// Returns whether a caller-supplied nonce is well formed.
pub(super) fn is_well_formed_nonce(nonce: &str) -> bool {
    !nonce.is_empty()
        && nonce.len() <= MAX_NONCE_LENGTH
        && nonce.bytes().all(|byte| byte.is_ascii_hexdigit())
}

/// Computes a short SHA-256 fingerprint of arbitrary client attributes.
#[must_use]
pub fn fingerprint(value: &str) -> String {
    let digest = hex::encode(Sha256::digest(value.as_bytes()));
    digest[..16].to_owned()
}
