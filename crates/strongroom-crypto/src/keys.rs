//! Final key derivations binding the master seed to the transformed key.
//!
//! ```text
//! cipher key      = SHA-256(master_seed ‖ transformed_key)
//! HMAC base key   = SHA-512(master_seed ‖ transformed_key ‖ 0x01)
//! block HMAC key  = SHA-512(block_index_u64_le ‖ HMAC base key)
//! ```
//!
//! The header HMAC uses block index `u64::MAX`.

use sha2::{Digest, Sha256, Sha512};
use zeroize::Zeroizing;

use crate::kdf::TransformedKey;
use crate::KEY_SIZE;

/// Block index reserved for the outer header HMAC.
pub const HEADER_HMAC_INDEX: u64 = u64::MAX;

pub fn cipher_key(master_seed: &[u8], transformed: &TransformedKey) -> Zeroizing<[u8; KEY_SIZE]> {
    let mut hasher = Sha256::new();
    hasher.update(master_seed);
    hasher.update(transformed.as_bytes());
    Zeroizing::new(hasher.finalize().into())
}

pub fn hmac_base_key(master_seed: &[u8], transformed: &TransformedKey) -> Zeroizing<[u8; 64]> {
    let mut hasher = Sha512::new();
    hasher.update(master_seed);
    hasher.update(transformed.as_bytes());
    hasher.update([0x01]);
    wide(hasher)
}

pub fn hmac_block_key(block_index: u64, base_key: &[u8; 64]) -> Zeroizing<[u8; 64]> {
    let mut hasher = Sha512::new();
    hasher.update(block_index.to_le_bytes());
    hasher.update(base_key);
    wide(hasher)
}

fn wide(hasher: Sha512) -> Zeroizing<[u8; 64]> {
    let digest = hasher.finalize();
    let mut out = Zeroizing::new([0u8; 64]);
    out.copy_from_slice(&digest);
    out
}
