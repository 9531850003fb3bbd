//! strongroom-crypto: the key pipeline and cipher set for the container format
//!
//! ```text
//! CompositeKey (password + key file + challenge-response, ordered)
//!   └── raw key: SHA-256 over the concatenated 32-byte contributions
//!         └── Kdf::transform (AES-KDF rounds or Argon2) → TransformedKey
//!               ├── cipher key:  SHA-256(master_seed ‖ transformed)
//!               └── HMAC base:   SHA-512(master_seed ‖ transformed ‖ 0x01)
//! ```
//!
//! Payload ciphers (AES-256-CBC, Twofish-CBC, ChaCha20) live in
//! [`symmetric`]; the keystream XOR'd over protected XML values lives in
//! [`innerstream`]. All key material is zeroized on drop.

pub mod composite;
pub mod innerstream;
pub mod kdf;
pub mod keyfile;
pub mod keys;
pub mod random;
pub mod symmetric;

pub use composite::{ChallengeResponseKey, CompositeKey, PasswordKey};
pub use innerstream::{InnerStream, InnerStreamId};
pub use kdf::{AesKdf, Argon2Kdf, Argon2Variant, Kdf, TransformedKey};
pub use keyfile::KeyFileKey;
pub use keys::{cipher_key, hmac_base_key, hmac_block_key};
pub use random::{random_array, random_vec};

/// Size of every derived symmetric key (256-bit).
pub const KEY_SIZE: usize = 32;

/// Constant-time byte comparison for key material.
pub(crate) fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::ct_eq;

    #[test]
    fn ct_eq_basics() {
        assert!(ct_eq(b"same", b"same"));
        assert!(!ct_eq(b"same", b"sane"));
        assert!(!ct_eq(b"short", b"longer"));
        assert!(ct_eq(b"", b""));
    }
}
