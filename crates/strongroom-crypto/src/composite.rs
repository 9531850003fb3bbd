//! Composite credential: the ordered set of key factors.
//!
//! `raw_key` is SHA-256 over each component's 32-byte contribution in
//! insertion order, so reordering factors produces a different database key.
//! The on-disk format cannot encode the order; callers must preserve it.
//!
//! Challenge-response tokens are mixed in before the KDF: their response to
//! the file's master seed joins the digest input alongside the password and
//! key-file hashes. A composite with tokens therefore needs the master seed
//! to produce its raw key.

use std::sync::atomic::AtomicBool;

use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};
use unicode_normalization::UnicodeNormalization;
use zeroize::{Zeroize, Zeroizing};

use strongroom_core::{Error, Result};

use crate::kdf::{Kdf, TransformedKey};
use crate::keyfile::KeyFileKey;
use crate::{ct_eq, KEY_SIZE};

/// Hardware-token seam: challenged with the file's master seed, the token
/// returns a response that is folded into the composite.
pub trait ChallengeResponseKey: Send + Sync {
    fn challenge(&self, seed: &[u8]) -> Result<Vec<u8>>;
}

/// A password factor: SHA-256 of the NFC-normalized UTF-8 passphrase.
pub struct PasswordKey {
    hash: [u8; KEY_SIZE],
}

impl PasswordKey {
    pub fn new(password: SecretString) -> Self {
        let mut normalized: String = password.expose_secret().nfc().collect();
        let hash = Sha256::digest(normalized.as_bytes()).into();
        normalized.zeroize();
        Self { hash }
    }

    pub fn raw(&self) -> &[u8; KEY_SIZE] {
        &self.hash
    }
}

impl Drop for PasswordKey {
    fn drop(&mut self) {
        self.hash.zeroize();
    }
}

impl std::fmt::Debug for PasswordKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PasswordKey")
            .field("hash", &"[REDACTED]")
            .finish()
    }
}

enum KeyComponent {
    Password(PasswordKey),
    KeyFile(KeyFileKey),
    ChallengeResponse(Box<dyn ChallengeResponseKey>),
}

/// Ordered collection of key factors.
#[derive(Default)]
pub struct CompositeKey {
    components: Vec<KeyComponent>,
}

impl CompositeKey {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_password(password: impl Into<String>) -> Self {
        let mut key = Self::new();
        key.add_password(SecretString::from(password.into()));
        key
    }

    pub fn add_password(&mut self, password: SecretString) {
        self.components
            .push(KeyComponent::Password(PasswordKey::new(password)));
    }

    pub fn add_key_file(&mut self, key_file: KeyFileKey) {
        self.components.push(KeyComponent::KeyFile(key_file));
    }

    pub fn add_challenge_response(&mut self, token: Box<dyn ChallengeResponseKey>) {
        self.components.push(KeyComponent::ChallengeResponse(token));
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    pub fn component_count(&self) -> usize {
        self.components.len()
    }

    pub fn has_challenge_response(&self) -> bool {
        self.components
            .iter()
            .any(|c| matches!(c, KeyComponent::ChallengeResponse(_)))
    }

    /// SHA-256 over all component contributions in order.
    ///
    /// `challenge_seed` is the file's master seed. Without it, token
    /// components are skipped, which matches the identity used for key
    /// equality (a token's response is seed-dependent and cannot take part).
    pub fn raw_key(&self, challenge_seed: Option<&[u8]>) -> Result<Zeroizing<[u8; KEY_SIZE]>> {
        let mut hasher = Sha256::new();
        for component in &self.components {
            match component {
                KeyComponent::Password(key) => hasher.update(key.raw()),
                KeyComponent::KeyFile(key) => hasher.update(key.raw()),
                KeyComponent::ChallengeResponse(token) => {
                    if let Some(seed) = challenge_seed {
                        let mut response = token
                            .challenge(seed)
                            .map_err(|e| Error::crypto(format!("challenge-response: {e}")))?;
                        hasher.update(&response);
                        response.zeroize();
                    }
                }
            }
        }
        Ok(Zeroizing::new(hasher.finalize().into()))
    }

    /// Run the expensive key transform. The only place the composite meets
    /// slow cryptography.
    pub fn transform(
        &self,
        kdf: &Kdf,
        challenge_seed: Option<&[u8]>,
        abort: Option<&AtomicBool>,
    ) -> Result<TransformedKey> {
        let raw = self.raw_key(challenge_seed)?;
        kdf.transform(&raw, abort)
    }
}

impl PartialEq for CompositeKey {
    /// Value equality on the seed-independent raw key, in constant time.
    fn eq(&self, other: &Self) -> bool {
        match (self.raw_key(None), other.raw_key(None)) {
            (Ok(a), Ok(b)) => ct_eq(a.as_ref(), b.as_ref()),
            _ => false,
        }
    }
}

impl Eq for CompositeKey {}

impl std::fmt::Debug for CompositeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeKey")
            .field("components", &self.components.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kdf::AesKdf;

    struct FakeToken {
        fill: u8,
    }

    impl ChallengeResponseKey for FakeToken {
        fn challenge(&self, seed: &[u8]) -> Result<Vec<u8>> {
            // deterministic stand-in: response depends on seed and token
            let mut h = Sha256::new();
            h.update([self.fill]);
            h.update(seed);
            Ok(h.finalize().to_vec())
        }
    }

    #[test]
    fn password_is_nfc_normalized() {
        // U+00E9 (é) vs U+0065 U+0301 (e + combining acute) must agree
        let composed = CompositeKey::from_password("caf\u{e9}");
        let decomposed = CompositeKey::from_password("cafe\u{301}");
        assert_eq!(
            composed.raw_key(None).unwrap().as_ref(),
            decomposed.raw_key(None).unwrap().as_ref()
        );
    }

    #[test]
    fn component_order_matters() {
        let mut a = CompositeKey::new();
        a.add_password(SecretString::from("one"));
        a.add_key_file(KeyFileKey::parse(b"some key file").unwrap());

        let mut b = CompositeKey::new();
        b.add_key_file(KeyFileKey::parse(b"some key file").unwrap());
        b.add_password(SecretString::from("one"));

        assert_ne!(
            a.raw_key(None).unwrap().as_ref(),
            b.raw_key(None).unwrap().as_ref()
        );
        assert_ne!(a, b);
    }

    #[test]
    fn equality_is_by_value() {
        let a = CompositeKey::from_password("correct horse");
        let b = CompositeKey::from_password("correct horse");
        let c = CompositeKey::from_password("battery staple");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn challenge_response_mixes_with_seed() {
        let mut key = CompositeKey::from_password("pw");
        key.add_challenge_response(Box::new(FakeToken { fill: 7 }));

        let with_seed_a = key.raw_key(Some(&[1u8; 32])).unwrap();
        let with_seed_b = key.raw_key(Some(&[2u8; 32])).unwrap();
        let without = key.raw_key(None).unwrap();

        assert_ne!(with_seed_a.as_ref(), with_seed_b.as_ref());
        assert_ne!(with_seed_a.as_ref(), without.as_ref());
    }

    #[test]
    fn transform_produces_stable_output() {
        let kdf = Kdf::Aes(AesKdf {
            rounds: 1000,
            seed: [4u8; 32],
        });
        let key = CompositeKey::from_password("hunter2");
        let a = key.transform(&kdf, None, None).unwrap();
        let b = key.transform(&kdf, None, None).unwrap();
        assert_eq!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn empty_composite_still_hashes() {
        let key = CompositeKey::new();
        assert!(key.is_empty());
        let raw = key.raw_key(None).unwrap();
        let expected: [u8; 32] = Sha256::digest([]).into();
        assert_eq!(raw.as_ref(), &expected);
    }
}
