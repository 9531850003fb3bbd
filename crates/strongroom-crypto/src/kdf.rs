//! Key derivation: composite raw key → transformed master key.
//!
//! Two closed variants selected by the KDF UUID in the header parameters:
//! AES-KDF (legacy, per-round AES-256 of the composite under the transform
//! seed) and Argon2 (salt = transform seed). Both poll a cooperative abort
//! flag; an aborted transform leaves the database untouched.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes256;
use argon2::{Algorithm, Argon2, Params, Version};
use sha2::{Digest, Sha256};
use tracing::debug;
use zeroize::Zeroize;

use strongroom_core::{Error, Result, Variant, VariantDictionary};

use crate::random::random_array;
use crate::KEY_SIZE;

/// KDF UUID for AES-KDF (`c9d9f39a-628a-4460-bf74-0d08c18a4fea`).
pub const KDF_AES: [u8; 16] = [
    0xc9, 0xd9, 0xf3, 0x9a, 0x62, 0x8a, 0x44, 0x60, 0xbf, 0x74, 0x0d, 0x08, 0xc1, 0x8a, 0x4f, 0xea,
];

/// KDF UUID for Argon2d (`ef636ddf-8c29-444b-91f7-a9a403e30a0c`).
pub const KDF_ARGON2D: [u8; 16] = [
    0xef, 0x63, 0x6d, 0xdf, 0x8c, 0x29, 0x44, 0x4b, 0x91, 0xf7, 0xa9, 0xa4, 0x03, 0xe3, 0x0a, 0x0c,
];

/// KDF UUID for Argon2id (`9e298b19-56db-4773-b23d-fc3ec6f0a1e6`).
pub const KDF_ARGON2ID: [u8; 16] = [
    0x9e, 0x29, 0x8b, 0x19, 0x56, 0xdb, 0x47, 0x73, 0xb2, 0x3d, 0xfc, 0x3e, 0xc6, 0xf0, 0xa1, 0xe6,
];

/// How many AES-KDF rounds run between abort-flag polls.
const AES_ABORT_GRANULARITY: u64 = 4096;

/// The 256-bit KDF output used as the symmetric base key.
///
/// Zeroized on drop so the master secret does not linger after lock.
#[derive(Clone, PartialEq, Eq)]
pub struct TransformedKey {
    bytes: [u8; KEY_SIZE],
}

impl TransformedKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for TransformedKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for TransformedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransformedKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AesKdf {
    pub rounds: u64,
    pub seed: [u8; KEY_SIZE],
}

impl Default for AesKdf {
    fn default() -> Self {
        Self {
            rounds: 600_000,
            seed: random_array(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Argon2Variant {
    Argon2d,
    Argon2id,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Argon2Kdf {
    pub variant: Argon2Variant,
    /// Memory cost in bytes, as stored in the header parameters.
    pub memory_bytes: u64,
    pub iterations: u64,
    pub parallelism: u32,
    /// Argon2 version tag (0x10 or 0x13).
    pub version: u32,
    pub salt: [u8; KEY_SIZE],
}

impl Default for Argon2Kdf {
    fn default() -> Self {
        Self {
            variant: Argon2Variant::Argon2d,
            memory_bytes: 64 * 1024 * 1024,
            iterations: 10,
            parallelism: 2,
            version: 0x13,
            salt: random_array(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Kdf {
    Aes(AesKdf),
    Argon2(Argon2Kdf),
}

impl Default for Kdf {
    fn default() -> Self {
        Kdf::Aes(AesKdf::default())
    }
}

impl Kdf {
    pub fn uuid(&self) -> [u8; 16] {
        match self {
            Kdf::Aes(_) => KDF_AES,
            Kdf::Argon2(kdf) => match kdf.variant {
                Argon2Variant::Argon2d => KDF_ARGON2D,
                Argon2Variant::Argon2id => KDF_ARGON2ID,
            },
        }
    }

    /// The expensive step: derive the transformed master key.
    ///
    /// `abort` is polled between AES rounds (and checked around an Argon2
    /// run, which cannot be interrupted mid-flight). Aborting returns
    /// [`Error::Cancelled`] and produces no key material.
    pub fn transform(
        &self,
        raw_key: &[u8; KEY_SIZE],
        abort: Option<&AtomicBool>,
    ) -> Result<TransformedKey> {
        if aborted(abort) {
            return Err(Error::Cancelled);
        }
        match self {
            Kdf::Aes(kdf) => transform_aes(kdf, raw_key, abort),
            Kdf::Argon2(kdf) => {
                let key = transform_argon2(kdf, raw_key)?;
                if aborted(abort) {
                    return Err(Error::Cancelled);
                }
                Ok(key)
            }
        }
    }

    /// Replace the transform seed/salt with fresh CSPRNG bytes. Called on
    /// every save and on `change_kdf`.
    pub fn randomize_seed(&mut self) {
        match self {
            Kdf::Aes(kdf) => kdf.seed = random_array(),
            Kdf::Argon2(kdf) => kdf.salt = random_array(),
        }
    }

    /// Tune the cost parameter so one transform takes roughly `target_ms`
    /// on this machine. Returns an adjusted copy; the seed is untouched.
    pub fn benchmark(&self, target_ms: u64) -> Kdf {
        let target_ms = target_ms.max(1);
        match self {
            Kdf::Aes(kdf) => {
                let probe = AesKdf {
                    rounds: 100_000,
                    seed: kdf.seed,
                };
                let raw = [0x55u8; KEY_SIZE];
                let start = Instant::now();
                let _ = transform_aes(&probe, &raw, None);
                let elapsed_ms = start.elapsed().as_millis().max(1) as u64;
                let rounds = (probe.rounds * target_ms / elapsed_ms).max(10_000);
                debug!(rounds, elapsed_ms, "AES-KDF benchmark");
                Kdf::Aes(AesKdf {
                    rounds,
                    seed: kdf.seed,
                })
            }
            Kdf::Argon2(kdf) => {
                let probe = Argon2Kdf {
                    iterations: 1,
                    ..kdf.clone()
                };
                let raw = [0x55u8; KEY_SIZE];
                let start = Instant::now();
                let _ = transform_argon2(&probe, &raw);
                let elapsed_ms = start.elapsed().as_millis().max(1) as u64;
                let iterations = (target_ms / elapsed_ms).max(1);
                debug!(iterations, elapsed_ms, "Argon2 benchmark");
                Kdf::Argon2(Argon2Kdf {
                    iterations,
                    ..kdf.clone()
                })
            }
        }
    }

    /// Serialize to the header's KDF parameter dictionary.
    pub fn to_params(&self) -> VariantDictionary {
        let mut dict = VariantDictionary::new();
        dict.set("$UUID", Variant::Bytes(self.uuid().to_vec()));
        match self {
            Kdf::Aes(kdf) => {
                dict.set("R", Variant::U64(kdf.rounds));
                dict.set("S", Variant::Bytes(kdf.seed.to_vec()));
            }
            Kdf::Argon2(kdf) => {
                dict.set("S", Variant::Bytes(kdf.salt.to_vec()));
                dict.set("P", Variant::U32(kdf.parallelism));
                dict.set("M", Variant::U64(kdf.memory_bytes));
                dict.set("I", Variant::U64(kdf.iterations));
                dict.set("V", Variant::U32(kdf.version));
            }
        }
        dict
    }

    pub fn from_params(dict: &VariantDictionary) -> Result<Kdf> {
        let uuid: [u8; 16] = dict
            .get_bytes("$UUID")
            .and_then(|raw| raw.try_into().ok())
            .ok_or_else(|| Error::format("KDF parameters missing $UUID"))?;
        if uuid == KDF_AES {
            let rounds = dict
                .get_u64("R")
                .ok_or_else(|| Error::format("AES-KDF parameters missing rounds"))?;
            let seed = dict
                .get_bytes("S")
                .and_then(|s| <[u8; KEY_SIZE]>::try_from(s).ok())
                .ok_or_else(|| Error::format("AES-KDF parameters missing 32-byte seed"))?;
            return Ok(Kdf::Aes(AesKdf { rounds, seed }));
        }

        let variant = if uuid == KDF_ARGON2D {
            Argon2Variant::Argon2d
        } else if uuid == KDF_ARGON2ID {
            Argon2Variant::Argon2id
        } else {
            return Err(Error::format("unknown KDF UUID"));
        };
        let salt = dict
            .get_bytes("S")
            .and_then(|s| <[u8; KEY_SIZE]>::try_from(s).ok())
            .ok_or_else(|| Error::format("Argon2 parameters missing 32-byte salt"))?;
        let kdf = Argon2Kdf {
            variant,
            memory_bytes: dict
                .get_u64("M")
                .ok_or_else(|| Error::format("Argon2 parameters missing memory cost"))?,
            iterations: dict
                .get_u64("I")
                .ok_or_else(|| Error::format("Argon2 parameters missing iterations"))?,
            parallelism: dict
                .get_u32("P")
                .ok_or_else(|| Error::format("Argon2 parameters missing parallelism"))?,
            version: dict
                .get_u32("V")
                .ok_or_else(|| Error::format("Argon2 parameters missing version"))?,
            salt,
        };
        Ok(Kdf::Argon2(kdf))
    }
}

fn aborted(flag: Option<&AtomicBool>) -> bool {
    flag.is_some_and(|f| f.load(Ordering::Relaxed))
}

fn transform_aes(
    kdf: &AesKdf,
    raw_key: &[u8; KEY_SIZE],
    abort: Option<&AtomicBool>,
) -> Result<TransformedKey> {
    let cipher = Aes256::new_from_slice(&kdf.seed)
        .map_err(|e| Error::crypto(format!("AES-KDF seed: {e}")))?;

    let mut lo = GenericArray::clone_from_slice(&raw_key[..16]);
    let mut hi = GenericArray::clone_from_slice(&raw_key[16..]);

    let mut remaining = kdf.rounds;
    while remaining > 0 {
        let chunk = remaining.min(AES_ABORT_GRANULARITY);
        for _ in 0..chunk {
            cipher.encrypt_block(&mut lo);
            cipher.encrypt_block(&mut hi);
        }
        remaining -= chunk;
        if aborted(abort) {
            lo.fill(0);
            hi.fill(0);
            return Err(Error::Cancelled);
        }
    }

    let mut hasher = Sha256::new();
    hasher.update(&lo);
    hasher.update(&hi);
    lo.fill(0);
    hi.fill(0);
    Ok(TransformedKey::from_bytes(hasher.finalize().into()))
}

fn transform_argon2(kdf: &Argon2Kdf, raw_key: &[u8; KEY_SIZE]) -> Result<TransformedKey> {
    let memory_kib = u32::try_from(kdf.memory_bytes / 1024)
        .map_err(|_| Error::crypto("Argon2 memory cost out of range"))?;
    let iterations = u32::try_from(kdf.iterations)
        .map_err(|_| Error::crypto("Argon2 iteration count out of range"))?;
    let params = Params::new(memory_kib, iterations, kdf.parallelism, Some(KEY_SIZE))
        .map_err(|e| Error::crypto(format!("Argon2 parameters: {e}")))?;
    let version = match kdf.version {
        0x10 => Version::V0x10,
        0x13 => Version::V0x13,
        other => return Err(Error::crypto(format!("unknown Argon2 version {other:#x}"))),
    };
    let algorithm = match kdf.variant {
        Argon2Variant::Argon2d => Algorithm::Argon2d,
        Argon2Variant::Argon2id => Algorithm::Argon2id,
    };

    let argon2 = Argon2::new(algorithm, version, params);
    let mut out = [0u8; KEY_SIZE];
    argon2
        .hash_password_into(raw_key, &kdf.salt, &mut out)
        .map_err(|e| Error::crypto(format!("Argon2 transform: {e}")))?;
    Ok(TransformedKey::from_bytes(out))
}
