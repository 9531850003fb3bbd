//! Inner random stream: the keystream XOR'd over protected attribute values.
//!
//! The stream key travels in the inner header (KDBX4) or outer header
//! (KDBX3). Both sides of the codec must consume the keystream in the same
//! document order; a single `InnerStream` instance per document pass
//! guarantees that.

use chacha20::ChaCha20;
use cipher::{KeyIvInit, StreamCipher};
use salsa20::Salsa20;
use sha2::{Digest, Sha256, Sha512};

use strongroom_core::{Error, Result};

/// Fixed nonce used by the legacy Salsa20 stream.
const SALSA20_NONCE: [u8; 8] = [0xE8, 0x30, 0x09, 0x4B, 0x97, 0x20, 0x5D, 0x2A];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InnerStreamId {
    /// Legacy KDBX3 default.
    Salsa20,
    /// KDBX4 default.
    ChaCha20,
}

impl InnerStreamId {
    pub fn from_u32(id: u32) -> Result<Self> {
        match id {
            2 => Ok(InnerStreamId::Salsa20),
            3 => Ok(InnerStreamId::ChaCha20),
            other => Err(Error::format(format!(
                "unsupported inner random stream id {other}"
            ))),
        }
    }

    pub fn as_u32(self) -> u32 {
        match self {
            InnerStreamId::Salsa20 => 2,
            InnerStreamId::ChaCha20 => 3,
        }
    }
}

/// One directional keystream over a whole document pass.
pub enum InnerStream {
    Salsa20(Box<Salsa20>),
    ChaCha20(Box<ChaCha20>),
}

impl InnerStream {
    /// Derive the cipher state from the raw stream key.
    ///
    /// ChaCha20: SHA-512 of the key yields 32 key bytes then 12 nonce bytes.
    /// Salsa20: SHA-256 of the key with the fixed protocol nonce.
    pub fn new(id: InnerStreamId, stream_key: &[u8]) -> Result<Self> {
        match id {
            InnerStreamId::ChaCha20 => {
                let digest = Sha512::digest(stream_key);
                let cipher = ChaCha20::new_from_slices(&digest[..32], &digest[32..44])
                    .map_err(|e| Error::crypto(format!("inner ChaCha20 init: {e}")))?;
                Ok(InnerStream::ChaCha20(Box::new(cipher)))
            }
            InnerStreamId::Salsa20 => {
                let digest = Sha256::digest(stream_key);
                let cipher = Salsa20::new_from_slices(&digest, &SALSA20_NONCE)
                    .map_err(|e| Error::crypto(format!("inner Salsa20 init: {e}")))?;
                Ok(InnerStream::Salsa20(Box::new(cipher)))
            }
        }
    }

    /// XOR the next keystream bytes over `data` in place. Encryption and
    /// decryption are the same operation.
    pub fn apply(&mut self, data: &mut [u8]) {
        match self {
            InnerStream::Salsa20(c) => c.apply_keystream(data),
            InnerStream::ChaCha20(c) => c.apply_keystream(data),
        }
    }
}
