//! HMAC-authenticated block stream framing the ciphertext.
//!
//! ```text
//! block := hmac (32) | size (u32 LE) | data (size)
//! ```
//! Each block's HMAC-SHA-256 covers `index_u64_le ‖ size ‖ data` under a key
//! derived from the block index; a zero-size block terminates the stream.
//! Any mismatch is reported as corruption — at this point the header HMAC
//! already proved the credentials, so a bad block means a damaged file.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use strongroom_core::{Error, Result};
use strongroom_crypto::keys::hmac_block_key;

use crate::cursor::Cursor;

type HmacSha256 = Hmac<Sha256>;

/// Writers split the ciphertext into blocks of this size.
pub const BLOCK_SIZE: usize = 1024 * 1024;

pub fn compute_block_hmac(index: u64, data: &[u8], base_key: &[u8; 64]) -> [u8; 32] {
    let key = hmac_block_key(index, base_key);
    let mut mac = HmacSha256::new_from_slice(key.as_ref()).expect("HMAC accepts any key length");
    mac.update(&index.to_le_bytes());
    mac.update(&(data.len() as u32).to_le_bytes());
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Frame `ciphertext` into authenticated blocks, including the terminator.
pub fn write_blocks(ciphertext: &[u8], base_key: &[u8; 64], out: &mut Vec<u8>) {
    let mut index: u64 = 0;
    for chunk in ciphertext.chunks(BLOCK_SIZE) {
        write_one(out, index, chunk, base_key);
        index += 1;
    }
    write_one(out, index, &[], base_key);
}

fn write_one(out: &mut Vec<u8>, index: u64, data: &[u8], base_key: &[u8; 64]) {
    out.extend_from_slice(&compute_block_hmac(index, data, base_key));
    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
    out.extend_from_slice(data);
}

/// Read and verify every block up to the terminator, returning the
/// concatenated ciphertext.
pub fn read_blocks(cursor: &mut Cursor<'_>, base_key: &[u8; 64]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(cursor.remaining());
    let mut index: u64 = 0;
    loop {
        let stored_hmac = cursor.take(32)?;
        let size = cursor.read_u32()? as usize;
        let data = cursor.take(size)?;
        let expected = compute_block_hmac(index, data, base_key);
        if !constant_time_eq(stored_hmac, &expected) {
            return Err(Error::corruption(format!("block {index} failed its HMAC")));
        }
        if size == 0 {
            return Ok(out);
        }
        out.extend_from_slice(data);
        index += 1;
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
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
    use super::*;

    const BASE: [u8; 64] = [7u8; 64];

    fn frame(data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        write_blocks(data, &BASE, &mut out);
        out
    }

    #[test]
    fn roundtrip_small_and_empty() {
        for payload in [&b""[..], &b"x"[..], &vec![0xAB; 100_000][..]] {
            let framed = frame(payload);
            let mut cursor = Cursor::new(&framed);
            let read = read_blocks(&mut cursor, &BASE).unwrap();
            assert_eq!(read, payload);
            assert_eq!(cursor.remaining(), 0, "terminator consumed");
        }
    }

    #[test]
    fn multi_block_payload_roundtrips() {
        let payload = vec![0x5A; BLOCK_SIZE + BLOCK_SIZE / 2];
        let framed = frame(&payload);
        let mut cursor = Cursor::new(&framed);
        assert_eq!(read_blocks(&mut cursor, &BASE).unwrap(), payload);
    }

    #[test]
    fn any_flipped_bit_is_detected() {
        let framed = frame(b"sensitive ciphertext");
        for position in [0, 31, 32, 35, 40, framed.len() - 1] {
            let mut tampered = framed.clone();
            tampered[position] ^= 0x01;
            let mut cursor = Cursor::new(&tampered);
            let result = read_blocks(&mut cursor, &BASE);
            assert!(
                matches!(result, Err(Error::Corruption(_)) | Err(Error::Format(_))),
                "bit flip at {position} went undetected"
            );
        }
    }

    #[test]
    fn wrong_base_key_is_corruption() {
        let framed = frame(b"payload");
        let other = [8u8; 64];
        let mut cursor = Cursor::new(&framed);
        assert!(matches!(
            read_blocks(&mut cursor, &other),
            Err(Error::Corruption(_))
        ));
    }

    #[test]
    fn truncation_is_detected() {
        let framed = frame(b"payload");
        let mut cursor = Cursor::new(&framed[..framed.len() - 10]);
        assert!(read_blocks(&mut cursor, &BASE).is_err());
    }
}
