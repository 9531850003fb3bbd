//! Outer header: magic words, version, and the TLV field sequence.
//!
//! KDBX4 layout:
//! ```text
//! Offset  Size  Field
//!      0     4  signature 1    (0x9AA2D903, stored little-endian)
//!      4     4  signature 2    (0xB54BFB67)
//!      8     4  version        (minor in the low word, major in the high)
//!     12     …  TLV fields:    id (u8) | size (u32 LE) | data
//!                              terminated by the EndOfHeader field
//!      then  32  SHA-256 of every header byte above
//!      then  32  HMAC-SHA-256 of the same bytes (KDBX4 only)
//! ```
//! KDBX3 uses the same TLV ids with 16-bit sizes and no trailing hashes.

use strongroom_core::{Error, Result, VariantDictionary};
use strongroom_crypto::symmetric::CipherKind;
use strongroom_model::Compression;

use crate::cursor::Cursor;
use crate::{SIGNATURE_1, SIGNATURE_2, VERSION_4_0};

pub mod field {
    pub const END_OF_HEADER: u8 = 0;
    pub const COMMENT: u8 = 1;
    pub const CIPHER_ID: u8 = 2;
    pub const COMPRESSION_FLAGS: u8 = 3;
    pub const MASTER_SEED: u8 = 4;
    pub const TRANSFORM_SEED: u8 = 5;
    pub const TRANSFORM_ROUNDS: u8 = 6;
    pub const ENCRYPTION_IV: u8 = 7;
    pub const PROTECTED_STREAM_KEY: u8 = 8;
    pub const STREAM_START_BYTES: u8 = 9;
    pub const INNER_RANDOM_STREAM_ID: u8 = 10;
    pub const KDF_PARAMETERS: u8 = 11;
    pub const PUBLIC_CUSTOM_DATA: u8 = 12;
}

/// Verify the magic words and return the version field.
pub fn read_signature(data: &[u8]) -> Result<u32> {
    let mut cursor = Cursor::new(data);
    let sig1 = cursor.read_u32()?;
    let sig2 = cursor.read_u32()?;
    if sig1 != SIGNATURE_1 || sig2 != SIGNATURE_2 {
        return Err(Error::format("not a KeePass database (magic mismatch)"));
    }
    cursor.read_u32()
}

/// Parsed KDBX4 outer header.
#[derive(Debug)]
pub struct OuterHeader {
    pub cipher: CipherKind,
    pub compression: Compression,
    pub master_seed: [u8; 32],
    pub encryption_iv: Vec<u8>,
    pub kdf_params: VariantDictionary,
    pub public_custom_data: VariantDictionary,
}

/// Read the KDBX4 header TLVs. Returns the header and the byte length of the
/// raw header (signatures through the end-of-header field) for integrity
/// checks.
pub fn read_outer_header(data: &[u8]) -> Result<(OuterHeader, usize)> {
    let mut cursor = Cursor::new(data);
    // signatures and version were validated by the dispatcher
    cursor.take(12)?;

    let mut cipher = None;
    let mut compression = None;
    let mut master_seed = None;
    let mut encryption_iv = None;
    let mut kdf_params = None;
    let mut public_custom_data = None;

    loop {
        let id = cursor.read_u8()?;
        let size = cursor.read_u32()? as usize;
        let value = cursor.take(size)?;
        match id {
            field::END_OF_HEADER => break,
            field::COMMENT => {}
            field::CIPHER_ID => cipher = Some(CipherKind::from_uuid(value)?),
            field::COMPRESSION_FLAGS => {
                let mut c = Cursor::new(value);
                compression = Some(Compression::from_u32(c.read_u32()?)?);
            }
            field::MASTER_SEED => {
                master_seed = Some(
                    <[u8; 32]>::try_from(value)
                        .map_err(|_| Error::format("master seed must be 32 bytes"))?,
                );
            }
            field::ENCRYPTION_IV => encryption_iv = Some(value.to_vec()),
            field::KDF_PARAMETERS => {
                kdf_params = Some(VariantDictionary::from_bytes(value)?);
            }
            field::PUBLIC_CUSTOM_DATA => {
                public_custom_data = Some(VariantDictionary::from_bytes(value)?);
            }
            field::TRANSFORM_SEED
            | field::TRANSFORM_ROUNDS
            | field::PROTECTED_STREAM_KEY
            | field::STREAM_START_BYTES
            | field::INNER_RANDOM_STREAM_ID => {
                return Err(Error::format(format!(
                    "legacy header field {id} in a KDBX4 file"
                )));
            }
            other => {
                return Err(Error::format(format!("unknown header field {other}")));
            }
        }
    }

    let header = OuterHeader {
        cipher: cipher.ok_or_else(|| Error::format("header missing cipher id"))?,
        compression: compression.ok_or_else(|| Error::format("header missing compression"))?,
        master_seed: master_seed.ok_or_else(|| Error::format("header missing master seed"))?,
        encryption_iv: encryption_iv
            .ok_or_else(|| Error::format("header missing encryption IV"))?,
        kdf_params: kdf_params.ok_or_else(|| Error::format("header missing KDF parameters"))?,
        public_custom_data: public_custom_data.unwrap_or_default(),
    };
    if header.encryption_iv.len() != header.cipher.iv_len() {
        return Err(Error::format("encryption IV length does not match cipher"));
    }
    Ok((header, cursor.position()))
}

/// Serialize the KDBX4 header: signatures, version, and TLV fields.
pub fn write_outer_header(header: &OuterHeader) -> Vec<u8> {
    let mut out = Vec::with_capacity(256);
    out.extend_from_slice(&SIGNATURE_1.to_le_bytes());
    out.extend_from_slice(&SIGNATURE_2.to_le_bytes());
    out.extend_from_slice(&VERSION_4_0.to_le_bytes());

    write_field(&mut out, field::CIPHER_ID, &header.cipher.uuid());
    write_field(
        &mut out,
        field::COMPRESSION_FLAGS,
        &header.compression.as_u32().to_le_bytes(),
    );
    write_field(&mut out, field::MASTER_SEED, &header.master_seed);
    write_field(&mut out, field::ENCRYPTION_IV, &header.encryption_iv);
    write_field(
        &mut out,
        field::KDF_PARAMETERS,
        &header.kdf_params.to_bytes(),
    );
    if !header.public_custom_data.is_empty() {
        write_field(
            &mut out,
            field::PUBLIC_CUSTOM_DATA,
            &header.public_custom_data.to_bytes(),
        );
    }
    write_field(&mut out, field::END_OF_HEADER, b"\r\n\r\n");
    out
}

fn write_field(out: &mut Vec<u8>, id: u8, data: &[u8]) {
    out.push(id);
    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
    out.extend_from_slice(data);
}
