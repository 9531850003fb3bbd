//! KDBX3.1 import.
//!
//! The 3.x container predates the header HMAC: integrity rests on the
//! stream-start bytes (first 32 decrypted bytes must match a header field),
//! a SHA-256 hashed block stream, and the `Meta/HeaderHash` element inside
//! the XML. The transform is always AES-KDF with the header's seed and round
//! count, and the inner stream parameters live in the outer header.
//!
//! Import only — the writer always produces KDBX4.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tracing::debug;

use strongroom_core::{Error, Result};
use strongroom_crypto::composite::CompositeKey;
use strongroom_crypto::innerstream::{InnerStream, InnerStreamId};
use strongroom_crypto::kdf::{AesKdf, Kdf};
use strongroom_crypto::keys::cipher_key;
use strongroom_crypto::symmetric::CipherKind;
use strongroom_model::{Compression, Database, DatabaseData};

use crate::compress::gunzip;
use crate::cursor::Cursor;
use crate::header::field;
use crate::xml;

struct LegacyHeader {
    cipher: CipherKind,
    compression: Compression,
    master_seed: [u8; 32],
    transform_seed: [u8; 32],
    transform_rounds: u64,
    encryption_iv: Vec<u8>,
    protected_stream_key: Vec<u8>,
    stream_start_bytes: Vec<u8>,
    inner_stream_id: InnerStreamId,
}

pub fn read(
    data: &[u8],
    key: Arc<CompositeKey>,
    abort: Option<&AtomicBool>,
) -> Result<Database> {
    let (header, header_len) = read_legacy_header(data)?;
    let raw_header = &data[..header_len];

    let kdf = Kdf::Aes(AesKdf {
        rounds: header.transform_rounds,
        seed: header.transform_seed,
    });
    let transformed = key.transform(&kdf, Some(&header.master_seed), abort)?;
    let payload_key = cipher_key(&header.master_seed, &transformed);

    // A padding failure here almost always means wrong credentials; the 3.x
    // format has nothing earlier that could prove them.
    let payload = header
        .cipher
        .decrypt(payload_key.as_ref(), &header.encryption_iv, &data[header_len..])
        .map_err(|_| Error::Key)?;

    if payload.len() < 32 {
        return Err(Error::format("payload shorter than the stream start bytes"));
    }
    if payload[..32] != header.stream_start_bytes[..] {
        return Err(Error::Key);
    }

    let blocks = read_hashed_blocks(&payload[32..])?;
    let xml_bytes = match header.compression {
        Compression::Gzip => gunzip(&blocks)?,
        Compression::None => blocks,
    };

    let mut doc = xml::parse_document(&xml_bytes)?;
    let mut stream = InnerStream::new(header.inner_stream_id, &header.protected_stream_key)?;
    xml::unprotect_values(&mut doc, &mut stream)?;

    let parsed = xml::read::read_document(&doc, &HashMap::new())?;
    if let Some(stored) = &parsed.header_hash {
        let computed: [u8; 32] = Sha256::digest(raw_header).into();
        if stored[..] != computed {
            return Err(Error::corruption("legacy header hash mismatch"));
        }
    }
    debug!(
        entries = parsed.root.entry_count_recursive(),
        "KDBX3 import complete"
    );

    Ok(Database::from_parts(
        parsed.root,
        parsed.metadata,
        parsed.deleted_objects,
        DatabaseData {
            cipher: header.cipher,
            compression: header.compression,
            kdf,
            key: Some(key),
            transformed_master_key: Some(transformed),
            master_seed: header.master_seed,
            public_custom_data: Default::default(),
        },
    ))
}

fn read_legacy_header(data: &[u8]) -> Result<(LegacyHeader, usize)> {
    let mut cursor = Cursor::new(data);
    cursor.take(12)?; // signatures and version, validated by the dispatcher

    let mut cipher = None;
    let mut compression = None;
    let mut master_seed = None;
    let mut transform_seed = None;
    let mut transform_rounds = None;
    let mut encryption_iv = None;
    let mut protected_stream_key = None;
    let mut stream_start_bytes = None;
    let mut inner_stream_id = None;

    loop {
        let id = cursor.read_u8()?;
        let size = cursor.read_u16()? as usize;
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
            field::TRANSFORM_SEED => {
                transform_seed = Some(
                    <[u8; 32]>::try_from(value)
                        .map_err(|_| Error::format("transform seed must be 32 bytes"))?,
                );
            }
            field::TRANSFORM_ROUNDS => {
                let mut c = Cursor::new(value);
                transform_rounds = Some(c.read_u64()?);
            }
            field::ENCRYPTION_IV => encryption_iv = Some(value.to_vec()),
            field::PROTECTED_STREAM_KEY => protected_stream_key = Some(value.to_vec()),
            field::STREAM_START_BYTES => stream_start_bytes = Some(value.to_vec()),
            field::INNER_RANDOM_STREAM_ID => {
                let mut c = Cursor::new(value);
                inner_stream_id = Some(InnerStreamId::from_u32(c.read_u32()?)?);
            }
            other => {
                return Err(Error::format(format!(
                    "unknown legacy header field {other}"
                )));
            }
        }
    }

    let header = LegacyHeader {
        cipher: cipher.ok_or_else(|| Error::format("header missing cipher id"))?,
        compression: compression.ok_or_else(|| Error::format("header missing compression"))?,
        master_seed: master_seed.ok_or_else(|| Error::format("header missing master seed"))?,
        transform_seed: transform_seed
            .ok_or_else(|| Error::format("header missing transform seed"))?,
        transform_rounds: transform_rounds
            .ok_or_else(|| Error::format("header missing transform rounds"))?,
        encryption_iv: encryption_iv
            .ok_or_else(|| Error::format("header missing encryption IV"))?,
        protected_stream_key: protected_stream_key
            .ok_or_else(|| Error::format("header missing protected stream key"))?,
        stream_start_bytes: stream_start_bytes
            .ok_or_else(|| Error::format("header missing stream start bytes"))?,
        inner_stream_id: inner_stream_id
            .ok_or_else(|| Error::format("header missing inner stream id"))?,
    };
    if header.stream_start_bytes.len() != 32 {
        return Err(Error::format("stream start bytes must be 32 bytes"));
    }
    Ok((header, cursor.position()))
}

/// SHA-256 hashed block stream:
/// `index (u32) | hash (32) | size (u32) | data`, terminated by a zero-size
/// block.
fn read_hashed_blocks(data: &[u8]) -> Result<Vec<u8>> {
    let mut cursor = Cursor::new(data);
    let mut out = Vec::with_capacity(data.len());
    loop {
        let _index = cursor.read_u32()?;
        let stored_hash = cursor.take(32)?;
        let size = cursor.read_u32()? as usize;
        if size == 0 {
            return Ok(out);
        }
        let block = cursor.take(size)?;
        let computed: [u8; 32] = Sha256::digest(block).into();
        if stored_hash[..] != computed {
            return Err(Error::corruption("hashed block checksum mismatch"));
        }
        out.extend_from_slice(block);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strongroom_crypto::random::random_vec;
    use strongroom_model::{Entry, Group};

    use crate::{SIGNATURE_1, SIGNATURE_2, VERSION_3_1};

    /// Test-only KDBX3.1 writer: exercises the import path end to end.
    fn build_kdbx3(password: &str) -> Vec<u8> {
        let master_seed = [0x11u8; 32];
        let transform_seed = [0x22u8; 32];
        let rounds: u64 = 1000;
        let iv = [0x33u8; 16];
        let stream_key = random_vec(32);
        let stream_start: Vec<u8> = random_vec(32);

        // document with one entry holding a protected password
        let mut db = Database::new();
        db.set_emit_modified(false);
        db.metadata_mut().database_name = "Legacy".into();
        let root = db.root().uuid();
        let group = db.add_group(root, Group::new("Old")).unwrap();
        let mut entry = Entry::new();
        entry.set_title("Relic");
        entry.set_password("pa55");
        db.add_entry(group, entry).unwrap();

        let (mut doc, _) = xml::write::write_document(&db).unwrap();
        let mut stream = InnerStream::new(InnerStreamId::Salsa20, &stream_key).unwrap();
        xml::protect_values(&mut doc, &mut stream).unwrap();

        // header
        let mut header = Vec::new();
        header.extend_from_slice(&SIGNATURE_1.to_le_bytes());
        header.extend_from_slice(&SIGNATURE_2.to_le_bytes());
        header.extend_from_slice(&VERSION_3_1.to_le_bytes());
        let mut put = |id: u8, data: &[u8]| {
            header.push(id);
            header.extend_from_slice(&(data.len() as u16).to_le_bytes());
            header.extend_from_slice(data);
        };
        put(field::CIPHER_ID, &CipherKind::Aes256Cbc.uuid());
        put(field::COMPRESSION_FLAGS, &0u32.to_le_bytes());
        put(field::MASTER_SEED, &master_seed);
        put(field::TRANSFORM_SEED, &transform_seed);
        put(field::TRANSFORM_ROUNDS, &rounds.to_le_bytes());
        put(field::ENCRYPTION_IV, &iv);
        put(field::PROTECTED_STREAM_KEY, &stream_key);
        put(field::STREAM_START_BYTES, &stream_start);
        put(
            field::INNER_RANDOM_STREAM_ID,
            &InnerStreamId::Salsa20.as_u32().to_le_bytes(),
        );
        put(field::END_OF_HEADER, b"\r\n\r\n");

        // inject the header hash the reader verifies
        let header_hash: [u8; 32] = Sha256::digest(&header).into();
        {
            use base64::engine::general_purpose::STANDARD as BASE64;
            use base64::Engine;
            let meta = doc
                .children
                .iter_mut()
                .find(|c| c.name == "Meta")
                .unwrap();
            let mut hash_elem = xml::XmlElement::new("HeaderHash");
            hash_elem.text = BASE64.encode(header_hash);
            meta.children.insert(0, hash_elem);
        }
        let xml_bytes = xml::serialize_document(&doc).unwrap();

        // hashed block stream (single block + terminator)
        let mut blocks = Vec::new();
        blocks.extend_from_slice(&0u32.to_le_bytes());
        let hash: [u8; 32] = Sha256::digest(&xml_bytes).into();
        blocks.extend_from_slice(&hash);
        blocks.extend_from_slice(&(xml_bytes.len() as u32).to_le_bytes());
        blocks.extend_from_slice(&xml_bytes);
        blocks.extend_from_slice(&1u32.to_le_bytes());
        blocks.extend_from_slice(&[0u8; 32]);
        blocks.extend_from_slice(&0u32.to_le_bytes());

        let mut payload = stream_start.clone();
        payload.extend_from_slice(&blocks);

        // encrypt
        let key = CompositeKey::from_password(password);
        let kdf = Kdf::Aes(AesKdf {
            rounds,
            seed: transform_seed,
        });
        let transformed = key.transform(&kdf, Some(&master_seed), None).unwrap();
        let payload_key = cipher_key(&master_seed, &transformed);
        let ciphertext = CipherKind::Aes256Cbc
            .encrypt(payload_key.as_ref(), &iv, &payload)
            .unwrap();

        let mut out = header;
        out.extend_from_slice(&ciphertext);
        out
    }

    #[test]
    fn imports_a_legacy_database() {
        let bytes = build_kdbx3("legacy pass");
        let db = read(
            &bytes,
            Arc::new(CompositeKey::from_password("legacy pass")),
            None,
        )
        .unwrap();
        assert_eq!(db.metadata().database_name, "Legacy");
        let entry = db.root().find_entry_by_path("/Old/Relic").unwrap();
        assert_eq!(entry.password(), "pa55");
        assert!(matches!(db.data().kdf, Kdf::Aes(_)));
    }

    #[test]
    fn wrong_password_is_a_key_error() {
        let bytes = build_kdbx3("legacy pass");
        let result = read(
            &bytes,
            Arc::new(CompositeKey::from_password("nope")),
            None,
        );
        assert!(matches!(result, Err(Error::Key)), "got {result:?}");
    }

    #[test]
    fn tampered_header_is_rejected() {
        let mut bytes = build_kdbx3("legacy pass");
        // flip a bit inside the compression flags field
        bytes[20] ^= 0x01;
        let result = read(
            &bytes,
            Arc::new(CompositeKey::from_password("legacy pass")),
            None,
        );
        assert!(result.is_err());
    }
}
