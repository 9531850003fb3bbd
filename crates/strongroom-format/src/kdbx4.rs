//! KDBX4 container: the read and write pipelines.
//!
//! Read: header (SHA-256, then HMAC under the derived key) → HMAC block
//! stream → payload cipher → inner header → gzip → XML → domain. A header
//! HMAC mismatch means wrong credentials; anything failing after that point
//! is corruption.
//!
//! Write regenerates the master seed, transform seed, encryption IV, and
//! inner stream key on every save, then re-runs the KDF.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use tracing::debug;

use strongroom_core::{Error, Result};
use strongroom_crypto::composite::CompositeKey;
use strongroom_crypto::innerstream::{InnerStream, InnerStreamId};
use strongroom_crypto::kdf::Kdf;
use strongroom_crypto::keys::{cipher_key, hmac_base_key, hmac_block_key, HEADER_HMAC_INDEX};
use strongroom_crypto::random::{random_array, random_vec};
use strongroom_model::{Compression, Database, DatabaseData};

use crate::compress::{gunzip, gzip};
use crate::cursor::Cursor;
use crate::header::{read_outer_header, write_outer_header, OuterHeader};
use crate::hmac_block;
use crate::inner::{InnerBinary, InnerHeader, BINARY_PROTECTED};
use crate::xml;

type HmacSha256 = Hmac<Sha256>;

pub fn read(
    data: &[u8],
    key: Arc<CompositeKey>,
    abort: Option<&AtomicBool>,
) -> Result<Database> {
    let (header, header_len) = read_outer_header(data)?;
    let raw_header = &data[..header_len];
    let mut cursor = Cursor::new(&data[header_len..]);

    let stored_sha = cursor.take(32)?;
    let computed_sha: [u8; 32] = Sha256::digest(raw_header).into();
    if stored_sha[..] != computed_sha {
        return Err(Error::corruption("header checksum mismatch"));
    }
    let stored_hmac = cursor.take(32)?;

    let kdf = Kdf::from_params(&header.kdf_params)?;
    let transformed = key.transform(&kdf, Some(&header.master_seed), abort)?;

    let base_key = hmac_base_key(&header.master_seed, &transformed);
    let header_key = hmac_block_key(HEADER_HMAC_INDEX, &base_key);
    let mut mac =
        HmacSha256::new_from_slice(header_key.as_ref()).expect("HMAC accepts any key length");
    mac.update(raw_header);
    if mac.verify_slice(stored_hmac).is_err() {
        return Err(Error::Key);
    }

    let ciphertext = hmac_block::read_blocks(&mut cursor, &base_key)?;
    let payload_key = cipher_key(&header.master_seed, &transformed);
    let payload = header
        .cipher
        .decrypt(payload_key.as_ref(), &header.encryption_iv, &ciphertext)?;

    let mut payload_cursor = Cursor::new(&payload);
    let inner = InnerHeader::read(&mut payload_cursor)?;
    let xml_part = &payload[payload_cursor.position()..];
    let xml_bytes = match header.compression {
        Compression::Gzip => gunzip(xml_part)?,
        Compression::None => xml_part.to_vec(),
    };

    let mut doc = xml::parse_document(&xml_bytes)?;
    let mut stream = InnerStream::new(inner.stream_id, &inner.stream_key)?;
    xml::unprotect_values(&mut doc, &mut stream)?;

    let pool: HashMap<usize, Vec<u8>> = inner
        .binaries
        .iter()
        .enumerate()
        .map(|(index, binary)| (index, binary.data.clone()))
        .collect();
    let parsed = xml::read::read_document(&doc, &pool)?;
    debug!(
        groups = parsed.root.group_count_recursive(),
        entries = parsed.root.entry_count_recursive(),
        "KDBX4 read complete"
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
            public_custom_data: header.public_custom_data,
        },
    ))
}

pub fn write(db: &mut Database, abort: Option<&AtomicBool>) -> Result<Vec<u8>> {
    {
        let data = db.data_mut();
        data.master_seed = random_array();
        data.kdf.randomize_seed();
        data.transformed_master_key = None;
    }
    db.transform_key(abort)?;

    let (mut doc, pool) = xml::write::write_document(db)?;
    let stream_key = random_vec(64);
    let mut stream = InnerStream::new(InnerStreamId::ChaCha20, &stream_key)?;
    xml::protect_values(&mut doc, &mut stream)?;
    let xml_bytes = xml::serialize_document(&doc)?;

    let data = db.data();
    let compressed = match data.compression {
        Compression::Gzip => gzip(&xml_bytes)?,
        Compression::None => xml_bytes,
    };

    let inner = InnerHeader {
        stream_id: InnerStreamId::ChaCha20,
        stream_key,
        binaries: pool
            .into_iter()
            .map(|data| InnerBinary {
                flags: BINARY_PROTECTED,
                data,
            })
            .collect(),
    };
    let mut payload = Vec::with_capacity(compressed.len() + 256);
    inner.write(&mut payload);
    payload.extend_from_slice(&compressed);

    let transformed = data
        .transformed_master_key
        .as_ref()
        .expect("key transformed above");
    let encryption_iv = random_vec(data.cipher.iv_len());
    let payload_key = cipher_key(&data.master_seed, transformed);
    let ciphertext = data
        .cipher
        .encrypt(payload_key.as_ref(), &encryption_iv, &payload)?;

    let outer = OuterHeader {
        cipher: data.cipher,
        compression: data.compression,
        master_seed: data.master_seed,
        encryption_iv,
        kdf_params: data.kdf.to_params(),
        public_custom_data: data.public_custom_data.clone(),
    };
    let header_bytes = write_outer_header(&outer);

    let mut out = Vec::with_capacity(header_bytes.len() + ciphertext.len() + 1024);
    out.extend_from_slice(&header_bytes);
    let header_sha: [u8; 32] = Sha256::digest(&header_bytes).into();
    out.extend_from_slice(&header_sha);

    let base_key = hmac_base_key(&data.master_seed, transformed);
    let header_key = hmac_block_key(HEADER_HMAC_INDEX, &base_key);
    let mut mac =
        HmacSha256::new_from_slice(header_key.as_ref()).expect("HMAC accepts any key length");
    mac.update(&header_bytes);
    out.extend_from_slice(&mac.finalize().into_bytes());

    hmac_block::write_blocks(&ciphertext, &base_key, &mut out);
    debug!(bytes = out.len(), "KDBX4 write complete");
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use strongroom_crypto::kdf::{AesKdf, Argon2Kdf, Argon2Variant};
    use strongroom_crypto::symmetric::CipherKind;
    use strongroom_model::{Entry, Group};

    fn fast_kdf() -> Kdf {
        Kdf::Aes(AesKdf {
            rounds: 1000,
            seed: [0u8; 32],
        })
    }

    fn sample_db() -> Database {
        let mut db = Database::new();
        db.set_emit_modified(false);
        db.data_mut().kdf = fast_kdf();
        db.metadata_mut().database_name = "Round Trip".into();
        let root = db.root().uuid();

        let group = db.add_group(root, Group::new("Accounts")).unwrap();
        let mut entry = Entry::new();
        entry.set_title("Bank");
        entry.set_username("alice");
        entry.set_password("hunter2");
        entry.attributes_mut().set("PIN", "0000", true);
        entry
            .attachments_mut()
            .set("statement.pdf", vec![0x25, 0x50, 0x44, 0x46]);
        db.add_entry(group, entry).unwrap();
        db
    }

    fn password_key(password: &str) -> Arc<CompositeKey> {
        Arc::new(CompositeKey::from_password(password))
    }

    #[test]
    fn roundtrip_preserves_structure_and_secrets() {
        let mut db = sample_db();
        db.set_key(password_key("correct horse"));
        let bytes = write(&mut db, None).unwrap();

        let reopened = read(&bytes, password_key("correct horse"), None).unwrap();
        assert_eq!(reopened.metadata().database_name, "Round Trip");
        let entry = reopened
            .root()
            .find_entry_by_path("/Accounts/Bank")
            .unwrap();
        assert_eq!(entry.username(), "alice");
        assert_eq!(entry.password(), "hunter2");
        assert!(entry.attributes().is_protected("PIN"));
        assert_eq!(entry.attributes().get("PIN"), Some("0000"));
        assert_eq!(
            entry.attachments().get("statement.pdf"),
            Some(&[0x25, 0x50, 0x44, 0x46][..])
        );
    }

    #[test]
    fn wrong_key_fails_with_key_error() {
        let mut db = sample_db();
        db.set_key(password_key("correct horse"));
        let bytes = write(&mut db, None).unwrap();

        let result = read(&bytes, password_key("battery staple"), None);
        assert!(matches!(result, Err(Error::Key)), "got {result:?}");
    }

    #[test]
    fn seeds_and_ivs_differ_between_saves() {
        let mut db = sample_db();
        db.set_key(password_key("pw"));
        let first = write(&mut db, None).unwrap();
        let seed_one = db.data().master_seed;
        let second = write(&mut db, None).unwrap();
        let seed_two = db.data().master_seed;
        assert_ne!(seed_one, seed_two);
        assert_ne!(first, second, "two saves must not share random material");

        // both still open
        for bytes in [first, second] {
            read(&bytes, password_key("pw"), None).unwrap();
        }
    }

    #[test]
    fn every_cipher_roundtrips() {
        for cipher in [
            CipherKind::Aes256Cbc,
            CipherKind::TwofishCbc,
            CipherKind::ChaCha20,
        ] {
            let mut db = sample_db();
            db.data_mut().cipher = cipher;
            db.set_key(password_key("pw"));
            let bytes = write(&mut db, None).unwrap();
            let reopened = read(&bytes, password_key("pw"), None).unwrap();
            assert_eq!(reopened.data().cipher, cipher);
        }
    }

    #[test]
    fn uncompressed_payload_roundtrips() {
        let mut db = sample_db();
        db.data_mut().compression = Compression::None;
        db.set_key(password_key("pw"));
        let bytes = write(&mut db, None).unwrap();
        let reopened = read(&bytes, password_key("pw"), None).unwrap();
        assert_eq!(reopened.data().compression, Compression::None);
        assert!(reopened.root().find_entry_by_path("/Accounts/Bank").is_some());
    }

    #[test]
    fn argon2_kdf_roundtrips() {
        let mut db = sample_db();
        db.data_mut().kdf = Kdf::Argon2(Argon2Kdf {
            variant: Argon2Variant::Argon2d,
            memory_bytes: 1024 * 1024,
            iterations: 1,
            parallelism: 1,
            version: 0x13,
            salt: [0u8; 32],
        });
        db.set_key(password_key("pw"));
        let bytes = write(&mut db, None).unwrap();
        let reopened = read(&bytes, password_key("pw"), None).unwrap();
        assert!(matches!(reopened.data().kdf, Kdf::Argon2(_)));
    }

    #[test]
    fn bit_flips_are_rejected_everywhere_after_the_magic() {
        let mut db = sample_db();
        db.set_key(password_key("pw"));
        let bytes = write(&mut db, None).unwrap();

        // sample positions across header, hashes, and block stream
        let positions = [
            12,              // version field / first TLV
            40,              // inside header TLVs
            bytes.len() / 2, // ciphertext
            bytes.len() - 1, // final block
        ];
        for &position in &positions {
            let mut tampered = bytes.clone();
            tampered[position] ^= 0x01;
            let result = read(&tampered, password_key("pw"), None);
            assert!(
                matches!(
                    result,
                    Err(Error::Corruption(_)) | Err(Error::Key) | Err(Error::Format(_))
                ),
                "flip at {position} produced {result:?}"
            );
        }
    }

    #[test]
    fn missing_key_is_a_key_error() {
        let mut db = sample_db();
        let result = write(&mut db, None);
        assert!(matches!(result, Err(Error::Key)));
    }

    #[test]
    fn cancelled_kdf_aborts_write() {
        let mut db = sample_db();
        db.set_key(password_key("pw"));
        let flag = AtomicBool::new(true);
        let result = write(&mut db, Some(&flag));
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[test]
    fn tombstones_roundtrip() {
        let mut db = sample_db();
        let uuid = db
            .root()
            .find_entry_by_path("/Accounts/Bank")
            .unwrap()
            .uuid();
        db.delete_entry_permanent(uuid).unwrap();
        db.set_key(password_key("pw"));
        let bytes = write(&mut db, None).unwrap();
        let reopened = read(&bytes, password_key("pw"), None).unwrap();
        assert!(reopened.contains_deleted_object(uuid));
        assert!(reopened.find_entry(uuid).is_none());
    }

    #[test]
    fn memory_protection_governs_canonical_attributes_on_disk() {
        let mut db = sample_db();
        db.metadata_mut().memory_protection.protect_user_name = true;
        db.set_key(password_key("pw"));
        let bytes = write(&mut db, None).unwrap();
        let reopened = read(&bytes, password_key("pw"), None).unwrap();
        let entry = reopened
            .root()
            .find_entry_by_path("/Accounts/Bank")
            .unwrap();
        assert!(entry.attributes().is_protected("UserName"));
        assert_eq!(entry.username(), "alice");
        assert!(!entry.attributes().is_protected("Title"));
    }

    #[test]
    fn public_custom_data_roundtrips() {
        use strongroom_core::Variant;
        let mut db = sample_db();
        db.data_mut()
            .public_custom_data
            .set("ProviderHint", Variant::String("hsm-07".into()));
        db.set_key(password_key("pw"));
        let bytes = write(&mut db, None).unwrap();
        let reopened = read(&bytes, password_key("pw"), None).unwrap();
        assert_eq!(
            reopened.data().public_custom_data.get_string("ProviderHint"),
            Some("hsm-07")
        );
    }
}
