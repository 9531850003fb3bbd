//! Key file parsing: one 32-byte contribution from a file on disk.
//!
//! Accepted shapes, probed in order:
//!   1. XML key file (versions 1.00 and 2.0)
//!   2. exactly 32 raw bytes
//!   3. exactly 64 hex characters
//!   4. anything else: SHA-256 of the whole file
//!
//! The v2 XML format carries a truncated SHA-256 in the `Hash` attribute;
//! a mismatch is rejected rather than silently producing a wrong key.

use std::fs;
use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use quick_xml::events::Event;
use quick_xml::Reader;
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

use strongroom_core::{Error, Result};

use crate::KEY_SIZE;

#[derive(Clone)]
pub struct KeyFileKey {
    raw: [u8; KEY_SIZE],
}

impl KeyFileKey {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut bytes = fs::read(path).map_err(|e| Error::io(path, e))?;
        let key = Self::parse(&bytes);
        bytes.zeroize();
        key
    }

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if looks_like_xml(bytes) {
            if let Some(raw) = parse_xml_key_file(bytes)? {
                return Ok(Self { raw });
            }
        }
        if bytes.len() == KEY_SIZE {
            let mut raw = [0u8; KEY_SIZE];
            raw.copy_from_slice(bytes);
            return Ok(Self { raw });
        }
        if bytes.len() == KEY_SIZE * 2 {
            if let Ok(decoded) = hex::decode(bytes) {
                let mut raw = [0u8; KEY_SIZE];
                raw.copy_from_slice(&decoded);
                return Ok(Self { raw });
            }
        }
        Ok(Self {
            raw: Sha256::digest(bytes).into(),
        })
    }

    pub fn raw(&self) -> &[u8; KEY_SIZE] {
        &self.raw
    }
}

impl Drop for KeyFileKey {
    fn drop(&mut self) {
        self.raw.zeroize();
    }
}

impl std::fmt::Debug for KeyFileKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyFileKey")
            .field("raw", &"[REDACTED]")
            .finish()
    }
}

fn looks_like_xml(bytes: &[u8]) -> bool {
    let head = &bytes[..bytes.len().min(256)];
    head.windows(8).any(|w| w == b"<KeyFile")
}

/// Returns `Ok(None)` when the document is XML but not a key file, so the
/// caller can fall through to hashing the raw bytes.
fn parse_xml_key_file(bytes: &[u8]) -> Result<Option<[u8; KEY_SIZE]>> {
    let mut reader = Reader::from_reader(bytes);
    reader.trim_text(true);

    let mut buf = Vec::new();
    let mut path: Vec<String> = Vec::new();
    let mut version = String::new();
    let mut data_text = String::new();
    let mut data_hash: Option<String> = None;
    let mut saw_key_file = false;

    loop {
        match reader
            .read_event_into(&mut buf)
            .map_err(|e| Error::format(format!("key file XML: {e}")))?
        {
            Event::Start(e) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                if path.is_empty() && name == "KeyFile" {
                    saw_key_file = true;
                }
                if name == "Data" {
                    for attr in e.attributes() {
                        let attr =
                            attr.map_err(|e| Error::format(format!("key file XML: {e}")))?;
                        if attr.key.as_ref() == b"Hash" {
                            data_hash = Some(
                                attr.unescape_value()
                                    .map_err(|e| Error::format(format!("key file XML: {e}")))?
                                    .into_owned(),
                            );
                        }
                    }
                }
                path.push(name);
            }
            Event::Text(t) => {
                let text = t
                    .unescape()
                    .map_err(|e| Error::format(format!("key file XML: {e}")))?;
                match path.last().map(String::as_str) {
                    Some("Version") => version = text.trim().to_string(),
                    Some("Data") => data_text.push_str(&text),
                    _ => {}
                }
            }
            Event::End(_) => {
                path.pop();
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    if !saw_key_file {
        return Ok(None);
    }

    if version.starts_with('2') {
        let compact: String = data_text.chars().filter(|c| !c.is_whitespace()).collect();
        let decoded = hex::decode(&compact)
            .map_err(|_| Error::format("key file v2 data is not hex"))?;
        let raw: [u8; KEY_SIZE] = decoded
            .as_slice()
            .try_into()
            .map_err(|_| Error::format("key file v2 data is not 32 bytes"))?;
        if let Some(expected) = data_hash {
            let digest = Sha256::digest(raw);
            let actual = hex::encode_upper(&digest[..4]);
            if !actual.eq_ignore_ascii_case(&expected) {
                return Err(Error::format("key file hash check failed"));
            }
        }
        return Ok(Some(raw));
    }

    // v1: base64-encoded key data
    let decoded = BASE64
        .decode(data_text.trim())
        .map_err(|_| Error::format("key file v1 data is not base64"))?;
    let raw: [u8; KEY_SIZE] = decoded
        .as_slice()
        .try_into()
        .map_err(|_| Error::format("key file v1 data is not 32 bytes"))?;
    Ok(Some(raw))
}
