//! Variant dictionary: the typed key/value TLV map embedded in KDBX4 headers.
//!
//! Wire layout (all integers little-endian):
//! ```text
//! Offset  Size  Field
//!      0     2  version        (u16, high byte is the major version, must be 1)
//!      then, repeated until the terminator:
//!             1  value type    (see `Variant` discriminants)
//!             4  key length    (u32)
//!             n  key           (UTF-8)
//!             4  value length  (u32)
//!             m  value
//!      last   1  terminator    (0x00)
//! ```

use crate::error::{Error, Result};

/// Serialized dictionary version. Readers accept any 1.x minor.
pub const VARIANT_VERSION: u16 = 0x0100;
const VERSION_MAJOR_MASK: u16 = 0xFF00;

const TYPE_END: u8 = 0x00;
const TYPE_U32: u8 = 0x04;
const TYPE_U64: u8 = 0x05;
const TYPE_BOOL: u8 = 0x08;
const TYPE_I32: u8 = 0x0C;
const TYPE_I64: u8 = 0x0D;
const TYPE_STRING: u8 = 0x18;
const TYPE_BYTES: u8 = 0x42;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Variant {
    U32(u32),
    U64(u64),
    Bool(bool),
    I32(i32),
    I64(i64),
    String(String),
    Bytes(Vec<u8>),
}

impl Variant {
    fn type_id(&self) -> u8 {
        match self {
            Variant::U32(_) => TYPE_U32,
            Variant::U64(_) => TYPE_U64,
            Variant::Bool(_) => TYPE_BOOL,
            Variant::I32(_) => TYPE_I32,
            Variant::I64(_) => TYPE_I64,
            Variant::String(_) => TYPE_STRING,
            Variant::Bytes(_) => TYPE_BYTES,
        }
    }

    fn value_bytes(&self) -> Vec<u8> {
        match self {
            Variant::U32(v) => v.to_le_bytes().to_vec(),
            Variant::U64(v) => v.to_le_bytes().to_vec(),
            Variant::Bool(v) => vec![u8::from(*v)],
            Variant::I32(v) => v.to_le_bytes().to_vec(),
            Variant::I64(v) => v.to_le_bytes().to_vec(),
            Variant::String(v) => v.as_bytes().to_vec(),
            Variant::Bytes(v) => v.clone(),
        }
    }
}

/// An order-preserving typed map. Entry order is round-tripped verbatim so
/// rewriting a header does not reshuffle fields another implementation wrote.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VariantDictionary {
    items: Vec<(String, Variant)>,
}

impl VariantDictionary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Variant)> {
        self.items.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Insert or replace, keeping the original position on replace.
    pub fn set(&mut self, key: impl Into<String>, value: Variant) {
        let key = key.into();
        match self.items.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.items.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Variant> {
        self.items.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn get_u32(&self, key: &str) -> Option<u32> {
        match self.get(key) {
            Some(Variant::U32(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        match self.get(key) {
            Some(Variant::U64(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_bytes(&self, key: &str) -> Option<&[u8]> {
        match self.get(key) {
            Some(Variant::Bytes(v)) => Some(v.as_slice()),
            _ => None,
        }
    }

    pub fn get_string(&self, key: &str) -> Option<&str> {
        match self.get(key) {
            Some(Variant::String(v)) => Some(v.as_str()),
            _ => None,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        out.extend_from_slice(&VARIANT_VERSION.to_le_bytes());
        for (key, value) in &self.items {
            out.push(value.type_id());
            out.extend_from_slice(&(key.len() as u32).to_le_bytes());
            out.extend_from_slice(key.as_bytes());
            let bytes = value.value_bytes();
            out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
            out.extend_from_slice(&bytes);
        }
        out.push(TYPE_END);
        out
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(data);
        let version = cursor.read_u16()?;
        if version & VERSION_MAJOR_MASK != VARIANT_VERSION & VERSION_MAJOR_MASK {
            return Err(Error::format(format!(
                "unsupported variant dictionary version {version:#06x}"
            )));
        }

        let mut items = Vec::new();
        loop {
            let type_id = cursor.read_u8()?;
            if type_id == TYPE_END {
                break;
            }
            let key_len = cursor.read_u32()? as usize;
            let key = String::from_utf8(cursor.read_slice(key_len)?.to_vec())
                .map_err(|_| Error::format("variant dictionary key is not UTF-8"))?;
            let value_len = cursor.read_u32()? as usize;
            let raw = cursor.read_slice(value_len)?;

            let value = match type_id {
                TYPE_U32 => Variant::U32(u32::from_le_bytes(fixed(raw, &key)?)),
                TYPE_U64 => Variant::U64(u64::from_le_bytes(fixed(raw, &key)?)),
                TYPE_BOOL => match raw {
                    [b] => Variant::Bool(*b != 0),
                    _ => return Err(Error::format(format!("bad bool length for '{key}'"))),
                },
                TYPE_I32 => Variant::I32(i32::from_le_bytes(fixed(raw, &key)?)),
                TYPE_I64 => Variant::I64(i64::from_le_bytes(fixed(raw, &key)?)),
                TYPE_STRING => Variant::String(
                    String::from_utf8(raw.to_vec())
                        .map_err(|_| Error::format(format!("value for '{key}' is not UTF-8")))?,
                ),
                TYPE_BYTES => Variant::Bytes(raw.to_vec()),
                other => {
                    return Err(Error::format(format!(
                        "unknown variant type {other:#04x} for '{key}'"
                    )))
                }
            };
            items.push((key, value));
        }

        Ok(VariantDictionary { items })
    }
}

fn fixed<const N: usize>(raw: &[u8], key: &str) -> Result<[u8; N]> {
    raw.try_into()
        .map_err(|_| Error::format(format!("bad value length for '{key}'")))
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn read_slice(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| Error::format("variant dictionary truncated"))?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_slice(1)?[0])
    }

    fn read_u16(&mut self) -> Result<u16> {
        let raw = self.read_slice(2)?;
        Ok(u16::from_le_bytes([raw[0], raw[1]]))
    }

    fn read_u32(&mut self) -> Result<u32> {
        let raw = self.read_slice(4)?;
        Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> VariantDictionary {
        let mut dict = VariantDictionary::new();
        dict.set("$UUID", Variant::Bytes(vec![0xAB; 16]));
        dict.set("R", Variant::U64(60_000));
        dict.set("S", Variant::Bytes(vec![7; 32]));
        dict.set("V", Variant::U32(0x13));
        dict.set("label", Variant::String("argon2 salt".into()));
        dict.set("flag", Variant::Bool(true));
        dict.set("offset", Variant::I64(-42));
        dict
    }

    #[test]
    fn roundtrip_preserves_values_and_order() {
        let dict = sample();
        let decoded = VariantDictionary::from_bytes(&dict.to_bytes()).unwrap();
        assert_eq!(decoded, dict);
        let keys: Vec<&str> = decoded.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, ["$UUID", "R", "S", "V", "label", "flag", "offset"]);
    }

    #[test]
    fn set_replaces_in_place() {
        let mut dict = sample();
        dict.set("R", Variant::U64(1));
        assert_eq!(dict.get_u64("R"), Some(1));
        assert_eq!(dict.len(), 7);
    }

    #[test]
    fn typed_getter_rejects_mismatched_type() {
        let dict = sample();
        assert_eq!(dict.get_u32("R"), None);
        assert_eq!(dict.get_u64("R"), Some(60_000));
    }

    #[test]
    fn rejects_wrong_major_version() {
        let mut bytes = sample().to_bytes();
        bytes[1] = 0x02;
        assert!(matches!(
            VariantDictionary::from_bytes(&bytes),
            Err(Error::Format(_))
        ));
    }

    #[test]
    fn rejects_truncation() {
        let bytes = sample().to_bytes();
        for cut in [1, 5, bytes.len() - 2] {
            assert!(
                VariantDictionary::from_bytes(&bytes[..cut]).is_err(),
                "cut at {cut} must fail"
            );
        }
    }

    #[test]
    fn rejects_unknown_type_tag() {
        // version + one entry with bogus type 0x7F
        let mut bytes = vec![0x00, 0x01, 0x7F];
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.push(b'k');
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.push(0x00);
        assert!(matches!(
            VariantDictionary::from_bytes(&bytes),
            Err(Error::Format(_))
        ));
    }
}
