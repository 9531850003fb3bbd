//! Inner header: plaintext TLVs in front of the XML payload carrying the
//! inner random stream parameters and the attachment binary pool.
//!
//! ```text
//! field := id (u8) | size (u32 LE) | data
//! ids:  0 end · 1 stream id (u32) · 2 stream key · 3 binary (flag byte + data)
//! ```

use strongroom_core::{Error, Result};
use strongroom_crypto::innerstream::InnerStreamId;

use crate::cursor::Cursor;

const ID_END: u8 = 0;
const ID_STREAM_ID: u8 = 1;
const ID_STREAM_KEY: u8 = 2;
const ID_BINARY: u8 = 3;

/// Binary flag bit: the value should stay memory-protected in the client.
pub const BINARY_PROTECTED: u8 = 0x01;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InnerBinary {
    pub flags: u8,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InnerHeader {
    pub stream_id: InnerStreamId,
    pub stream_key: Vec<u8>,
    /// Attachment bodies in pool order; entries reference them by index.
    pub binaries: Vec<InnerBinary>,
}

impl InnerHeader {
    pub fn read(cursor: &mut Cursor<'_>) -> Result<Self> {
        let mut stream_id = None;
        let mut stream_key = None;
        let mut binaries = Vec::new();

        loop {
            let id = cursor.read_u8()?;
            let size = cursor.read_u32()? as usize;
            let value = cursor.take(size)?;
            match id {
                ID_END => break,
                ID_STREAM_ID => {
                    let mut c = Cursor::new(value);
                    stream_id = Some(InnerStreamId::from_u32(c.read_u32()?)?);
                }
                ID_STREAM_KEY => stream_key = Some(value.to_vec()),
                ID_BINARY => {
                    let (flags, data) = value
                        .split_first()
                        .ok_or_else(|| Error::format("inner binary missing flag byte"))?;
                    binaries.push(InnerBinary {
                        flags: *flags,
                        data: data.to_vec(),
                    });
                }
                other => {
                    return Err(Error::format(format!("unknown inner header field {other}")))
                }
            }
        }

        let stream_key =
            stream_key.ok_or_else(|| Error::format("inner header missing stream key"))?;
        if stream_key.len() != 32 && stream_key.len() != 64 {
            return Err(Error::format("inner stream key must be 32 or 64 bytes"));
        }
        Ok(Self {
            stream_id: stream_id
                .ok_or_else(|| Error::format("inner header missing stream id"))?,
            stream_key,
            binaries,
        })
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        write_field(out, ID_STREAM_ID, &self.stream_id.as_u32().to_le_bytes());
        write_field(out, ID_STREAM_KEY, &self.stream_key);
        for binary in &self.binaries {
            let mut value = Vec::with_capacity(1 + binary.data.len());
            value.push(binary.flags);
            value.extend_from_slice(&binary.data);
            write_field(out, ID_BINARY, &value);
        }
        write_field(out, ID_END, b"");
    }
}

fn write_field(out: &mut Vec<u8>, id: u8, data: &[u8]) {
    out.push(id);
    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
    out.extend_from_slice(data);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_with_binaries() {
        let header = InnerHeader {
            stream_id: InnerStreamId::ChaCha20,
            stream_key: vec![0x42; 64],
            binaries: vec![
                InnerBinary {
                    flags: BINARY_PROTECTED,
                    data: b"attachment one".to_vec(),
                },
                InnerBinary {
                    flags: 0,
                    data: Vec::new(),
                },
            ],
        };
        let mut bytes = Vec::new();
        header.write(&mut bytes);
        // trailing payload must be left unconsumed
        bytes.extend_from_slice(b"<xml/>");

        let mut cursor = Cursor::new(&bytes);
        let parsed = InnerHeader::read(&mut cursor).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(cursor.remaining(), 6);
    }

    #[test]
    fn missing_stream_key_rejected() {
        let mut bytes = Vec::new();
        write_field(&mut bytes, ID_STREAM_ID, &3u32.to_le_bytes());
        write_field(&mut bytes, ID_END, b"");
        let mut cursor = Cursor::new(&bytes);
        assert!(InnerHeader::read(&mut cursor).is_err());
    }

    #[test]
    fn odd_key_length_rejected() {
        let mut bytes = Vec::new();
        write_field(&mut bytes, ID_STREAM_ID, &3u32.to_le_bytes());
        write_field(&mut bytes, ID_STREAM_KEY, &[1u8; 16]);
        write_field(&mut bytes, ID_END, b"");
        let mut cursor = Cursor::new(&bytes);
        assert!(InnerHeader::read(&mut cursor).is_err());
    }

    #[test]
    fn binary_needs_flag_byte() {
        let mut bytes = Vec::new();
        write_field(&mut bytes, ID_BINARY, b"");
        let mut cursor = Cursor::new(&bytes);
        assert!(InnerHeader::read(&mut cursor).is_err());
    }
}
