//! Gzip helpers for the payload and legacy inline binaries.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression as GzLevel;

use strongroom_core::{Error, Result};

pub(crate) fn gzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), GzLevel::default());
    encoder
        .write_all(data)
        .and_then(|_| encoder.finish())
        .map_err(|e| Error::format(format!("gzip compression failed: {e}")))
}

pub(crate) fn gunzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|_| Error::corruption("payload is not valid gzip"))?;
    Ok(out)
}
