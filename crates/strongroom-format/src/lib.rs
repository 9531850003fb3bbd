//! strongroom-format: the encrypted container codec.
//!
//! Pipeline on open:
//! ```text
//! bytes → outer header (SHA-256 + HMAC checked) → HMAC block stream
//!       → payload cipher → inner header → gzip → XML → domain tree
//! ```
//! Save runs the same pipeline in reverse with fresh seeds, IV, and inner
//! stream key. Writers always produce KDBX4; KDBX3.1 is accepted for import.

mod compress;
mod cursor;
pub mod header;
pub mod hmac_block;
pub mod inner;
pub mod kdbx3;
pub mod kdbx4;
pub mod save;
pub mod xml;

use std::fs;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use tracing::debug;

use strongroom_core::{Error, Result};
use strongroom_crypto::composite::CompositeKey;
use strongroom_model::Database;

pub use save::{save_database, SaveOptions};

/// First magic word of every database file.
pub const SIGNATURE_1: u32 = 0x9AA2_D903;
/// Second magic word selecting the KDBX family.
pub const SIGNATURE_2: u32 = 0xB54B_FB67;

/// Version written by the writer (KDBX 4.0).
pub const VERSION_4_0: u32 = 0x0004_0000;
/// Oldest version accepted for import (KDBX 3.1).
pub const VERSION_3_1: u32 = 0x0003_0001;

const VERSION_MAJOR_MASK: u32 = 0xFFFF_0000;

/// Open a database file with the given composite credential.
pub fn open_database(path: impl AsRef<Path>, key: Arc<CompositeKey>) -> Result<Database> {
    open_database_with_abort(path, key, None)
}

pub fn open_database_with_abort(
    path: impl AsRef<Path>,
    key: Arc<CompositeKey>,
    abort: Option<&AtomicBool>,
) -> Result<Database> {
    let path = path.as_ref();
    let data = fs::read(path).map_err(|e| Error::io(path, e))?;
    let mut db = read_database(&data, key, abort)?;
    db.set_file_path(path);
    Ok(db)
}

/// Decode a database from memory, dispatching on the container version.
pub fn read_database(
    data: &[u8],
    key: Arc<CompositeKey>,
    abort: Option<&AtomicBool>,
) -> Result<Database> {
    let version = header::read_signature(data)?;
    match version & VERSION_MAJOR_MASK {
        0x0004_0000 => {
            debug!(version = format_args!("{version:#010x}"), "reading KDBX4");
            kdbx4::read(data, key, abort)
        }
        0x0003_0000 => {
            debug!(version = format_args!("{version:#010x}"), "importing KDBX3");
            kdbx3::read(data, key, abort)
        }
        _ => Err(Error::format(format!(
            "unsupported container version {version:#010x}"
        ))),
    }
}

/// Serialize a database to KDBX4 bytes. Regenerates the master seed,
/// encryption IV, transform seed, and inner stream key, re-running the KDF.
pub fn write_database(db: &mut Database) -> Result<Vec<u8>> {
    kdbx4::write(db, None)
}

pub fn write_database_with_abort(
    db: &mut Database,
    abort: Option<&AtomicBool>,
) -> Result<Vec<u8>> {
    kdbx4::write(db, abort)
}
