//! Persistence glue: atomic save and the optional rolling backup.
//!
//! The database is serialized first; only then is anything touched on disk.
//! An atomic save writes a sibling temp file, fsyncs, and renames over the
//! target, so a failure at any point leaves the original file intact.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use strongroom_core::{Error, Result};
use strongroom_model::Database;

use crate::kdbx4;

#[derive(Debug, Clone, Copy)]
pub struct SaveOptions {
    /// Write via temp file + rename instead of in place.
    pub atomic: bool,
    /// Rename the previous file to `<name>.old.kdbx` first.
    pub backup: bool,
}

impl Default for SaveOptions {
    fn default() -> Self {
        Self {
            atomic: true,
            backup: false,
        }
    }
}

pub fn save_database(
    db: &mut Database,
    path: impl AsRef<Path>,
    options: SaveOptions,
) -> Result<()> {
    let path = path.as_ref();
    let bytes = kdbx4::write(db, None)?;

    if options.backup && path.exists() {
        let backup = backup_path(path);
        fs::rename(path, &backup).map_err(|e| Error::io(path, e))?;
        debug!(backup = %backup.display(), "previous database backed up");
    }

    if options.atomic {
        let tmp = temp_path(path);
        let written = write_and_sync(&tmp, &bytes)
            .and_then(|_| fs::rename(&tmp, path).map_err(|e| Error::io(path, e)));
        if written.is_err() {
            if let Err(cleanup) = fs::remove_file(&tmp) {
                if cleanup.kind() != std::io::ErrorKind::NotFound {
                    warn!(tmp = %tmp.display(), error = %cleanup, "temp file left behind");
                }
            }
        }
        written?;
    } else {
        write_and_sync(path, &bytes)?;
    }

    db.set_file_path(path);
    debug!(path = %path.display(), bytes = bytes.len(), "database saved");
    Ok(())
}

fn write_and_sync(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut file = File::create(path).map_err(|e| Error::io(path, e))?;
    file.write_all(bytes).map_err(|e| Error::io(path, e))?;
    file.sync_all().map_err(|e| Error::io(path, e))?;
    Ok(())
}

/// `vault.kdbx` → `vault.kdbx.tmp`, in the same directory so the final
/// rename never crosses filesystems.
fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

/// `vault.kdbx` → `vault.old.kdbx`.
fn backup_path(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .unwrap_or_default()
        .to_string_lossy()
        .into_owned();
    path.with_file_name(format!("{stem}.old.kdbx"))
}
