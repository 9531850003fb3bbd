use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Failure kinds surfaced by the engine.
///
/// The corruption/key split matters on open: a header HMAC mismatch means the
/// credentials are wrong (`Key`), while a block HMAC or padding failure after
/// a valid header cannot distinguish tampering from a wrong key and reports
/// `Corruption`.
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid database format: {0}")]
    Format(String),

    #[error("database is corrupted or the key is wrong: {0}")]
    Corruption(String),

    #[error("cryptographic failure: {0}")]
    Crypto(String),

    #[error("invalid credentials")]
    Key,

    #[error("operation violates a database invariant: {0}")]
    Invariant(String),

    #[error("key transformation cancelled")]
    Cancelled,
}

impl Error {
    pub fn io(path: impl AsRef<Path>, source: io::Error) -> Self {
        Error::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    pub fn format(msg: impl Into<String>) -> Self {
        Error::Format(msg.into())
    }

    pub fn corruption(msg: impl Into<String>) -> Self {
        Error::Corruption(msg.into())
    }

    pub fn crypto(msg: impl Into<String>) -> Self {
        Error::Crypto(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Error::Invariant(msg.into())
    }
}

impl From<io::Error> for Error {
    /// Streams without a backing file report an empty path; `open`/`save`
    /// attach the real one via [`Error::io`].
    fn from(source: io::Error) -> Self {
        Error::Io {
            path: PathBuf::new(),
            source,
        }
    }
}
