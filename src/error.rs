use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Engine errors
///
/// Corrupt memo blocks are intentionally absent: a damaged or dangling memo
/// pointer yields an empty memo, never a failure of the surrounding read.
#[derive(Debug, Error)]
pub enum Error {
    #[error("file not found: {0}")]
    NotFound(PathBuf),
    #[error("corrupt table: {0}")]
    CorruptTable(&'static str),
    #[error("corrupt index: {0}")]
    CorruptIndex(&'static str),
    #[error("schema error: {0}")]
    Schema(String),
    #[error("heap layout exceeds the {0}-byte record budget")]
    HeapOverflow(usize),
    #[error("missing index file: {0}")]
    MissingIndex(PathBuf),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Maps `io::ErrorKind::NotFound` on `path` to [`Error::NotFound`],
    /// leaving every other I/O failure untouched.
    pub(crate) fn from_open(err: io::Error, path: &std::path::Path) -> Self {
        if err.kind() == io::ErrorKind::NotFound {
            Self::NotFound(path.to_path_buf())
        } else {
            Self::Io(err)
        }
    }
}
