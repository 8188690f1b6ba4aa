//! Error types returned by the storage engine.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors produced by the storage engine.
#[derive(Error, Debug)]
pub enum Error {
    /// The store directory does not exist.
    #[error("directory not found: {0}")]
    NotFound(PathBuf),

    /// The store path exists but is not a directory.
    #[error("{0} is not a directory")]
    NotADirectory(PathBuf),

    /// A log record or hint record could not be decoded.
    #[error("corrupt segment {segment_id} at offset {offset}: {reason}")]
    Corrupt {
        /// Segment the corruption was found in.
        segment_id: u64,
        /// Byte offset within the segment where decoding failed.
        offset: u64,
        /// Human-readable description of what went wrong.
        reason: String,
    },

    /// An underlying OS error during a read, write, fsync, open, or close.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// `append`/`sync` was called on an immutable segment.
    #[error("operation is not valid on an immutable segment")]
    InvalidOperation,

    /// The engine was already closed.
    #[error("engine is closed")]
    Closed,
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn corrupt(segment_id: u64, offset: u64, reason: impl Into<String>) -> Self {
        Error::Corrupt {
            segment_id,
            offset,
            reason: reason.into(),
        }
    }
}
