//! WAL error types.

use std::path::PathBuf;

use thiserror::Error;

/// Result type for WAL operations.
pub type WalResult<T> = Result<T, WalError>;

/// Errors from WAL operations.
#[derive(Debug, Error)]
pub enum WalError {
    /// An entry payload exceeded the size limit.
    #[error("entry too large: {size} bytes (max {max})")]
    EntryTooLarge {
        /// Payload size in bytes.
        size: u32,
        /// Maximum allowed.
        max: u32,
    },

    /// A stored checksum did not match the recomputed one.
    #[error("checksum mismatch at offset {offset}: computed {expected:#x}, stored {actual:#x}")]
    ChecksumMismatch {
        /// Byte offset of the entry within its segment.
        offset: u64,
        /// Checksum computed over the data.
        expected: u32,
        /// Checksum read from disk.
        actual: u32,
    },

    /// An entry or segment header failed structural validation.
    #[error("invalid header at offset {offset}: {reason}")]
    InvalidHeader {
        /// Byte offset of the header.
        offset: u64,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// An entry's payload ended before its declared length.
    #[error("truncated entry at offset {offset}: expected {expected} bytes, found {found}")]
    TruncatedEntry {
        /// Byte offset of the entry.
        offset: u64,
        /// Declared payload length.
        expected: u32,
        /// Bytes actually present.
        found: u32,
    },

    /// The active segment cannot take another entry.
    #[error("segment full: {reason}")]
    SegmentFull {
        /// Which limit was hit.
        reason: &'static str,
    },

    /// A read addressed an index outside the stored range.
    #[error("index {index} out of bounds [{first}, {last}]")]
    IndexOutOfBounds {
        /// Requested index.
        index: u64,
        /// First stored index.
        first: u64,
        /// Last stored index.
        last: u64,
    },

    /// An index did not follow the previous one.
    #[error("non-sequential index {index}: expected {expected}")]
    NonSequentialIndex {
        /// The index offered.
        index: u64,
        /// The index required.
        expected: u64,
    },

    /// Filesystem error with its path.
    #[error("I/O error on {path}: {source}")]
    Io {
        /// The path involved.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },
}

impl WalError {
    /// Wraps an I/O error with its path.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
