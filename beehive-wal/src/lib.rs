//! Beehive WAL - durable log and snapshot storage for consensus groups.
//!
//! Every persistent group (the cluster registry and each durable colony)
//! owns one directory holding an append-only log segmented by size plus
//! periodic snapshot files. Entries and snapshots are CRC-guarded; recovery
//! scans forward and truncates at the first corruption, treating it as a
//! torn final write.
//!
//! # On-disk layout
//!
//! ```text
//! <group dir>/
//!   seg-0000000000000001.log
//!   seg-0000000000000002.log
//!   snap-0000000000002710.snap
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod entry;
mod error;
mod segment;
mod snapfile;
mod wal;

pub use entry::{Entry, EntryHeader, EntryKind, ENTRY_HEADER_SIZE};
pub use error::{WalError, WalResult};
pub use segment::{Segment, SegmentConfig, SegmentHeader, SegmentId, SEGMENT_HEADER_SIZE};
pub use snapfile::SnapshotStore;
pub use wal::Wal;

/// WAL limits.
pub mod limits {
    /// Maximum payload size of one entry (8 MB).
    pub const ENTRY_PAYLOAD_BYTES_MAX: u32 = 8 * 1024 * 1024;

    /// Maximum segment size (1 GB).
    pub const SEGMENT_BYTES_MAX: u64 = 1024 * 1024 * 1024;

    /// Minimum segment size (64 KB).
    pub const SEGMENT_BYTES_MIN: u64 = 64 * 1024;

    /// Maximum entries per segment.
    pub const ENTRIES_PER_SEGMENT_MAX: u64 = 1_000_000;
}
