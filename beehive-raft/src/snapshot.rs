//! Group snapshots for follower catch-up and log compaction.
//!
//! A snapshot captures a state machine at a point in the log, letting slow
//! followers resume without replaying the whole log and letting segments
//! below the snapshot index be deleted.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use beehive_core::{LogIndex, TermId};

/// Maximum snapshot data size (256 MB).
pub const SNAPSHOT_SIZE_MAX: u64 = 256 * 1024 * 1024;

/// Header size: magic(4) + version(4) + index(8) + term(8) + len(8) + crc(4).
const SNAPSHOT_HEADER_SIZE: usize = 36;

/// Magic bytes guarding snapshot loads.
const SNAPSHOT_MAGIC: u32 = 0x4253_4E50; // "BSNP"

/// Snapshot format version. Incompatible framings refuse to load.
const SNAPSHOT_VERSION: u32 = 1;

/// A point-in-time snapshot of one group's state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    /// Last log index folded into this snapshot.
    pub last_index: LogIndex,
    /// Term of that last entry.
    pub last_term: TermId,
    /// Serialized state machine.
    pub data: Bytes,
    /// CRC32C of `data`.
    pub checksum: u32,
}

impl Snapshot {
    /// Creates a new snapshot over the given state bytes.
    ///
    /// # Panics
    /// Panics if the data exceeds `SNAPSHOT_SIZE_MAX`.
    #[must_use]
    pub fn new(last_index: LogIndex, last_term: TermId, data: Bytes) -> Self {
        assert!(
            data.len() as u64 <= SNAPSHOT_SIZE_MAX,
            "snapshot data exceeds maximum size: {} > {SNAPSHOT_SIZE_MAX}",
            data.len()
        );
        let checksum = crc32fast::hash(&data);
        Self {
            last_index,
            last_term,
            data,
            checksum,
        }
    }

    /// Creates an empty snapshot (initial state).
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            last_index: LogIndex::new(0),
            last_term: TermId::new(0),
            data: Bytes::new(),
            checksum: 0,
        }
    }

    /// Returns true if this is the empty initial snapshot.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.last_index.get() == 0 && self.data.is_empty()
    }

    /// Verifies the stored checksum against the data.
    #[must_use]
    pub fn verify_checksum(&self) -> bool {
        crc32fast::hash(&self.data) == self.checksum
    }

    /// Encodes the snapshot with its header.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(SNAPSHOT_HEADER_SIZE + self.data.len());
        buf.put_u32_le(SNAPSHOT_MAGIC);
        buf.put_u32_le(SNAPSHOT_VERSION);
        buf.put_u64_le(self.last_index.get());
        buf.put_u64_le(self.last_term.get());
        buf.put_u64_le(self.data.len() as u64);
        buf.put_u32_le(self.checksum);
        buf.put_slice(&self.data);
        buf.freeze()
    }

    /// Decodes a snapshot, verifying magic, version, and checksum.
    ///
    /// # Errors
    /// Returns an error on truncation, unknown framing, or corruption.
    pub fn decode(mut buf: Bytes) -> Result<Self, SnapshotError> {
        if buf.remaining() < SNAPSHOT_HEADER_SIZE {
            return Err(SnapshotError::Truncated {
                expected: SNAPSHOT_HEADER_SIZE as u64,
                found: buf.remaining() as u64,
            });
        }

        let magic = buf.get_u32_le();
        if magic != SNAPSHOT_MAGIC {
            return Err(SnapshotError::BadMagic { found: magic });
        }
        let version = buf.get_u32_le();
        if version != SNAPSHOT_VERSION {
            return Err(SnapshotError::UnsupportedVersion { found: version });
        }

        let last_index = LogIndex::new(buf.get_u64_le());
        let last_term = TermId::new(buf.get_u64_le());
        let data_len = buf.get_u64_le();
        let checksum = buf.get_u32_le();

        if (buf.remaining() as u64) < data_len {
            return Err(SnapshotError::Truncated {
                expected: data_len,
                found: buf.remaining() as u64,
            });
        }
        let data = buf.copy_to_bytes(usize::try_from(data_len).map_err(|_| {
            SnapshotError::Truncated {
                expected: data_len,
                found: 0,
            }
        })?);

        let snapshot = Self {
            last_index,
            last_term,
            data,
            checksum,
        };
        if !snapshot.verify_checksum() {
            return Err(SnapshotError::ChecksumMismatch {
                expected: crc32fast::hash(&snapshot.data),
                actual: checksum,
            });
        }
        Ok(snapshot)
    }
}

/// Errors from snapshot encoding and decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotError {
    /// The buffer ended before the declared content.
    Truncated {
        /// Bytes expected.
        expected: u64,
        /// Bytes found.
        found: u64,
    },
    /// The magic bytes did not match.
    BadMagic {
        /// The value found in place of the magic.
        found: u32,
    },
    /// The format version is not supported.
    UnsupportedVersion {
        /// The version found.
        found: u32,
    },
    /// The data checksum did not match.
    ChecksumMismatch {
        /// Checksum computed over the data.
        expected: u32,
        /// Checksum stored in the header.
        actual: u32,
    },
}

impl std::fmt::Display for SnapshotError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Truncated { expected, found } => {
                write!(f, "truncated snapshot: expected {expected} bytes, found {found}")
            }
            Self::BadMagic { found } => write!(f, "bad snapshot magic: {found:#x}"),
            Self::UnsupportedVersion { found } => {
                write!(f, "unsupported snapshot version: {found}")
            }
            Self::ChecksumMismatch { expected, actual } => {
                write!(f, "snapshot checksum mismatch: computed {expected:#x}, stored {actual:#x}")
            }
        }
    }
}

impl std::error::Error for SnapshotError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_roundtrip() {
        let snap = Snapshot::new(LogIndex::new(42), TermId::new(3), Bytes::from("state"));
        let decoded = Snapshot::decode(snap.encode()).unwrap();
        assert_eq!(decoded, snap);
    }

    #[test]
    fn test_empty_snapshot() {
        let snap = Snapshot::empty();
        assert!(snap.is_empty());
        assert!(snap.verify_checksum());
    }

    #[test]
    fn test_corruption_detected() {
        let snap = Snapshot::new(LogIndex::new(1), TermId::new(1), Bytes::from("state"));
        let mut encoded = BytesMut::from(&snap.encode()[..]);
        let last = encoded.len() - 1;
        encoded[last] ^= 0xFF;

        let result = Snapshot::decode(encoded.freeze());
        assert!(matches!(result, Err(SnapshotError::ChecksumMismatch { .. })));
    }

    #[test]
    fn test_bad_magic_rejected() {
        let snap = Snapshot::new(LogIndex::new(1), TermId::new(1), Bytes::from("x"));
        let mut encoded = BytesMut::from(&snap.encode()[..]);
        encoded[0] ^= 0xFF;

        let result = Snapshot::decode(encoded.freeze());
        assert!(matches!(result, Err(SnapshotError::BadMagic { .. })));
    }

    #[test]
    fn test_truncated_rejected() {
        let snap = Snapshot::new(LogIndex::new(1), TermId::new(1), Bytes::from("longer state"));
        let encoded = snap.encode();
        let truncated = encoded.slice(..encoded.len() - 4);

        let result = Snapshot::decode(truncated);
        assert!(matches!(result, Err(SnapshotError::Truncated { .. })));
    }
}
