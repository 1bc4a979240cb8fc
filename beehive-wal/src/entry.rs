//! Log entry framing.
//!
//! Each entry on disk has the following binary format:
//!
//! ```text
//! +----------+----------+----------+----------+--------+----------+
//! |  Length  |  CRC32   |   Term   |  Index   |  Kind  | Payload  |
//! | (4 bytes)| (4 bytes)| (8 bytes)| (8 bytes)| (1 b)  | (N bytes)|
//! +----------+----------+----------+----------+--------+----------+
//! ```
//!
//! - Length: payload length in bytes (not including the header)
//! - CRC32: checksum of Term + Index + Kind + Payload
//! - Term: consensus term when the entry was created
//! - Index: log index of this entry
//! - Kind: what the payload holds (command / control / snapshot marker)
//!
//! All integers are little-endian.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{WalError, WalResult};
use crate::limits::ENTRY_PAYLOAD_BYTES_MAX;

/// Size of the entry header in bytes.
pub const ENTRY_HEADER_SIZE: usize = 25; // 4 + 4 + 8 + 8 + 1

/// What an entry's payload holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EntryKind {
    /// A replicated state machine command.
    Command = 0,
    /// Consensus metadata (term/vote records, membership).
    Control = 1,
    /// Marker noting that a snapshot covers all entries at or below this
    /// index; segments below it are reclaimable.
    SnapshotMarker = 2,
}

impl EntryKind {
    /// Decodes a kind byte.
    ///
    /// # Errors
    /// Returns an error for unknown kinds.
    pub const fn from_u8(value: u8, offset: u64) -> WalResult<Self> {
        match value {
            0 => Ok(Self::Command),
            1 => Ok(Self::Control),
            2 => Ok(Self::SnapshotMarker),
            _ => Err(WalError::InvalidHeader {
                offset,
                reason: "unknown entry kind",
            }),
        }
    }
}

/// Entry header with metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryHeader {
    /// Payload length in bytes.
    pub length: u32,
    /// CRC32 of term + index + kind + payload.
    pub crc: u32,
    /// Consensus term when the entry was created.
    pub term: u64,
    /// Log index of this entry.
    pub index: u64,
    /// Payload kind.
    pub kind: EntryKind,
}

impl EntryHeader {
    /// Creates a header, computing the CRC over the given payload.
    ///
    /// # Errors
    /// Returns an error if the payload exceeds the size limit.
    pub fn new(term: u64, index: u64, kind: EntryKind, payload: &[u8]) -> WalResult<Self> {
        if payload.len() > ENTRY_PAYLOAD_BYTES_MAX as usize {
            #[allow(clippy::cast_possible_truncation)]
            return Err(WalError::EntryTooLarge {
                size: payload.len() as u32,
                max: ENTRY_PAYLOAD_BYTES_MAX,
            });
        }

        #[allow(clippy::cast_possible_truncation)]
        let length = payload.len() as u32;
        let crc = Self::compute_crc(term, index, kind, payload);

        Ok(Self {
            length,
            crc,
            term,
            index,
            kind,
        })
    }

    fn compute_crc(term: u64, index: u64, kind: EntryKind, payload: &[u8]) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&term.to_le_bytes());
        hasher.update(&index.to_le_bytes());
        hasher.update(&[kind as u8]);
        hasher.update(payload);
        hasher.finalize()
    }

    /// Verifies the CRC against a payload.
    ///
    /// # Errors
    /// Returns `ChecksumMismatch` if the CRC does not match.
    pub fn verify(&self, payload: &[u8], offset: u64) -> WalResult<()> {
        let expected = Self::compute_crc(self.term, self.index, self.kind, payload);
        if expected != self.crc {
            return Err(WalError::ChecksumMismatch {
                offset,
                expected,
                actual: self.crc,
            });
        }
        Ok(())
    }

    /// Encodes the header.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.length);
        buf.put_u32_le(self.crc);
        buf.put_u64_le(self.term);
        buf.put_u64_le(self.index);
        buf.put_u8(self.kind as u8);
    }

    /// Decodes a header.
    ///
    /// # Errors
    /// Returns an error if the buffer is too small or the header invalid.
    pub fn decode(buf: &mut impl Buf, offset: u64) -> WalResult<Self> {
        if buf.remaining() < ENTRY_HEADER_SIZE {
            return Err(WalError::InvalidHeader {
                offset,
                reason: "buffer too small for header",
            });
        }

        let length = buf.get_u32_le();
        let crc = buf.get_u32_le();
        let term = buf.get_u64_le();
        let index = buf.get_u64_le();
        let kind = EntryKind::from_u8(buf.get_u8(), offset)?;

        if length > ENTRY_PAYLOAD_BYTES_MAX {
            return Err(WalError::InvalidHeader {
                offset,
                reason: "length exceeds maximum",
            });
        }

        Ok(Self {
            length,
            crc,
            term,
            index,
            kind,
        })
    }

    /// Total size of the entry (header + payload).
    #[must_use]
    pub const fn total_size(&self) -> u64 {
        ENTRY_HEADER_SIZE as u64 + self.length as u64
    }
}

/// A complete log entry (header + payload).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Entry header.
    pub header: EntryHeader,
    /// Payload bytes.
    pub payload: Bytes,
}

impl Entry {
    /// Creates a new entry.
    ///
    /// # Errors
    /// Returns an error if the payload is too large.
    pub fn new(term: u64, index: u64, kind: EntryKind, payload: Bytes) -> WalResult<Self> {
        let header = EntryHeader::new(term, index, kind, &payload)?;
        Ok(Self { header, payload })
    }

    /// Returns the consensus term.
    #[must_use]
    pub const fn term(&self) -> u64 {
        self.header.term
    }

    /// Returns the log index.
    #[must_use]
    pub const fn index(&self) -> u64 {
        self.header.index
    }

    /// Returns the payload kind.
    #[must_use]
    pub const fn kind(&self) -> EntryKind {
        self.header.kind
    }

    /// Returns the total encoded size.
    #[must_use]
    pub const fn total_size(&self) -> u64 {
        self.header.total_size()
    }

    /// Encodes the entry.
    pub fn encode(&self, buf: &mut BytesMut) {
        self.header.encode(buf);
        buf.put_slice(&self.payload);
    }

    /// Decodes an entry, verifying its checksum.
    ///
    /// # Errors
    /// Returns an error if the data is invalid or corrupted.
    pub fn decode(buf: &mut impl Buf, offset: u64) -> WalResult<Self> {
        let header = EntryHeader::decode(buf, offset)?;

        if buf.remaining() < header.length as usize {
            #[allow(clippy::cast_possible_truncation)]
            return Err(WalError::TruncatedEntry {
                offset,
                expected: header.length,
                found: buf.remaining() as u32,
            });
        }

        let payload = buf.copy_to_bytes(header.length as usize);
        header.verify(&payload, offset)?;

        Ok(Self { header, payload })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_roundtrip() {
        let payload = Bytes::from("hello, hive!");
        let entry = Entry::new(1, 42, EntryKind::Command, payload.clone()).unwrap();

        assert_eq!(entry.term(), 1);
        assert_eq!(entry.index(), 42);
        assert_eq!(entry.payload, payload);

        let mut buf = BytesMut::new();
        entry.encode(&mut buf);

        let decoded = Entry::decode(&mut buf.freeze(), 0).unwrap();
        assert_eq!(decoded, entry);
    }

    #[test]
    fn test_checksum_detects_corruption() {
        let entry = Entry::new(1, 1, EntryKind::Command, Bytes::from("test")).unwrap();

        let mut buf = BytesMut::new();
        entry.encode(&mut buf);
        let len = buf.len();
        buf[len - 1] ^= 0xFF;

        let result = Entry::decode(&mut buf.freeze(), 0);
        assert!(matches!(result, Err(WalError::ChecksumMismatch { .. })));
    }

    #[test]
    fn test_kind_roundtrip() {
        for kind in [EntryKind::Command, EntryKind::Control, EntryKind::SnapshotMarker] {
            let entry = Entry::new(1, 1, kind, Bytes::from("x")).unwrap();
            let mut buf = BytesMut::new();
            entry.encode(&mut buf);
            let decoded = Entry::decode(&mut buf.freeze(), 0).unwrap();
            assert_eq!(decoded.kind(), kind);
        }
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let entry = Entry::new(1, 1, EntryKind::Command, Bytes::from("x")).unwrap();
        let mut buf = BytesMut::new();
        entry.encode(&mut buf);
        buf[24] = 99; // kind byte

        let result = Entry::decode(&mut buf.freeze(), 0);
        assert!(matches!(result, Err(WalError::InvalidHeader { .. })));
    }

    #[test]
    fn test_entry_too_large() {
        let payload = Bytes::from(vec![0u8; ENTRY_PAYLOAD_BYTES_MAX as usize + 1]);
        let result = Entry::new(1, 1, EntryKind::Command, payload);
        assert!(matches!(result, Err(WalError::EntryTooLarge { .. })));
    }

    #[test]
    fn test_header_size_constant() {
        let header = EntryHeader::new(1, 1, EntryKind::Command, &[]).unwrap();
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert_eq!(buf.len(), ENTRY_HEADER_SIZE);
    }

    #[test]
    fn test_truncated_entry() {
        let entry = Entry::new(1, 1, EntryKind::Command, Bytes::from("hello")).unwrap();
        let mut buf = BytesMut::new();
        entry.encode(&mut buf);
        buf.truncate(ENTRY_HEADER_SIZE + 2);

        let result = Entry::decode(&mut buf.freeze(), 0);
        assert!(matches!(result, Err(WalError::TruncatedEntry { .. })));
    }
}
