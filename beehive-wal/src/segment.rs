//! Log segments.
//!
//! A segment is one file holding a run of consecutive entries. Segments are
//! append-only and rolled when they reach their size or entry-count limit.
//!
//! # Segment File Format
//!
//! ```text
//! +-------------------+
//! | Segment Header    |  (32 bytes)
//! +-------------------+
//! | Entry 1           |
//! +-------------------+
//! | ...               |
//! +-------------------+
//! ```
//!
//! Segment header:
//! - Magic (8 bytes): "BHIVEWAL"
//! - Version (4 bytes): format version; incompatible versions refuse to load
//! - Segment ID (8 bytes)
//! - First Index (8 bytes): first log index in this segment
//! - Reserved (4 bytes)

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::entry::{Entry, ENTRY_HEADER_SIZE};
use crate::error::{WalError, WalResult};
use crate::limits::{ENTRIES_PER_SEGMENT_MAX, SEGMENT_BYTES_MAX, SEGMENT_BYTES_MIN};

/// Segment header size in bytes.
pub const SEGMENT_HEADER_SIZE: usize = 32;

/// Magic bytes identifying a Beehive log segment.
const SEGMENT_MAGIC: &[u8; 8] = b"BHIVEWAL";

/// Current segment format version.
const SEGMENT_VERSION: u32 = 1;

/// Unique identifier for a segment within its group directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SegmentId(u64);

impl SegmentId {
    /// Creates a new segment ID.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Returns the next segment ID.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl std::fmt::Display for SegmentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "seg-{:016x}", self.0)
    }
}

/// Configuration for segments.
#[derive(Debug, Clone, Copy)]
pub struct SegmentConfig {
    /// Maximum segment size in bytes.
    pub max_size_bytes: u64,
    /// Maximum entries per segment.
    pub max_entries: u64,
}

impl SegmentConfig {
    /// Creates a configuration with defaults.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_size_bytes: SEGMENT_BYTES_MAX,
            max_entries: ENTRIES_PER_SEGMENT_MAX,
        }
    }

    /// Sets the maximum size in bytes.
    ///
    /// # Panics
    /// Panics if the size is outside the valid range.
    #[must_use]
    pub const fn with_max_size(mut self, size: u64) -> Self {
        assert!(
            size >= SEGMENT_BYTES_MIN && size <= SEGMENT_BYTES_MAX,
            "segment size out of range"
        );
        self.max_size_bytes = size;
        self
    }

    /// Sets the maximum entries per segment. Small values are handy for
    /// exercising rotation in tests.
    ///
    /// # Panics
    /// Panics if `entries` is 0 or exceeds the limit.
    #[must_use]
    pub const fn with_max_entries(mut self, entries: u64) -> Self {
        assert!(entries > 0, "max_entries must be positive");
        assert!(entries <= ENTRIES_PER_SEGMENT_MAX, "max_entries exceeds limit");
        self.max_entries = entries;
        self
    }
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Segment header stored at the start of each segment file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    /// Format version.
    pub version: u32,
    /// Segment identifier.
    pub segment_id: SegmentId,
    /// First log index in this segment.
    pub first_index: u64,
}

impl SegmentHeader {
    /// Creates a new header.
    #[must_use]
    pub const fn new(segment_id: SegmentId, first_index: u64) -> Self {
        Self {
            version: SEGMENT_VERSION,
            segment_id,
            first_index,
        }
    }

    /// Encodes the header.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_slice(SEGMENT_MAGIC);
        buf.put_u32_le(self.version);
        buf.put_u64_le(self.segment_id.get());
        buf.put_u64_le(self.first_index);
        buf.put_u32_le(0); // Reserved
    }

    /// Decodes a header, checking magic and version.
    ///
    /// # Errors
    /// Returns an error if the data is invalid.
    pub fn decode(buf: &mut impl Buf) -> WalResult<Self> {
        if buf.remaining() < SEGMENT_HEADER_SIZE {
            return Err(WalError::InvalidHeader {
                offset: 0,
                reason: "segment header too small",
            });
        }

        let mut magic = [0u8; 8];
        buf.copy_to_slice(&mut magic);
        if &magic != SEGMENT_MAGIC {
            return Err(WalError::InvalidHeader {
                offset: 0,
                reason: "invalid segment magic",
            });
        }

        let version = buf.get_u32_le();
        if version != SEGMENT_VERSION {
            return Err(WalError::InvalidHeader {
                offset: 0,
                reason: "unsupported segment version",
            });
        }

        let segment_id = SegmentId::new(buf.get_u64_le());
        let first_index = buf.get_u64_le();
        let _reserved = buf.get_u32_le();

        Ok(Self {
            version,
            segment_id,
            first_index,
        })
    }
}

/// An in-memory segment, mirrored to one file on disk.
#[derive(Debug, Clone)]
pub struct Segment {
    /// Segment header.
    header: SegmentHeader,
    /// Configuration.
    config: SegmentConfig,
    /// Entries in this segment.
    entries: Vec<Entry>,
    /// Current size in bytes (header + entries).
    size_bytes: u64,
    /// Sealed segments take no further writes.
    sealed: bool,
}

impl Segment {
    /// Creates a new empty segment.
    #[must_use]
    pub const fn new(segment_id: SegmentId, first_index: u64, config: SegmentConfig) -> Self {
        Self {
            header: SegmentHeader::new(segment_id, first_index),
            config,
            entries: Vec::new(),
            size_bytes: SEGMENT_HEADER_SIZE as u64,
            sealed: false,
        }
    }

    /// Returns the segment ID.
    #[must_use]
    pub const fn id(&self) -> SegmentId {
        self.header.segment_id
    }

    /// Returns the first index in this segment.
    #[must_use]
    pub const fn first_index(&self) -> u64 {
        self.header.first_index
    }

    /// Returns the last index, or `None` if empty.
    #[must_use]
    pub fn last_index(&self) -> Option<u64> {
        self.entries.last().map(Entry::index)
    }

    /// Returns the number of entries.
    #[must_use]
    pub fn entry_count(&self) -> u64 {
        self.entries.len() as u64
    }

    /// Returns the current size in bytes.
    #[must_use]
    pub const fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    /// Returns true if the segment is sealed.
    #[must_use]
    pub const fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Returns true if the segment can take an entry of the given payload
    /// size.
    #[must_use]
    pub fn has_space_for(&self, payload_size: u32) -> bool {
        if self.sealed {
            return false;
        }
        let entry_size = ENTRY_HEADER_SIZE as u64 + u64::from(payload_size);
        self.size_bytes + entry_size <= self.config.max_size_bytes
            && self.entries.len() as u64 + 1 <= self.config.max_entries
    }

    /// Appends an entry.
    ///
    /// # Panics
    /// Panics if the segment is sealed.
    ///
    /// # Errors
    /// Returns an error if the segment is full or the index does not follow
    /// the previous one.
    pub fn append(&mut self, entry: Entry) -> WalResult<()> {
        assert!(!self.sealed, "cannot append to sealed segment");

        let entry_size = entry.total_size();
        if self.size_bytes + entry_size > self.config.max_size_bytes {
            return Err(WalError::SegmentFull {
                reason: "size limit reached",
            });
        }
        if self.entries.len() as u64 >= self.config.max_entries {
            return Err(WalError::SegmentFull {
                reason: "entry count limit reached",
            });
        }

        let expected = self
            .entries
            .last()
            .map_or(self.header.first_index, |e| e.index() + 1);
        if entry.index() != expected {
            return Err(WalError::NonSequentialIndex {
                index: entry.index(),
                expected,
            });
        }

        self.size_bytes += entry_size;
        self.entries.push(entry);
        Ok(())
    }

    /// Reads an entry by index.
    ///
    /// # Errors
    /// Returns an error if the index is out of bounds.
    pub fn read(&self, index: u64) -> WalResult<&Entry> {
        let first = self.header.first_index;
        let last = self.entries.last().map_or(first, Entry::index);

        if self.entries.is_empty() || index < first || index > last {
            return Err(WalError::IndexOutOfBounds { index, first, last });
        }

        #[allow(clippy::cast_possible_truncation)] // Bounded by config.
        let offset = (index - first) as usize;
        Ok(&self.entries[offset])
    }

    /// Truncates entries after `last_index_to_keep` (inclusive).
    pub fn truncate_after(&mut self, last_index_to_keep: u64) {
        if self.entries.is_empty() {
            return;
        }

        let first = self.header.first_index;
        if last_index_to_keep < first {
            let removed: u64 = self.entries.iter().map(Entry::total_size).sum();
            self.size_bytes -= removed;
            self.entries.clear();
            return;
        }

        #[allow(clippy::cast_possible_truncation)] // Bounded by config.
        let keep = (last_index_to_keep - first + 1) as usize;
        if keep >= self.entries.len() {
            return;
        }

        let removed: u64 = self.entries[keep..].iter().map(Entry::total_size).sum();
        self.entries.truncate(keep);
        self.size_bytes -= removed;
    }

    /// Seals the segment.
    pub const fn seal(&mut self) {
        self.sealed = true;
    }

    /// Iterates the entries in index order.
    pub fn entries(&self) -> impl Iterator<Item = &Entry> {
        self.entries.iter()
    }

    /// Encodes the whole segment (header + entries).
    #[must_use]
    #[allow(clippy::cast_possible_truncation)] // Size bounded by config.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.size_bytes as usize);
        self.header.encode(&mut buf);
        for entry in &self.entries {
            entry.encode(&mut buf);
        }
        buf.freeze()
    }

    /// Decodes a segment, stopping at the first torn or corrupt tail entry.
    ///
    /// A partial entry at the end of the file is the normal signature of a
    /// crash mid-write; everything before it is kept.
    ///
    /// # Errors
    /// Returns an error if the segment header itself is invalid.
    pub fn decode(mut data: Bytes, config: SegmentConfig) -> WalResult<Self> {
        let header = SegmentHeader::decode(&mut data)?;

        let mut entries = Vec::new();
        let mut offset = SEGMENT_HEADER_SIZE as u64;

        while data.has_remaining() {
            if data.remaining() < ENTRY_HEADER_SIZE {
                break; // partial header: torn final write
            }
            match Entry::decode(&mut data, offset) {
                Ok(entry) => {
                    offset += entry.total_size();
                    entries.push(entry);
                }
                Err(
                    WalError::TruncatedEntry { .. } | WalError::ChecksumMismatch { .. },
                ) => break,
                Err(e) => return Err(e),
            }
        }

        let size_bytes =
            SEGMENT_HEADER_SIZE as u64 + entries.iter().map(Entry::total_size).sum::<u64>();

        Ok(Self {
            header,
            config,
            entries,
            size_bytes,
            sealed: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::EntryKind;

    fn make_entry(index: u64, data: &str) -> Entry {
        Entry::new(1, index, EntryKind::Command, Bytes::from(data.to_owned())).unwrap()
    }

    #[test]
    fn test_header_roundtrip() {
        let header = SegmentHeader::new(SegmentId::new(42), 100);
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert_eq!(buf.len(), SEGMENT_HEADER_SIZE);

        let decoded = SegmentHeader::decode(&mut buf.freeze()).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_append_and_read() {
        let mut segment = Segment::new(SegmentId::new(1), 1, SegmentConfig::new());
        for i in 1..=5 {
            segment.append(make_entry(i, "x")).unwrap();
        }

        assert_eq!(segment.entry_count(), 5);
        assert_eq!(segment.last_index(), Some(5));
        assert_eq!(segment.read(3).unwrap().index(), 3);
        assert!(segment.read(6).is_err());
    }

    #[test]
    fn test_non_sequential_rejected() {
        let mut segment = Segment::new(SegmentId::new(1), 1, SegmentConfig::new());
        segment.append(make_entry(1, "x")).unwrap();

        let result = segment.append(make_entry(3, "x"));
        assert!(matches!(result, Err(WalError::NonSequentialIndex { .. })));
    }

    #[test]
    fn test_segment_roundtrip() {
        let config = SegmentConfig::new();
        let mut segment = Segment::new(SegmentId::new(1), 1, config);
        for i in 1..=3 {
            segment.append(make_entry(i, "data")).unwrap();
        }

        let decoded = Segment::decode(segment.encode(), config).unwrap();
        assert_eq!(decoded.entry_count(), 3);
        assert_eq!(decoded.read(2).unwrap(), segment.read(2).unwrap());
    }

    #[test]
    fn test_torn_tail_dropped() {
        let config = SegmentConfig::new();
        let mut segment = Segment::new(SegmentId::new(1), 1, config);
        for i in 1..=3 {
            segment.append(make_entry(i, "payload")).unwrap();
        }

        let encoded = segment.encode();
        // Chop into the last entry's payload.
        let torn = encoded.slice(..encoded.len() - 3);

        let decoded = Segment::decode(torn, config).unwrap();
        assert_eq!(decoded.entry_count(), 2);
        assert_eq!(decoded.last_index(), Some(2));
    }

    #[test]
    fn test_corrupt_tail_dropped() {
        let config = SegmentConfig::new();
        let mut segment = Segment::new(SegmentId::new(1), 1, config);
        for i in 1..=3 {
            segment.append(make_entry(i, "payload")).unwrap();
        }

        let mut encoded = BytesMut::from(&segment.encode()[..]);
        let last = encoded.len() - 1;
        encoded[last] ^= 0xFF;

        let decoded = Segment::decode(encoded.freeze(), config).unwrap();
        assert_eq!(decoded.entry_count(), 2);
    }

    #[test]
    fn test_entry_count_limit() {
        let config = SegmentConfig::new().with_max_entries(3);
        let mut segment = Segment::new(SegmentId::new(1), 1, config);
        for i in 1..=3 {
            segment.append(make_entry(i, "x")).unwrap();
        }

        let result = segment.append(make_entry(4, "x"));
        assert!(matches!(result, Err(WalError::SegmentFull { .. })));
        assert!(!segment.has_space_for(1));
    }

    #[test]
    fn test_truncate_after() {
        let mut segment = Segment::new(SegmentId::new(1), 1, SegmentConfig::new());
        for i in 1..=5 {
            segment.append(make_entry(i, "x")).unwrap();
        }

        segment.truncate_after(3);
        assert_eq!(segment.entry_count(), 3);
        assert_eq!(segment.last_index(), Some(3));
    }
}
