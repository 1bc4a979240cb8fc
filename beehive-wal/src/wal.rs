//! Directory-backed write-ahead log for one consensus group.
//!
//! The log is a sequence of segment files. Appends go to the active (last)
//! segment; when it fills, it is sealed and a new file is started. Recovery
//! re-reads every segment, drops any torn tail, and rewrites the file so
//! disk and memory agree.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use bytes::{Bytes, BytesMut};
use tracing::{debug, info, warn};

use crate::entry::{Entry, EntryKind};
use crate::error::{WalError, WalResult};
use crate::segment::{Segment, SegmentConfig, SegmentId};

/// Extension for segment files.
const SEGMENT_EXT: &str = "log";

/// A durable, segmented log.
#[derive(Debug)]
pub struct Wal {
    /// Directory holding the segment files.
    dir: PathBuf,
    /// Segment configuration.
    config: SegmentConfig,
    /// All live segments; the last one is active, earlier ones are sealed.
    segments: Vec<Segment>,
    /// Open handle to the active segment file.
    active_file: File,
}

impl Wal {
    /// Opens (or creates) the log in `dir`, recovering existing segments.
    ///
    /// Recovery drops torn or corrupt tails and any segments after the
    /// first unreadable one, then rewrites the surviving tail file so the
    /// on-disk state matches memory.
    ///
    /// # Errors
    /// Returns an error on filesystem failure or an unreadable segment
    /// header in the middle of the log.
    pub fn open(dir: impl Into<PathBuf>, config: SegmentConfig) -> WalResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| WalError::io(&dir, e))?;

        let mut segment_paths = list_segment_files(&dir)?;
        segment_paths.sort_by_key(|(id, _)| *id);

        let mut segments = Vec::new();
        let mut expected_next: Option<u64> = None;

        for (id, path) in segment_paths {
            let data = fs::read(&path).map_err(|e| WalError::io(&path, e))?;
            let segment = match Segment::decode(Bytes::from(data), config) {
                Ok(s) => s,
                Err(e) => {
                    // An unreadable header means everything from here on is
                    // garbage; recovery keeps the prefix.
                    warn!(segment = %id, error = %e, "dropping unreadable segment and successors");
                    remove_segments_from(&dir, id)?;
                    break;
                }
            };

            if let Some(expected) = expected_next {
                if segment.first_index() != expected {
                    warn!(
                        segment = %id,
                        first = segment.first_index(),
                        expected,
                        "index gap after torn tail, dropping segment and successors"
                    );
                    remove_segments_from(&dir, id)?;
                    break;
                }
            }

            expected_next = Some(
                segment
                    .last_index()
                    .map_or(segment.first_index(), |l| l + 1),
            );
            segments.push(segment);
        }

        // Seal everything but the tail; rewrite the tail so a dropped torn
        // entry is also gone from disk.
        let tail_len = segments.len();
        for segment in segments.iter_mut().take(tail_len.saturating_sub(1)) {
            segment.seal();
        }

        if segments.is_empty() {
            segments.push(Segment::new(SegmentId::new(1), 1, config));
        }

        let active = segments.last().ok_or_else(|| WalError::InvalidHeader {
            offset: 0,
            reason: "no active segment after recovery",
        })?;
        let active_path = segment_path(&dir, active.id());
        fs::write(&active_path, active.encode()).map_err(|e| WalError::io(&active_path, e))?;
        let active_file = OpenOptions::new()
            .append(true)
            .open(&active_path)
            .map_err(|e| WalError::io(&active_path, e))?;

        let wal = Self {
            dir,
            config,
            segments,
            active_file,
        };
        info!(
            dir = %wal.dir.display(),
            segments = wal.segments.len(),
            last_index = wal.last_index(),
            "log opened"
        );
        Ok(wal)
    }

    /// Returns the first stored index, or 0 if empty.
    #[must_use]
    pub fn first_index(&self) -> u64 {
        self.segments
            .iter()
            .find(|s| s.entry_count() > 0)
            .map_or(0, Segment::first_index)
    }

    /// Returns the last stored index, or 0 if empty.
    #[must_use]
    pub fn last_index(&self) -> u64 {
        self.segments
            .iter()
            .rev()
            .find_map(Segment::last_index)
            .unwrap_or(0)
    }

    /// Appends an entry, rolling to a new segment when the active one is
    /// full.
    ///
    /// # Errors
    /// Returns an error on filesystem failure, an over-size payload, or a
    /// non-sequential index.
    pub fn append(&mut self, term: u64, index: u64, kind: EntryKind, payload: Bytes) -> WalResult<()> {
        let entry = Entry::new(term, index, kind, payload)?;

        #[allow(clippy::cast_possible_truncation)]
        let payload_len = entry.payload.len() as u32;
        if !self.active().has_space_for(payload_len) {
            self.roll(index)?;
        }

        let mut buf = BytesMut::with_capacity(usize::try_from(entry.total_size()).unwrap_or(0));
        entry.encode(&mut buf);

        let active = self
            .segments
            .last_mut()
            .ok_or_else(|| WalError::InvalidHeader {
                offset: 0,
                reason: "no active segment",
            })?;
        active.append(entry)?;

        self.active_file
            .write_all(&buf)
            .map_err(|e| WalError::io(&self.dir, e))?;
        Ok(())
    }

    /// Flushes buffered writes to the OS and disk.
    ///
    /// # Errors
    /// Returns an error on filesystem failure.
    pub fn sync(&mut self) -> WalResult<()> {
        self.active_file
            .sync_data()
            .map_err(|e| WalError::io(&self.dir, e))?;
        Ok(())
    }

    /// Reads an entry by index.
    ///
    /// # Errors
    /// Returns an error if the index is not stored.
    pub fn read(&self, index: u64) -> WalResult<&Entry> {
        let segment = self
            .segments
            .iter()
            .rev()
            .find(|s| s.first_index() <= index)
            .ok_or(WalError::IndexOutOfBounds {
                index,
                first: self.first_index(),
                last: self.last_index(),
            })?;
        segment.read(index)
    }

    /// Returns entries from `start` through the last index.
    #[must_use]
    pub fn entries_from(&self, start: u64) -> Vec<Entry> {
        let mut out = Vec::new();
        for segment in &self.segments {
            for entry in segment.entries() {
                if entry.index() >= start {
                    out.push(entry.clone());
                }
            }
        }
        out
    }

    /// Truncates everything after `last_to_keep`, rewriting affected files.
    ///
    /// # Errors
    /// Returns an error on filesystem failure.
    pub fn truncate_after(&mut self, last_to_keep: u64) -> WalResult<()> {
        // Drop whole segments that start past the keep point.
        while let Some(last) = self.segments.last() {
            if self.segments.len() > 1 && last.first_index() > last_to_keep {
                let path = segment_path(&self.dir, last.id());
                fs::remove_file(&path).map_err(|e| WalError::io(&path, e))?;
                self.segments.pop();
            } else {
                break;
            }
        }

        let tail = self
            .segments
            .last_mut()
            .ok_or_else(|| WalError::InvalidHeader {
                offset: 0,
                reason: "no active segment",
            })?;
        tail.truncate_after(last_to_keep);

        // Rebuild the tail unsealed so it takes appends again, and rewrite
        // its file so disk agrees with memory.
        let mut fresh = Segment::new(tail.id(), tail.first_index(), self.config);
        for entry in tail.entries() {
            fresh.append(entry.clone())?;
        }
        *tail = fresh;
        let rewritten = tail.encode();
        let tail_id = tail.id();

        let path = segment_path(&self.dir, tail_id);
        fs::write(&path, rewritten).map_err(|e| WalError::io(&path, e))?;
        self.active_file = OpenOptions::new()
            .append(true)
            .open(&path)
            .map_err(|e| WalError::io(&path, e))?;

        debug!(last_to_keep, "log truncated");
        Ok(())
    }

    /// Deletes sealed segments wholly below `index` (exclusive).
    ///
    /// Called after a snapshot covers those entries.
    ///
    /// # Errors
    /// Returns an error on filesystem failure.
    pub fn compact_below(&mut self, index: u64) -> WalResult<()> {
        let mut kept = Vec::new();
        for segment in self.segments.drain(..) {
            let disposable =
                segment.is_sealed() && segment.last_index().is_some_and(|last| last < index);
            if disposable {
                let path = segment_path(&self.dir, segment.id());
                fs::remove_file(&path).map_err(|e| WalError::io(&path, e))?;
            } else {
                kept.push(segment);
            }
        }
        self.segments = kept;
        Ok(())
    }

    /// Returns the number of live segments.
    #[must_use]
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    fn active(&self) -> &Segment {
        // Invariant: segments is never empty after open().
        assert!(!self.segments.is_empty(), "log has no active segment");
        &self.segments[self.segments.len() - 1]
    }

    fn roll(&mut self, next_index: u64) -> WalResult<()> {
        let next_id = self.active().id().next();
        if let Some(active) = self.segments.last_mut() {
            active.seal();
        }

        let segment = Segment::new(next_id, next_index, self.config);
        let path = segment_path(&self.dir, next_id);
        fs::write(&path, segment.encode()).map_err(|e| WalError::io(&path, e))?;
        self.active_file = OpenOptions::new()
            .append(true)
            .open(&path)
            .map_err(|e| WalError::io(&path, e))?;
        self.segments.push(segment);

        debug!(segment = %next_id, first_index = next_index, "rolled to new segment");
        Ok(())
    }
}

fn segment_path(dir: &Path, id: SegmentId) -> PathBuf {
    dir.join(format!("seg-{:016x}.{SEGMENT_EXT}", id.get()))
}

fn list_segment_files(dir: &Path) -> WalResult<Vec<(SegmentId, PathBuf)>> {
    let mut out = Vec::new();
    let entries = fs::read_dir(dir).map_err(|e| WalError::io(dir, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| WalError::io(dir, e))?;
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if let Some(id) = parse_segment_name(name) {
            out.push((id, path));
        }
    }
    Ok(out)
}

fn parse_segment_name(name: &str) -> Option<SegmentId> {
    let stem = name
        .strip_prefix("seg-")?
        .strip_suffix(&format!(".{SEGMENT_EXT}"))?;
    u64::from_str_radix(stem, 16).ok().map(SegmentId::new)
}

fn remove_segments_from(dir: &Path, first: SegmentId) -> WalResult<()> {
    for (id, path) in list_segment_files(dir)? {
        if id >= first {
            fs::remove_file(&path).map_err(|e| WalError::io(&path, e))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn small_config() -> SegmentConfig {
        SegmentConfig::new()
            .with_max_size(64 * 1024)
            .with_max_entries(4)
    }

    fn append_n(wal: &mut Wal, from: u64, to: u64) {
        for i in from..=to {
            wal.append(1, i, EntryKind::Command, Bytes::from(format!("e{i}")))
                .unwrap();
        }
        wal.sync().unwrap();
    }

    #[test]
    fn test_append_and_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let mut wal = Wal::open(dir.path(), small_config()).unwrap();
            append_n(&mut wal, 1, 3);
            assert_eq!(wal.last_index(), 3);
        }

        let wal = Wal::open(dir.path(), small_config()).unwrap();
        assert_eq!(wal.first_index(), 1);
        assert_eq!(wal.last_index(), 3);
        assert_eq!(wal.read(2).unwrap().payload, Bytes::from("e2"));
    }

    #[test]
    fn test_rolls_segments() {
        let dir = TempDir::new().unwrap();
        let mut wal = Wal::open(dir.path(), small_config()).unwrap();
        append_n(&mut wal, 1, 10);

        // max_entries = 4 forces three segments for ten entries.
        assert_eq!(wal.segment_count(), 3);
        assert_eq!(wal.last_index(), 10);

        drop(wal);
        let wal = Wal::open(dir.path(), small_config()).unwrap();
        assert_eq!(wal.last_index(), 10);
        assert_eq!(wal.entries_from(1).len(), 10);
    }

    #[test]
    fn test_torn_tail_recovered() {
        let dir = TempDir::new().unwrap();
        {
            let mut wal = Wal::open(dir.path(), small_config()).unwrap();
            append_n(&mut wal, 1, 3);
        }

        // Chop bytes off the only segment file to simulate a torn write.
        let path = segment_path(dir.path(), SegmentId::new(1));
        let data = fs::read(&path).unwrap();
        fs::write(&path, &data[..data.len() - 3]).unwrap();

        let mut wal = Wal::open(dir.path(), small_config()).unwrap();
        assert_eq!(wal.last_index(), 2);

        // The log accepts appends at the recovered position.
        wal.append(1, 3, EntryKind::Command, Bytes::from("again"))
            .unwrap();
        wal.sync().unwrap();
        assert_eq!(wal.last_index(), 3);
    }

    #[test]
    fn test_truncate_after() {
        let dir = TempDir::new().unwrap();
        let mut wal = Wal::open(dir.path(), small_config()).unwrap();
        append_n(&mut wal, 1, 10);

        wal.truncate_after(5).unwrap();
        assert_eq!(wal.last_index(), 5);

        // Appends continue at 6 and survive a reopen.
        wal.append(2, 6, EntryKind::Command, Bytes::from("new6"))
            .unwrap();
        wal.sync().unwrap();
        drop(wal);

        let wal = Wal::open(dir.path(), small_config()).unwrap();
        assert_eq!(wal.last_index(), 6);
        assert_eq!(wal.read(6).unwrap().term(), 2);
    }

    #[test]
    fn test_compact_below() {
        let dir = TempDir::new().unwrap();
        let mut wal = Wal::open(dir.path(), small_config()).unwrap();
        append_n(&mut wal, 1, 10);
        assert_eq!(wal.segment_count(), 3);

        // Entries 1..=8 live in the two sealed segments.
        wal.compact_below(9).unwrap();
        assert_eq!(wal.segment_count(), 1);
        assert_eq!(wal.last_index(), 10);
        assert!(wal.read(3).is_err());
        assert!(wal.read(9).is_ok());
    }

    #[test]
    fn test_entry_kinds_survive_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let mut wal = Wal::open(dir.path(), small_config()).unwrap();
            wal.append(1, 1, EntryKind::Control, Bytes::from("ctl"))
                .unwrap();
            wal.append(1, 2, EntryKind::SnapshotMarker, Bytes::new())
                .unwrap();
            wal.sync().unwrap();
        }

        let wal = Wal::open(dir.path(), small_config()).unwrap();
        assert_eq!(wal.read(1).unwrap().kind(), EntryKind::Control);
        assert_eq!(wal.read(2).unwrap().kind(), EntryKind::SnapshotMarker);
    }
}
