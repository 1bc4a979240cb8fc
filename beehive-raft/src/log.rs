//! In-memory consensus log with snapshot-aware compaction.

use bytes::Bytes;
use beehive_core::{LogIndex, TermId};

/// A single entry in a group's log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// The term when this entry was created.
    pub term: TermId,
    /// The log index of this entry.
    pub index: LogIndex,
    /// The command payload, opaque to consensus.
    pub data: Bytes,
}

impl LogEntry {
    /// Creates a new log entry.
    #[must_use]
    pub const fn new(term: TermId, index: LogIndex, data: Bytes) -> Self {
        Self { term, index, data }
    }
}

/// The in-memory log of one consensus group.
///
/// Indices start at 1. Entries below `compacted_index` have been folded into
/// a snapshot and are gone; `term_at(compacted_index)` still answers from the
/// retained snapshot term so consistency checks keep working at the boundary.
#[derive(Debug, Default)]
pub struct RaftLog {
    /// Live entries, `entries[0].index == compacted_index + 1` when non-empty.
    entries: Vec<LogEntry>,
    /// Index of the last entry folded into a snapshot (0 if none).
    compacted_index: u64,
    /// Term of the entry at `compacted_index`.
    compacted_term: TermId,
}

impl RaftLog {
    /// Creates a new empty log.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
            compacted_index: 0,
            compacted_term: TermId::new(0),
        }
    }

    /// Returns true if the log holds no live entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the number of live entries.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.entries.len() as u64
    }

    /// Returns the last log index, counting compacted entries.
    #[must_use]
    pub fn last_index(&self) -> LogIndex {
        LogIndex::new(self.compacted_index + self.entries.len() as u64)
    }

    /// Returns the term of the last entry (or of the snapshot boundary).
    #[must_use]
    pub fn last_term(&self) -> TermId {
        self.entries.last().map_or(self.compacted_term, |e| e.term)
    }

    /// Gets a live entry by index. Compacted indices return `None`.
    #[must_use]
    pub fn get(&self, index: LogIndex) -> Option<&LogEntry> {
        let idx = index.get();
        if idx <= self.compacted_index || idx > self.last_index().get() {
            return None;
        }
        let offset = usize::try_from(idx - self.compacted_index - 1).ok()?;
        self.entries.get(offset)
    }

    /// Returns the term at an index: live entry, snapshot boundary, or 0.
    #[must_use]
    pub fn term_at(&self, index: LogIndex) -> TermId {
        if index.get() == self.compacted_index {
            return self.compacted_term;
        }
        self.get(index).map_or(TermId::new(0), |e| e.term)
    }

    /// Returns true if a candidate log described by `(last_term, last_index)`
    /// is at least as up to date as this one.
    #[must_use]
    pub fn is_up_to_date(&self, last_term: TermId, last_index: LogIndex) -> bool {
        (last_term, last_index) >= (self.last_term(), self.last_index())
    }

    /// Appends one entry.
    ///
    /// # Panics
    /// Panics if the entry index is not the immediate successor of the
    /// current last index.
    pub fn append(&mut self, entry: LogEntry) {
        let expected = self.last_index().get() + 1;
        assert_eq!(
            entry.index.get(),
            expected,
            "log entry index must be sequential: expected {expected}, got {}",
            entry.index.get()
        );
        self.entries.push(entry);
    }

    /// Appends replicated entries, truncating on term conflict.
    pub fn append_entries(&mut self, entries: Vec<LogEntry>) {
        for entry in entries {
            if let Some(existing) = self.get(entry.index) {
                if existing.term != entry.term {
                    self.truncate_after(LogIndex::new(entry.index.get() - 1));
                }
            }
            if entry.index.get() > self.last_index().get() {
                self.append(entry);
            }
        }
    }

    /// Truncates the log after `last_to_keep` (inclusive).
    pub fn truncate_after(&mut self, last_to_keep: LogIndex) {
        let keep = last_to_keep.get().saturating_sub(self.compacted_index);
        let keep = usize::try_from(keep).unwrap_or(usize::MAX);
        if keep < self.entries.len() {
            self.entries.truncate(keep);
        }
    }

    /// Returns entries from `start_index` through the end, bounded by `max`.
    #[must_use]
    pub fn entries_from(&self, start_index: LogIndex, max: usize) -> Vec<LogEntry> {
        let start = start_index.get().max(self.compacted_index + 1);
        let mut out = Vec::new();
        for idx in start..=self.last_index().get() {
            if out.len() >= max {
                break;
            }
            if let Some(entry) = self.get(LogIndex::new(idx)) {
                out.push(entry.clone());
            }
        }
        out
    }

    /// Drops entries at or below `through`, recording the boundary term.
    ///
    /// Called after a snapshot covers those entries.
    pub fn compact(&mut self, through: LogIndex, boundary_term: TermId) {
        if through.get() <= self.compacted_index {
            return;
        }
        let drop = through.get().min(self.last_index().get()) - self.compacted_index;
        let drop = usize::try_from(drop).unwrap_or(self.entries.len());
        self.entries.drain(..drop);
        self.compacted_index = through.get();
        self.compacted_term = boundary_term;
    }

    /// Resets the log below a freshly installed snapshot.
    pub fn reset_to_snapshot(&mut self, index: LogIndex, term: TermId) {
        self.entries.clear();
        self.compacted_index = index.get();
        self.compacted_term = term;
    }

    /// Returns the index of the last compacted entry (0 if none).
    #[must_use]
    pub const fn compacted_index(&self) -> u64 {
        self.compacted_index
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(term: u64, index: u64) -> LogEntry {
        LogEntry::new(TermId::new(term), LogIndex::new(index), Bytes::from("x"))
    }

    #[test]
    fn test_append_sequential() {
        let mut log = RaftLog::new();
        log.append(entry(1, 1));
        log.append(entry(1, 2));

        assert_eq!(log.last_index(), LogIndex::new(2));
        assert_eq!(log.last_term(), TermId::new(1));
        assert_eq!(log.len(), 2);
    }

    #[test]
    #[should_panic(expected = "must be sequential")]
    fn test_append_gap_panics() {
        let mut log = RaftLog::new();
        log.append(entry(1, 2));
    }

    #[test]
    fn test_conflict_truncation() {
        let mut log = RaftLog::new();
        log.append(entry(1, 1));
        log.append(entry(1, 2));
        log.append(entry(1, 3));

        // Entry 2 arrives again with a newer term: 2 and 3 are replaced.
        log.append_entries(vec![entry(2, 2), entry(2, 3)]);

        assert_eq!(log.last_index(), LogIndex::new(3));
        assert_eq!(log.term_at(LogIndex::new(2)), TermId::new(2));
        assert_eq!(log.term_at(LogIndex::new(1)), TermId::new(1));
    }

    #[test]
    fn test_compaction_preserves_boundary_term() {
        let mut log = RaftLog::new();
        for i in 1..=5 {
            log.append(entry(1, i));
        }

        log.compact(LogIndex::new(3), TermId::new(1));

        assert_eq!(log.len(), 2);
        assert_eq!(log.last_index(), LogIndex::new(5));
        assert!(log.get(LogIndex::new(3)).is_none());
        assert_eq!(log.term_at(LogIndex::new(3)), TermId::new(1));
        assert_eq!(log.term_at(LogIndex::new(4)), TermId::new(1));

        // Appends continue from the true last index.
        log.append(entry(2, 6));
        assert_eq!(log.last_index(), LogIndex::new(6));
    }

    #[test]
    fn test_reset_to_snapshot() {
        let mut log = RaftLog::new();
        for i in 1..=3 {
            log.append(entry(1, i));
        }

        log.reset_to_snapshot(LogIndex::new(10), TermId::new(4));

        assert!(log.is_empty());
        assert_eq!(log.last_index(), LogIndex::new(10));
        assert_eq!(log.last_term(), TermId::new(4));

        log.append(entry(5, 11));
        assert_eq!(log.last_index(), LogIndex::new(11));
    }

    #[test]
    fn test_entries_from_bounded() {
        let mut log = RaftLog::new();
        for i in 1..=10 {
            log.append(entry(1, i));
        }

        let entries = log.entries_from(LogIndex::new(4), 3);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].index, LogIndex::new(4));
        assert_eq!(entries[2].index, LogIndex::new(6));
    }

    #[test]
    fn test_up_to_date_comparison() {
        let mut log = RaftLog::new();
        log.append(entry(2, 1));

        assert!(log.is_up_to_date(TermId::new(2), LogIndex::new(1)));
        assert!(log.is_up_to_date(TermId::new(3), LogIndex::new(0)));
        assert!(!log.is_up_to_date(TermId::new(1), LogIndex::new(5)));
    }
}
