//! Versioned dictionaries.
//!
//! Cell versions are monotone for the life of the bee, surviving deletes,
//! so a reader that observed any historical version is invalidated by any
//! later write or delete. An absent, never-written cell reads as version 0
//! with no value; absence is indistinguishable from empty.

use std::collections::BTreeMap;

use bytes::Bytes;
use beehive_core::Cell;

/// The dictionaries of one bee.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Dictionaries {
    /// Live values.
    values: BTreeMap<Cell, Bytes>,
    /// Monotone per-cell versions, kept across deletes.
    versions: BTreeMap<Cell, u64>,
}

impl Dictionaries {
    /// Creates empty dictionaries.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads a cell's value and version. Absent cells read as
    /// `(None, 0)` unless they were written before.
    #[must_use]
    pub fn get(&self, cell: &Cell) -> (Option<&Bytes>, u64) {
        (self.values.get(cell), self.version(cell))
    }

    /// Returns the current version of a cell (0 if never written).
    #[must_use]
    pub fn version(&self, cell: &Cell) -> u64 {
        self.versions.get(cell).copied().unwrap_or(0)
    }

    /// Returns true if the cell currently holds a value.
    #[must_use]
    pub fn contains(&self, cell: &Cell) -> bool {
        self.values.contains_key(cell)
    }

    /// Writes a value, bumping the cell version. The first committed write
    /// creates the cell.
    pub fn put(&mut self, cell: Cell, value: Bytes) {
        *self.versions.entry(cell.clone()).or_insert(0) += 1;
        self.values.insert(cell, value);
    }

    /// Deletes a value, bumping the cell version. Commit of a delete
    /// destroys the cell.
    pub fn del(&mut self, cell: &Cell) {
        *self.versions.entry(cell.clone()).or_insert(0) += 1;
        self.values.remove(cell);
    }

    /// Installs a cell at an explicit version (arriving from a transfer).
    pub fn install(&mut self, cell: Cell, value: Option<Bytes>, version: u64) {
        self.versions.insert(cell.clone(), version);
        match value {
            Some(v) => {
                self.values.insert(cell, v);
            }
            None => {
                self.values.remove(&cell);
            }
        }
    }

    /// Removes a cell entirely (transferred away), forgetting its version.
    pub fn evict(&mut self, cell: &Cell) -> (Option<Bytes>, u64) {
        let version = self.versions.remove(cell).unwrap_or(0);
        (self.values.remove(cell), version)
    }

    /// Returns the number of cells that hold a value.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true if no cell holds a value.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Iterates live `(cell, value, version)` triples in cell order.
    pub fn iter(&self) -> impl Iterator<Item = (&Cell, &Bytes, u64)> {
        self.values
            .iter()
            .map(|(cell, value)| (cell, value, self.version(cell)))
    }

    /// Iterates all versioned cells, including deleted ones (no value).
    pub fn iter_versions(&self) -> impl Iterator<Item = (&Cell, u64)> {
        self.versions.iter().map(|(cell, v)| (cell, *v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cell(key: &str) -> Cell {
        Cell::new("d", key.as_bytes().to_vec())
    }

    #[test]
    fn test_absent_reads_as_version_zero() {
        let dicts = Dictionaries::new();
        let (value, version) = dicts.get(&cell("x"));
        assert!(value.is_none());
        assert_eq!(version, 0);
    }

    #[test]
    fn test_put_bumps_version() {
        let mut dicts = Dictionaries::new();
        dicts.put(cell("x"), Bytes::from("1"));
        assert_eq!(dicts.version(&cell("x")), 1);

        dicts.put(cell("x"), Bytes::from("2"));
        assert_eq!(dicts.version(&cell("x")), 2);
        assert_eq!(dicts.get(&cell("x")).0, Some(&Bytes::from("2")));
    }

    #[test]
    fn test_delete_keeps_version_monotone() {
        let mut dicts = Dictionaries::new();
        dicts.put(cell("x"), Bytes::from("1"));
        dicts.del(&cell("x"));

        // Deleted reads as empty, but the version keeps counting so stale
        // readers are invalidated.
        let (value, version) = dicts.get(&cell("x"));
        assert!(value.is_none());
        assert_eq!(version, 2);

        dicts.put(cell("x"), Bytes::from("3"));
        assert_eq!(dicts.version(&cell("x")), 3);
    }

    #[test]
    fn test_install_and_evict() {
        let mut dicts = Dictionaries::new();
        dicts.install(cell("moved"), Some(Bytes::from("v")), 7);
        assert_eq!(dicts.get(&cell("moved")), (Some(&Bytes::from("v")), 7));

        let (value, version) = dicts.evict(&cell("moved"));
        assert_eq!(value, Some(Bytes::from("v")));
        assert_eq!(version, 7);
        assert_eq!(dicts.version(&cell("moved")), 0);
    }
}
