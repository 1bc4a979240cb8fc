//! Snapshot files.
//!
//! Snapshots live next to the segment files as `snap-<index>.snap`, written
//! to a temporary name and renamed so a crash never leaves a half snapshot
//! under the final name. Loading prefers the newest snapshot and falls back
//! to older ones on corruption.

use std::fs;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tracing::{info, warn};

use crate::error::{WalError, WalResult};

/// Extension for snapshot files.
const SNAPSHOT_EXT: &str = "snap";

/// Store managing the snapshot files of one group directory.
#[derive(Debug)]
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    /// Opens (or creates) the store in `dir`.
    ///
    /// # Errors
    /// Returns an error if the directory cannot be created.
    pub fn open(dir: impl Into<PathBuf>) -> WalResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| WalError::io(&dir, e))?;
        Ok(Self { dir })
    }

    /// Saves encoded snapshot bytes covering the log through `last_index`.
    ///
    /// Older snapshot files are removed once the new one is durable.
    ///
    /// # Errors
    /// Returns an error on filesystem failure.
    pub fn save(&self, last_index: u64, encoded: &[u8]) -> WalResult<()> {
        let final_path = self.snapshot_path(last_index);
        let tmp_path = final_path.with_extension("tmp");

        fs::write(&tmp_path, encoded).map_err(|e| WalError::io(&tmp_path, e))?;
        fs::rename(&tmp_path, &final_path).map_err(|e| WalError::io(&final_path, e))?;

        // Best effort: drop superseded snapshots.
        for (index, path) in self.list()? {
            if index < last_index {
                if let Err(e) = fs::remove_file(&path) {
                    warn!(path = %path.display(), error = %e, "failed to remove old snapshot");
                }
            }
        }

        info!(last_index, "snapshot saved");
        Ok(())
    }

    /// Loads the newest readable snapshot, if any.
    ///
    /// A snapshot that fails to read is skipped in favor of the next older
    /// one; validation of the content is the caller's (it knows the codec).
    ///
    /// # Errors
    /// Returns an error on filesystem failure while listing.
    pub fn load_latest(&self) -> WalResult<Option<(u64, Bytes)>> {
        let mut snapshots = self.list()?;
        snapshots.sort_by_key(|(index, _)| std::cmp::Reverse(*index));

        for (index, path) in snapshots {
            match fs::read(&path) {
                Ok(data) => return Ok(Some((index, Bytes::from(data)))),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable snapshot");
                }
            }
        }
        Ok(None)
    }

    fn snapshot_path(&self, last_index: u64) -> PathBuf {
        self.dir.join(format!("snap-{last_index:016x}.{SNAPSHOT_EXT}"))
    }

    fn list(&self) -> WalResult<Vec<(u64, PathBuf)>> {
        let mut out = Vec::new();
        let entries = fs::read_dir(&self.dir).map_err(|e| WalError::io(&self.dir, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| WalError::io(&self.dir, e))?;
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if let Some(index) = parse_snapshot_name(name) {
                out.push((index, path));
            }
        }
        Ok(out)
    }
}

fn parse_snapshot_name(name: &str) -> Option<u64> {
    let stem = name
        .strip_prefix("snap-")?
        .strip_suffix(&format!(".{SNAPSHOT_EXT}"))?;
    u64::from_str_radix(stem, 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_save_and_load_latest() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::open(dir.path()).unwrap();

        assert!(store.load_latest().unwrap().is_none());

        store.save(10, b"state-at-10").unwrap();
        store.save(20, b"state-at-20").unwrap();

        let (index, data) = store.load_latest().unwrap().unwrap();
        assert_eq!(index, 20);
        assert_eq!(&data[..], b"state-at-20");
    }

    #[test]
    fn test_old_snapshots_removed() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::open(dir.path()).unwrap();

        store.save(10, b"old").unwrap();
        store.save(20, b"new").unwrap();

        let files: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.path().extension().is_some_and(|x| x == SNAPSHOT_EXT))
            .collect();
        assert_eq!(files.len(), 1);
    }

    #[test]
    fn test_no_tmp_left_behind() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::open(dir.path()).unwrap();
        store.save(5, b"x").unwrap();

        let tmp_files: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.path().extension().is_some_and(|x| x == "tmp"))
            .collect();
        assert!(tmp_files.is_empty());
    }
}
