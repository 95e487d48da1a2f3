//! A directory of numbered history files with retention.
//!
//! Each save lands in a fresh `history-NNNNNNNNNNNNNNNNNNNN.rwh` file with
//! a monotonically increasing id; recovery scans the directory for the
//! highest parseable id. Retention keeps the newest `max_retained` files.

use std::fs;
use std::path::{Path, PathBuf};

use rewind_core::{HistorySettings, StateHistory};

use crate::history_file::{HistoryFile, StorageError};

const FILE_PREFIX: &str = "history-";
const FILE_SUFFIX: &str = ".rwh";

/// Manages numbered history files in one directory.
pub struct HistoryArchive {
    dir: PathBuf,
    next_id: u64,
}

impl HistoryArchive {
    /// Open (creating if needed) an archive directory, resuming the id
    /// sequence after the highest existing file.
    ///
    /// # Errors
    ///
    /// Any filesystem error while creating or scanning the directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let next_id = Self::highest_id(&dir)?.map_or(0, |id| id + 1);
        Ok(Self { dir, next_id })
    }

    /// The directory this archive lives in.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Save `history` under the next id. Returns the id and the file path.
    ///
    /// # Errors
    ///
    /// Any error from [`HistoryFile::save`]; the id is not consumed on
    /// failure.
    pub fn save_next(&mut self, history: &StateHistory) -> Result<(u64, PathBuf), StorageError> {
        let id = self.next_id;
        let path = self.file_path(id);
        HistoryFile::save(&path, history)?;
        self.next_id = id + 1;
        tracing::debug!(id, path = %path.display(), "archived history");
        Ok((id, path))
    }

    /// Find the newest archived history, if any.
    ///
    /// # Errors
    ///
    /// Any filesystem error while scanning the directory.
    pub fn find_latest(&self) -> Result<Option<(u64, PathBuf)>, StorageError> {
        Ok(Self::highest_id(&self.dir)?.map(|id| (id, self.file_path(id))))
    }

    /// Load the newest archived history, if any.
    ///
    /// # Errors
    ///
    /// Any error from [`HistoryFile::load`] on the newest file.
    pub fn load_latest<F>(
        &self,
        settings: HistorySettings,
        is_stale: F,
    ) -> Result<Option<StateHistory>, StorageError>
    where
        F: FnMut(u64) -> bool,
    {
        match self.find_latest()? {
            Some((_, path)) => Ok(Some(HistoryFile::load(&path, settings, is_stale)?)),
            None => Ok(None),
        }
    }

    /// Delete the oldest files beyond `max_retained`, newest kept.
    /// Returns how many files were removed.
    ///
    /// # Errors
    ///
    /// Any filesystem error while scanning or deleting.
    pub fn prune(&self, max_retained: usize) -> Result<usize, StorageError> {
        let mut ids = Self::scan_ids(&self.dir)?;
        ids.sort_unstable();
        if ids.len() <= max_retained {
            return Ok(0);
        }
        let to_remove = ids.len() - max_retained;
        for &id in ids.iter().take(to_remove) {
            fs::remove_file(self.file_path(id))?;
        }
        Ok(to_remove)
    }

    fn file_path(&self, id: u64) -> PathBuf {
        self.dir.join(format!("{FILE_PREFIX}{id:020}{FILE_SUFFIX}"))
    }

    fn parse_id(name: &str) -> Option<u64> {
        name.strip_prefix(FILE_PREFIX)?
            .strip_suffix(FILE_SUFFIX)?
            .parse()
            .ok()
    }

    fn scan_ids(dir: &Path) -> Result<Vec<u64>, StorageError> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if !entry.path().is_file() {
                continue;
            }
            let name = entry.file_name();
            if let Some(id) = name.to_str().and_then(Self::parse_id) {
                ids.push(id);
            }
        }
        Ok(ids)
    }

    fn highest_id(dir: &Path) -> Result<Option<u64>, StorageError> {
        Ok(Self::scan_ids(dir)?.into_iter().max())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn small_settings() -> HistorySettings {
        HistorySettings {
            current_buffer_mb: 1,
            current_target_frame_length: 100,
            recent_buffer_mb: 1,
            recent_target_frame_length: 1000,
            ancient_buffer_mb: 1,
            ancient_state_interval: 500,
            use_compression: false,
        }
    }

    fn history() -> StateHistory {
        let mut history = StateHistory::new(small_settings()).unwrap();
        history.engage(vec![0u8; 32]).unwrap();
        history
    }

    #[test]
    fn ids_increase_and_latest_wins() {
        let dir = TempDir::new().unwrap();
        let mut archive = HistoryArchive::open(dir.path()).unwrap();
        assert!(archive.find_latest().unwrap().is_none());

        let (id0, _) = archive.save_next(&history()).unwrap();
        let (id1, _) = archive.save_next(&history()).unwrap();
        assert_eq!((id0, id1), (0, 1));

        let (latest, path) = archive.find_latest().unwrap().unwrap();
        assert_eq!(latest, 1);
        assert!(path.ends_with("history-00000000000000000001.rwh"));
    }

    #[test]
    fn reopen_resumes_id_sequence() {
        let dir = TempDir::new().unwrap();
        {
            let mut archive = HistoryArchive::open(dir.path()).unwrap();
            archive.save_next(&history()).unwrap();
            archive.save_next(&history()).unwrap();
        }
        let mut archive = HistoryArchive::open(dir.path()).unwrap();
        let (id, _) = archive.save_next(&history()).unwrap();
        assert_eq!(id, 2);
    }

    #[test]
    fn load_latest_round_trips() {
        let dir = TempDir::new().unwrap();
        let mut archive = HistoryArchive::open(dir.path()).unwrap();
        assert!(archive
            .load_latest(small_settings(), |_| false)
            .unwrap()
            .is_none());

        archive.save_next(&history()).unwrap();
        let restored = archive
            .load_latest(small_settings(), |_| false)
            .unwrap()
            .unwrap();
        assert!(restored.is_engaged());
    }

    #[test]
    fn prune_keeps_the_newest() {
        let dir = TempDir::new().unwrap();
        let mut archive = HistoryArchive::open(dir.path()).unwrap();
        for _ in 0..5 {
            archive.save_next(&history()).unwrap();
        }
        let removed = archive.prune(2).unwrap();
        assert_eq!(removed, 3);

        let mut remaining = HistoryArchive::scan_ids(dir.path()).unwrap();
        remaining.sort_unstable();
        assert_eq!(remaining, vec![3, 4]);
        // Pruning again is a no-op.
        assert_eq!(archive.prune(2).unwrap(), 0);
    }

    #[test]
    fn unrelated_files_are_ignored() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("notes.txt"), b"hi").unwrap();
        fs::write(dir.path().join("history-abc.rwh"), b"junk").unwrap();
        let archive = HistoryArchive::open(dir.path()).unwrap();
        assert!(archive.find_latest().unwrap().is_none());
    }
}
