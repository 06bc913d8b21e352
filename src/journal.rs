//! Lock journal: the persistent record of which snapshot basenames still
//! have outstanding transfers to which destinations.
//!
//! The journal is a JSON object mapping a snapshot basename to the set of
//! destination keys that still owe it a transfer. A basename with an empty
//! set is pruned from the map entirely, so the map's keyset is exactly "the
//! snapshots that must not be deleted because something still depends on
//! them arriving".

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::backup_error::BackupError;

#[derive(Debug, Default)]
pub struct LockJournal {
    entries: BTreeMap<String, BTreeSet<String>>,
    path: PathBuf,
}

impl LockJournal {
    /// Load the journal at `path`, treating a missing file as an empty
    /// journal (the first run on a fresh source has nothing to load yet).
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, BackupError> {
        let path = path.into();

        let entries = match std::fs::read(&path) {
            Ok(bytes) => {
                serde_json::from_slice(&bytes).map_err(|source| BackupError::CorruptJournal {
                    path: path.clone(),
                    source,
                })?
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => return Err(err.into()),
        };

        Ok(Self { entries, path })
    }

    /// Record that `destination_key` still owes `basename` a transfer.
    pub fn lock(&mut self, basename: &str, destination_key: &str) {
        self.entries
            .entry(basename.to_string())
            .or_default()
            .insert(destination_key.to_string());
    }

    /// Clear the outstanding transfer of `basename` to `destination_key`.
    /// Removes the basename entirely once no destination still owes it.
    pub fn unlock(&mut self, basename: &str, destination_key: &str) {
        if let Some(set) = self.entries.get_mut(basename) {
            set.remove(destination_key);
            if set.is_empty() {
                self.entries.remove(basename);
            }
        }
    }

    /// Whether any destination still owes `basename` a transfer.
    pub fn is_locked(&self, basename: &str) -> bool {
        self.entries.contains_key(basename)
    }

    /// All basenames that currently have at least one outstanding transfer.
    pub fn locked_basenames(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Destinations still owed a transfer of `basename`.
    pub fn outstanding_for(&self, basename: &str) -> impl Iterator<Item = &str> {
        self.entries
            .get(basename)
            .into_iter()
            .flat_map(|set| set.iter().map(String::as_str))
    }

    /// Persist the journal to its path by writing a sibling temp file and
    /// renaming it into place, so a crash mid-write never leaves a
    /// truncated or partially-written journal behind.
    pub fn persist(&self) -> Result<(), BackupError> {
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile_sibling(dir)?;
        let bytes = serde_json::to_vec_pretty(&self.entries).map_err(|source| {
            BackupError::CorruptJournal {
                path: self.path.clone(),
                source,
            }
        })?;
        tmp.write_all(&bytes)?;
        tmp.persist(&self.path)?;
        Ok(())
    }
}

/// A temp file created next to `dir` that can be atomically renamed into
/// place once fully written.
struct SiblingTempFile {
    file: File,
    path: PathBuf,
}

impl SiblingTempFile {
    fn persist(self, dest: &Path) -> std::io::Result<()> {
        self.file.sync_all()?;
        drop(self.file);
        std::fs::rename(&self.path, dest)
    }
}

impl Write for SiblingTempFile {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.file.flush()
    }
}

fn tempfile_sibling(dir: &Path) -> std::io::Result<SiblingTempFile> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(format!(".outstanding_transfers.{}.tmp", std::process::id()));
    let file = File::create(&path)?;
    Ok(SiblingTempFile { file, path })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_then_unlock_removes_empty_entry() {
        let mut journal = LockJournal::load(tempfile::tempdir().unwrap().path().join("j.json")).unwrap();

        journal.lock("20240115-120000", "local:/backups/a");
        journal.lock("20240115-120000", "ssh:host/backups/b");
        assert!(journal.is_locked("20240115-120000"));
        assert_eq!(journal.outstanding_for("20240115-120000").count(), 2);

        journal.unlock("20240115-120000", "local:/backups/a");
        assert!(journal.is_locked("20240115-120000"));

        journal.unlock("20240115-120000", "ssh:host/backups/b");
        assert!(!journal.is_locked("20240115-120000"));
        assert_eq!(journal.locked_basenames().count(), 0);
    }

    #[test]
    fn missing_journal_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let journal = LockJournal::load(dir.path().join("does-not-exist.json")).unwrap();
        assert_eq!(journal.locked_basenames().count(), 0);
    }

    #[test]
    fn persist_then_reload_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".outstanding_transfers");

        let mut journal = LockJournal::load(&path).unwrap();
        journal.lock("20240115-120000", "local:/backups/a");
        journal.persist().unwrap();

        let reloaded = LockJournal::load(&path).unwrap();
        assert!(reloaded.is_locked("20240115-120000"));
        assert_eq!(
            reloaded.outstanding_for("20240115-120000").collect::<Vec<_>>(),
            vec!["local:/backups/a"]
        );
    }

    #[test]
    fn corrupt_journal_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".outstanding_transfers");
        std::fs::write(&path, b"not json").unwrap();

        let err = LockJournal::load(&path).unwrap_err();
        assert!(matches!(err, BackupError::CorruptJournal { .. }));
    }
}
