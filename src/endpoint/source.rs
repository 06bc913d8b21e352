//! The source endpoint: the btrfs subvolume being backed up and the
//! snapshot directory it is snapshotted into.
//!
//! Generalized from `commands::delete_subvolume`/`snapshot_subvolume`'s
//! RFC3339 timestamps to the `[PREFIX]YYYYMMDD-HHMMSS` basename format, and
//! from an implicit `Utc::now()` call inside the command to an explicit
//! `new_basename` parameter the coordinator computes once per run.

use std::cell::RefCell;
use std::path::{Path, PathBuf};

use exec_rs::{CommandExec, Context, Exec};

use crate::backup_error::BackupError;
use crate::pipeline::{PipelineStage, StageContext};

const RESTRICTED_SUBVOLUMES: &[&str] = &["home", "/home", "root", "/"];

pub struct SourceEndpoint {
    subvolume_path: PathBuf,
    snapshot_folder: PathBuf,
    prefix: String,
    user: String,
    exec: RefCell<Box<dyn Exec>>,
}

impl SourceEndpoint {
    pub fn new(
        subvolume_path: impl Into<PathBuf>,
        snapshot_folder: impl Into<PathBuf>,
        prefix: impl Into<String>,
    ) -> Self {
        Self {
            subvolume_path: subvolume_path.into(),
            snapshot_folder: snapshot_folder.into(),
            prefix: prefix.into(),
            user: crate::exec::current_user(),
            exec: RefCell::new(Box::new(CommandExec {})),
        }
    }

    #[cfg(test)]
    fn with_exec(
        subvolume_path: impl Into<PathBuf>,
        snapshot_folder: impl Into<PathBuf>,
        prefix: impl Into<String>,
        exec: Box<dyn Exec>,
    ) -> Self {
        Self {
            subvolume_path: subvolume_path.into(),
            snapshot_folder: snapshot_folder.into(),
            prefix: prefix.into(),
            user: "test".to_string(),
            exec: RefCell::new(exec),
        }
    }

    pub fn snapshot_folder(&self) -> &Path {
        &self.snapshot_folder
    }

    pub fn journal_path(&self) -> PathBuf {
        self.snapshot_folder.join(".outstanding_transfers")
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Enumerate basenames present in the snapshot folder, filtered by the
    /// active prefix. Fails with `EndpointUnavailable` on I/O error.
    pub fn list(&self) -> Result<std::collections::BTreeSet<String>, BackupError> {
        let entries = std::fs::read_dir(&self.snapshot_folder).map_err(|err| {
            BackupError::EndpointUnavailable(
                self.snapshot_folder.display().to_string(),
                err.to_string(),
            )
        })?;

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| {
                BackupError::EndpointUnavailable(
                    self.snapshot_folder.display().to_string(),
                    err.to_string(),
                )
            })?;
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }

        Ok(crate::catalog::filter_basenames(names, &self.prefix))
    }

    /// Create a read-only snapshot named `new_basename` in the snapshot
    /// folder. Fails with `SnapshotExists` if the path is already taken.
    pub fn snapshot(&self, new_basename: &str) -> Result<String, BackupError> {
        let snapshot_path = self.snapshot_folder.join(new_basename);

        if snapshot_path.exists() {
            return Err(BackupError::SnapshotExists(new_basename.to_string()));
        }

        let snapshot_path = snapshot_path
            .to_str()
            .ok_or_else(|| BackupError::SnapshotCreation("non-UTF-8 snapshot path".to_string()))?
            .to_string();
        let subvolume_path = self
            .subvolume_path
            .to_str()
            .ok_or_else(|| BackupError::SnapshotCreation("non-UTF-8 subvolume path".to_string()))?;

        let context = Context::Local {
            user: self.user.clone(),
        };

        self.exec
            .borrow_mut()
            .exec(
                "sudo",
                &[
                    "btrfs",
                    "subvolume",
                    "snapshot",
                    "-r",
                    subvolume_path,
                    &snapshot_path,
                ],
                Some(&context),
            )
            .map_err(|err| BackupError::SnapshotCreation(err.to_string()))?;

        Ok(new_basename.to_string())
    }

    /// Delete `basename` from the snapshot folder. Refuses to operate on
    /// any of the restricted subvolume names, mirroring the guard
    /// `delete_subvolume` applies.
    pub fn delete(&self, basename: &str) -> Result<(), BackupError> {
        let path = self.snapshot_folder.join(basename);
        let path_str = path
            .to_str()
            .ok_or_else(|| BackupError::DeleteSubvolume("non-UTF-8 snapshot path".to_string()))?;

        if RESTRICTED_SUBVOLUMES.contains(&path_str) {
            return Err(BackupError::RestrictedSubvolume(path_str.to_string()));
        }

        if !path.exists() {
            return Ok(());
        }

        let context = Context::Local {
            user: self.user.clone(),
        };

        self.exec
            .borrow_mut()
            .exec(
                "sudo",
                &["btrfs", "subvolume", "delete", path_str],
                Some(&context),
            )
            .map_err(|err| BackupError::DeleteSubvolume(err.to_string()))?;

        Ok(())
    }

    /// The pipeline stage that reads `basename` (optionally incremental off
    /// `parent`) off disk and writes a `btrfs send` stream to its stdout.
    pub fn send_stage(&self, basename: &str, parent: Option<&str>) -> PipelineStage {
        let snapshot = self.snapshot_folder.join(basename);
        let command = match parent {
            Some(parent) => {
                let parent_path = self.snapshot_folder.join(parent);
                format!(
                    "sudo btrfs send -p {} {}",
                    shell_quote(&parent_path.display().to_string()),
                    shell_quote(&snapshot.display().to_string())
                )
            }
            None => format!(
                "sudo btrfs send {}",
                shell_quote(&snapshot.display().to_string())
            ),
        };

        PipelineStage::new(
            command,
            StageContext::Local {
                user: self.user.clone(),
            },
        )
    }
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use exec_rs::MockExec;

    #[test]
    fn snapshot_creates_new_basename() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("snapshots")).unwrap();

        let mut mock = MockExec::new();
        mock.expect_exec()
            .once()
            .returning(|_, _, _| Ok(String::new()));

        let source = SourceEndpoint::with_exec(
            dir.path().join("subvol"),
            dir.path().join("snapshots"),
            "",
            Box::new(mock),
        );

        assert_eq!(
            source.snapshot("20240115-120000").unwrap(),
            "20240115-120000"
        );
    }

    #[test]
    fn snapshot_collision_is_snapshot_exists() {
        let dir = tempfile::tempdir().unwrap();
        let snapshots = dir.path().join("snapshots");
        std::fs::create_dir(&snapshots).unwrap();
        std::fs::create_dir(snapshots.join("20240115-120000")).unwrap();

        let mock = MockExec::new();
        let source =
            SourceEndpoint::with_exec(dir.path().join("subvol"), snapshots, "", Box::new(mock));

        let err = source.snapshot("20240115-120000").unwrap_err();
        assert!(matches!(err, BackupError::SnapshotExists(_)));
    }

    #[test]
    fn delete_refuses_restricted_names() {
        let dir = tempfile::tempdir().unwrap();
        let mock = MockExec::new();
        let source = SourceEndpoint::with_exec(dir.path().join("subvol"), "/", "", Box::new(mock));

        let err = source.delete("home").unwrap_err();
        assert!(matches!(err, BackupError::RestrictedSubvolume(_)));
    }

    #[test]
    fn list_filters_by_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let snapshots = dir.path().join("snapshots");
        std::fs::create_dir(&snapshots).unwrap();
        std::fs::create_dir(snapshots.join("20240115-120000")).unwrap();
        std::fs::create_dir(snapshots.join("other_20240115-120100")).unwrap();
        std::fs::write(snapshots.join(".outstanding_transfers"), "{}").unwrap();

        let mock = MockExec::new();
        let source =
            SourceEndpoint::with_exec(dir.path().join("subvol"), snapshots, "", Box::new(mock));

        let listed = source.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert!(listed.contains("20240115-120000"));
    }
}
