//! A destination directory on another local btrfs filesystem.
//!
//! The delete guard and path handling follow `commands::delete_subvolume`,
//! generalized to operate against an arbitrary destination directory
//! instead of always the source subvolume.

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::path::PathBuf;

use exec_rs::{CommandExec, Context, Exec};

use crate::backup_error::BackupError;
use crate::catalog;
use crate::pipeline::{PipelineStage, StageContext};

const RESTRICTED_SUBVOLUMES: &[&str] = &["home", "/home", "root", "/"];

pub struct LocalEndpoint {
    path: PathBuf,
    prefix: String,
    user: String,
    create_if_missing: bool,
    exec: RefCell<Box<dyn Exec>>,
}

impl LocalEndpoint {
    pub fn new(path: impl Into<PathBuf>, prefix: impl Into<String>, create_if_missing: bool) -> Self {
        Self {
            path: path.into(),
            prefix: prefix.into(),
            user: crate::exec::current_user(),
            create_if_missing,
            exec: RefCell::new(Box::new(CommandExec {})),
        }
    }

    #[cfg(test)]
    fn with_exec(
        path: impl Into<PathBuf>,
        prefix: impl Into<String>,
        create_if_missing: bool,
        exec: Box<dyn Exec>,
    ) -> Self {
        Self {
            path: path.into(),
            prefix: prefix.into(),
            user: "test".to_string(),
            create_if_missing,
            exec: RefCell::new(exec),
        }
    }

    pub fn key(&self) -> String {
        self.path.display().to_string()
    }

    fn ensure_directory(&self) -> Result<(), BackupError> {
        if self.path.exists() {
            return Ok(());
        }

        if !self.create_if_missing {
            return Err(BackupError::EndpointUnavailable(
                self.key(),
                "destination directory does not exist (pass --create-dest-dir to create it)"
                    .to_string(),
            ));
        }

        std::fs::create_dir_all(&self.path)?;
        Ok(())
    }

    pub fn list(&self) -> Result<BTreeSet<String>, BackupError> {
        self.ensure_directory()?;

        let entries = std::fs::read_dir(&self.path)
            .map_err(|err| BackupError::EndpointUnavailable(self.key(), err.to_string()))?;

        let mut names = Vec::new();
        for entry in entries {
            let entry =
                entry.map_err(|err| BackupError::EndpointUnavailable(self.key(), err.to_string()))?;
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }

        Ok(catalog::filter_basenames(names, &self.prefix))
    }

    pub fn delete(&self, basename: &str) -> Result<(), BackupError> {
        let subvolume = self.path.join(basename);
        let subvolume_str = subvolume
            .to_str()
            .ok_or_else(|| BackupError::DeleteSubvolume("non-UTF-8 snapshot path".to_string()))?;

        if RESTRICTED_SUBVOLUMES.contains(&subvolume_str) {
            return Err(BackupError::RestrictedSubvolume(subvolume_str.to_string()));
        }

        if !subvolume.exists() {
            return Ok(());
        }

        let context = Context::Local {
            user: self.user.clone(),
        };

        self.exec
            .borrow_mut()
            .exec(
                "sudo",
                &["btrfs", "subvolume", "delete", subvolume_str],
                Some(&context),
            )
            .map_err(|err| BackupError::DeleteSubvolume(err.to_string()))?;

        Ok(())
    }

    /// btrfs receive determines the new subvolume's name from the send
    /// stream itself, so `basename` only needs to select the target
    /// directory, not form part of the command line.
    pub fn receive_stage(&self, _basename: &str, _parent: Option<&str>) -> PipelineStage {
        let command = format!(
            "sudo btrfs receive {}",
            shell_quote(&self.path.display().to_string())
        );
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

impl super::Endpoint for LocalEndpoint {
    fn key(&self) -> String {
        self.key()
    }

    fn receive_stage(&self, basename: &str, parent: Option<&str>) -> PipelineStage {
        self.receive_stage(basename, parent)
    }

    fn delete(&self, basename: &str) -> Result<(), BackupError> {
        self.delete(basename)
    }
}

impl super::ReadableEndpoint for LocalEndpoint {
    fn list(&self) -> Result<BTreeSet<String>, BackupError> {
        self.list()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use exec_rs::MockExec;

    #[test]
    fn list_filters_by_prefix() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("20240115-120000")).unwrap();
        std::fs::create_dir(dir.path().join("unrelated")).unwrap();

        let endpoint = LocalEndpoint::with_exec(dir.path(), "", false, Box::new(MockExec::new()));
        let listed = endpoint.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert!(listed.contains("20240115-120000"));
    }

    #[test]
    fn missing_directory_without_create_flag_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("does-not-exist");

        let endpoint = LocalEndpoint::with_exec(missing, "", false, Box::new(MockExec::new()));
        assert!(matches!(
            endpoint.list(),
            Err(BackupError::EndpointUnavailable(..))
        ));
    }

    #[test]
    fn missing_directory_with_create_flag_is_created_and_empty() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("does-not-exist");

        let endpoint = LocalEndpoint::with_exec(&missing, "", true, Box::new(MockExec::new()));
        let listed = endpoint.list().unwrap();
        assert!(listed.is_empty());
        assert!(missing.exists());
    }

    #[test]
    fn delete_refuses_restricted_names() {
        let endpoint = LocalEndpoint::with_exec("/", "", false, Box::new(MockExec::new()));
        let err = endpoint.delete("home").unwrap_err();
        assert!(matches!(err, BackupError::RestrictedSubvolume(_)));
    }

    #[test]
    fn delete_missing_snapshot_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = LocalEndpoint::with_exec(dir.path(), "", false, Box::new(MockExec::new()));
        assert!(endpoint.delete("20240115-120000").is_ok());
    }
}
