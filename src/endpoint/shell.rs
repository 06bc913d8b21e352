//! The write-only custom-command destination. `shell://<command>`
//! destination strings run an arbitrary user command with the send stream
//! on its stdin; `%DEST%` in the command is replaced with the new
//! snapshot's basename, and `BACKUP_PARENT` is exported so the command can
//! do its own incremental bookkeeping (see DESIGN.md for why).
//!
//! `list()` always reports empty and `delete()` is a no-op: the user opted
//! out of state tracking by choosing this endpoint, so every run is a full
//! send. This is why `ShellEndpoint` implements [`super::Endpoint`] but not
//! [`super::ReadableEndpoint`] — the coordinator's transfer plan for this
//! destination never calls `list()` in the first place.

use crate::backup_error::BackupError;
use crate::pipeline::{PipelineStage, StageContext};

pub struct ShellEndpoint {
    command_template: String,
}

impl ShellEndpoint {
    pub fn new(command_template: impl Into<String>) -> Self {
        Self {
            command_template: command_template.into(),
        }
    }

    /// The command template itself is the lock-journal key: two
    /// `shell://` destinations are the same destination only if they run
    /// the identical command.
    pub fn key(&self) -> String {
        format!("shell://{}", self.command_template)
    }

    pub fn delete(&self, _basename: &str) -> Result<(), BackupError> {
        Ok(())
    }

    /// `parent` is exported as `BACKUP_PARENT` only when one was chosen —
    /// an incremental send has a parent, a full send does not, and the
    /// command should be able to tell the difference by the variable's
    /// absence rather than an empty string.
    pub fn receive_stage(&self, basename: &str, parent: Option<&str>) -> PipelineStage {
        let command = self.command_template.replace("%DEST%", basename);
        let stage = PipelineStage::new(command, StageContext::Plain);
        match parent {
            Some(parent) => stage.env("BACKUP_PARENT", parent),
            None => stage,
        }
    }
}

impl super::Endpoint for ShellEndpoint {
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
