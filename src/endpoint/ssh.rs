//! A destination reached over SSH.
//!
//! Every call this endpoint makes — the one-shot `ls`/`test -d`/`btrfs
//! subvolume delete` probes as well as the streaming `receive` — goes over
//! a plain `ssh` invocation via `std::process::Command`, not through
//! `exec-rs`. See `src/exec.rs` for why: this crate never constructs
//! `exec_rs::Context::Remote`, so the whole SSH story is self-contained
//! here and in `crate::pipeline`. The invocation shape (`ssh -i <identity>
//! <user>@<host> <command>`) follows `command.rs::CommandSystem::run_single`'s
//! `Context::Remote` branch.

use std::collections::BTreeSet;
use std::process::Command;

use crate::backup_error::BackupError;
use crate::catalog;
use crate::pipeline::{PipelineStage, StageContext};

pub struct SshEndpoint {
    host: String,
    port: Option<u16>,
    user: String,
    identity: Option<String>,
    path: String,
    prefix: String,
    create_if_missing: bool,
}

impl SshEndpoint {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        host: impl Into<String>,
        port: Option<u16>,
        user: impl Into<String>,
        identity: Option<String>,
        path: impl Into<String>,
        prefix: impl Into<String>,
        create_if_missing: bool,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            user: user.into(),
            identity,
            path: path.into(),
            prefix: prefix.into(),
            create_if_missing,
        }
    }

    /// Canonical `ssh://user@host[:port]/path` form, used as the lock
    /// journal key.
    pub fn key(&self) -> String {
        match self.port {
            Some(port) => format!("ssh://{}@{}:{}{}", self.user, self.host, port, self.path),
            None => format!("ssh://{}@{}{}", self.user, self.host, self.path),
        }
    }

    fn run(&self, remote_command: &str) -> std::io::Result<std::process::Output> {
        let mut command = Command::new("ssh");
        if let Some(identity) = &self.identity {
            command.arg("-i").arg(identity);
        }
        if let Some(port) = self.port {
            command.arg("-p").arg(port.to_string());
        }
        command
            .arg(format!("{}@{}", self.user, self.host))
            .arg(remote_command);
        command.output()
    }

    fn ensure_directory(&self) -> Result<(), BackupError> {
        let probe = self
            .run(&format!("test -d {}", shell_quote(&self.path)))
            .map_err(|err| BackupError::EndpointUnavailable(self.key(), err.to_string()))?;

        if probe.status.success() {
            return Ok(());
        }

        if !self.create_if_missing {
            return Err(BackupError::EndpointUnavailable(
                self.key(),
                "destination directory does not exist (pass --create-dest-dir to create it)"
                    .to_string(),
            ));
        }

        let created = self
            .run(&format!("mkdir -p {}", shell_quote(&self.path)))
            .map_err(|err| BackupError::EndpointUnavailable(self.key(), err.to_string()))?;

        if !created.status.success() {
            return Err(BackupError::EndpointUnavailable(
                self.key(),
                String::from_utf8_lossy(&created.stderr).to_string(),
            ));
        }
        Ok(())
    }

    pub fn list(&self) -> Result<BTreeSet<String>, BackupError> {
        self.ensure_directory()?;

        let output = self
            .run(&format!("ls -1 {}", shell_quote(&self.path)))
            .map_err(|err| BackupError::EndpointUnavailable(self.key(), err.to_string()))?;

        if !output.status.success() {
            return Err(BackupError::EndpointUnavailable(
                self.key(),
                String::from_utf8_lossy(&output.stderr).to_string(),
            ));
        }

        let names = String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::to_string)
            .collect::<Vec<_>>();
        Ok(catalog::filter_basenames(names, &self.prefix))
    }

    pub fn delete(&self, basename: &str) -> Result<(), BackupError> {
        let subvolume = format!("{}/{}", self.path.trim_end_matches('/'), basename);
        let output = self
            .run(&format!(
                "sudo btrfs subvolume delete {}",
                shell_quote(&subvolume)
            ))
            .map_err(|err| BackupError::DeleteSubvolume(err.to_string()))?;

        if !output.status.success() {
            return Err(BackupError::DeleteSubvolume(
                String::from_utf8_lossy(&output.stderr).to_string(),
            ));
        }
        Ok(())
    }

    pub fn receive_stage(&self, _basename: &str, _parent: Option<&str>) -> PipelineStage {
        let command = format!("sudo btrfs receive {}", shell_quote(&self.path));

        PipelineStage::new(
            command,
            StageContext::Remote {
                host: self.host.clone(),
                port: self.port,
                user: self.user.clone(),
                identity: self.identity.clone(),
            },
        )
    }
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

impl super::Endpoint for SshEndpoint {
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

impl super::ReadableEndpoint for SshEndpoint {
    fn list(&self) -> Result<BTreeSet<String>, BackupError> {
        self.list()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_includes_port_when_set() {
        let endpoint = SshEndpoint::new("nas", Some(2222), "backup", None, "/backups", "", false);
        assert_eq!(endpoint.key(), "ssh://backup@nas:2222/backups");
    }

    #[test]
    fn key_omits_port_when_unset() {
        let endpoint = SshEndpoint::new("nas", None, "backup", None, "/backups", "", false);
        assert_eq!(endpoint.key(), "ssh://backup@nas/backups");
    }

    #[test]
    fn shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
    }
}
