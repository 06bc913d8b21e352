//! Streaming `btrfs send | ... | btrfs receive` pipelines.
//!
//! Snapshot streams can be gigabytes in size, so this module never buffers a
//! stage's output into memory: each stage's stdout is piped directly into
//! the next stage's stdin via `std::process::Child`, the way a shell pipe
//! does. Every stage's exit status is checked and its stderr captured for
//! error reporting; a failure anywhere in the chain fails the transfer.
//!
//! The chaining style follows the legacy `command.rs::CommandSystem`, which
//! already links raw `Child`s this way; the newer `exec-rs`-based
//! `exec_piped` this module replaces buffers the whole stream into a
//! `String`, which cannot work for multi-gigabyte snapshots.

use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};

use crate::backup_error::BackupError;

/// Tracks the process IDs of every currently-spawned pipeline child so a
/// termination signal can kill them directly rather than waiting for the
/// next cooperative check point.
#[derive(Clone, Default)]
pub struct ChildRegistry(Arc<Mutex<Vec<u32>>>);

impl ChildRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn track(&self, pid: u32) {
        self.0.lock().unwrap().push(pid);
    }

    fn untrack(&self, pid: u32) {
        self.0.lock().unwrap().retain(|&p| p != pid);
    }

    /// Send `SIGTERM` to every tracked child. Best-effort: a child that has
    /// already exited is simply not found by `kill(1)`.
    pub fn kill_all(&self) {
        for pid in self.0.lock().unwrap().iter() {
            let _ = Command::new("kill")
                .arg("-TERM")
                .arg(pid.to_string())
                .status();
        }
    }
}

/// How a single pipeline stage's command is invoked.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StageContext {
    /// Run as `sudo -nu <user> bash -c <command>` on the local host.
    Local { user: String },
    /// Run over `ssh [-i identity] [-p port] <user>@<host> <command>`.
    Remote {
        host: String,
        port: Option<u16>,
        user: String,
        identity: Option<String>,
    },
    /// Run `bash -c <command>` directly, with no privilege escalation —
    /// used for user-supplied `shell://` destination commands.
    Plain,
}

/// One stage of a pipeline: a shell command line and the context to invoke
/// it in.
pub struct PipelineStage {
    command: String,
    context: StageContext,
    envs: Vec<(String, String)>,
}

impl PipelineStage {
    pub fn new(command: impl Into<String>, context: StageContext) -> Self {
        Self {
            command: command.into(),
            context,
            envs: Vec::new(),
        }
    }

    /// Set an environment variable visible to this stage's command.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    fn spawn(&self, stdin: Option<std::process::ChildStdout>) -> std::io::Result<Child> {
        let mut command = match &self.context {
            StageContext::Local { user } => {
                let mut command = Command::new("sudo");
                command
                    .arg("-nu")
                    .arg(user)
                    .arg("bash")
                    .arg("-c")
                    .arg(&self.command);
                command
            }
            StageContext::Remote {
                host,
                port,
                user,
                identity,
            } => {
                let mut command = Command::new("ssh");
                if let Some(identity) = identity {
                    command.arg("-i").arg(identity);
                }
                if let Some(port) = port {
                    command.arg("-p").arg(port.to_string());
                }
                command
                    .arg(format!("{}@{}", user, host))
                    .arg(&self.command);
                command
            }
            StageContext::Plain => {
                let mut command = Command::new("bash");
                command.arg("-c").arg(&self.command);
                command
            }
        };

        command.envs(self.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())));

        if let Some(stdout) = stdin {
            command.stdin(Stdio::from(stdout));
        }

        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        command.spawn()
    }
}

/// A chain of pipeline stages, run end to end with no intermediate
/// buffering. `run` spawns every stage before waiting on any of them, so
/// data flows continuously through the pipe chain the way it would under a
/// shell `|`.
pub struct Pipeline {
    stages: Vec<PipelineStage>,
}

impl Pipeline {
    pub fn new(stages: Vec<PipelineStage>) -> Self {
        assert!(!stages.is_empty(), "pipeline must have at least one stage");
        Self { stages }
    }

    /// Run the pipeline, returning an error carrying `snapshot`/`destination`
    /// context and the last stage's stderr if any stage exits non-zero.
    pub fn run(self, snapshot: &str, destination: &str) -> Result<(), BackupError> {
        self.run_with_registry(snapshot, destination, &ChildRegistry::new())
    }

    /// Like `run`, but registers every spawned child's pid with `registry`
    /// so a termination signal delivered mid-transfer can kill them
    /// directly instead of only setting a cooperative flag.
    ///
    /// Every stage is spawned before any is waited on, and every stage is
    /// waited on, not just the last: a non-zero exit anywhere in the chain
    /// (for instance `btrfs send` itself, upstream of a receiver that
    /// exits 0 only because its stdin closed early) is a transfer failure.
    pub fn run_with_registry(
        self,
        snapshot: &str,
        destination: &str,
        registry: &ChildRegistry,
    ) -> Result<(), BackupError> {
        let stage_count = self.stages.len();
        let mut children: Vec<Child> = Vec::with_capacity(stage_count);
        let mut next_stdin: Option<std::process::ChildStdout> = None;

        for stage in self.stages.into_iter() {
            let mut spawned = stage
                .spawn(next_stdin.take())
                .map_err(|err| BackupError::TransferFailed {
                    snapshot: snapshot.to_string(),
                    destination: destination.to_string(),
                    detail: format!("failed to start pipeline stage: {err}"),
                })?;
            registry.track(spawned.id());
            next_stdin = spawned.stdout.take();
            children.push(spawned);
        }

        let mut failure: Option<BackupError> = None;

        for child in children {
            let pid = child.id();
            let result = child.wait_with_output();
            registry.untrack(pid);

            let output = match result {
                Ok(output) => output,
                Err(err) => {
                    failure.get_or_insert(BackupError::TransferFailed {
                        snapshot: snapshot.to_string(),
                        destination: destination.to_string(),
                        detail: format!("failed waiting for pipeline stage: {err}"),
                    });
                    continue;
                }
            };

            match output.status.code() {
                Some(0) => {}
                Some(code) => {
                    failure.get_or_insert(BackupError::TransferFailed {
                        snapshot: snapshot.to_string(),
                        destination: destination.to_string(),
                        detail: format!(
                            "pipeline stage exited with status {code}: {}",
                            String::from_utf8_lossy(&output.stderr)
                        ),
                    });
                }
                None => {
                    failure.get_or_insert(BackupError::TransferFailed {
                        snapshot: snapshot.to_string(),
                        destination: destination.to_string(),
                        detail: "pipeline stage was terminated by a signal".to_string(),
                    });
                }
            }
        }

        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_stage_succeeds() {
        let pipeline = Pipeline::new(vec![PipelineStage::new("true", StageContext::Plain)]);

        assert!(pipeline.run("20240115-120000", "local:/backups").is_ok());
    }

    #[test]
    fn failing_stage_reports_transfer_failed() {
        let pipeline = Pipeline::new(vec![PipelineStage::new("false", StageContext::Plain)]);

        let err = pipeline
            .run("20240115-120000", "local:/backups")
            .unwrap_err();

        match err {
            BackupError::TransferFailed {
                snapshot,
                destination,
                ..
            } => {
                assert_eq!(snapshot, "20240115-120000");
                assert_eq!(destination, "local:/backups");
            }
            other => panic!("expected TransferFailed, got {other:?}"),
        }
    }

    #[test]
    fn two_stage_pipeline_streams_through() {
        let pipeline = Pipeline::new(vec![
            PipelineStage::new("printf hello", StageContext::Plain),
            PipelineStage::new("cat", StageContext::Plain),
        ]);

        assert!(pipeline.run("20240115-120000", "local:/backups").is_ok());
    }

    #[test]
    fn env_var_is_visible_to_command() {
        let pipeline = Pipeline::new(vec![PipelineStage::new(
            "test \"$BACKUP_PARENT\" = \"20240115-120000\"",
            StageContext::Plain,
        )
        .env("BACKUP_PARENT", "20240115-120000")]);

        assert!(pipeline.run("20240115-120100", "shell:test").is_ok());
    }
}
