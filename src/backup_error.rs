use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("destination \"{0}\" is unreachable: {1}")]
    EndpointUnavailable(String, String),

    #[error("transfer of snapshot \"{snapshot}\" to destination \"{destination}\" failed: {detail}")]
    TransferFailed {
        snapshot: String,
        destination: String,
        detail: String,
    },

    #[error("snapshot \"{0}\" already exists")]
    SnapshotExists(String),

    #[error("lock journal at \"{path}\" is corrupt: {source}")]
    CorruptJournal {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid destination specification \"{0}\": {1}")]
    InvalidDestination(String, String),

    #[error("invalid snapshot basename \"{0}\"")]
    InvalidBasename(String),

    #[error("refusing to delete subvolume \"{0}\": name is on the restricted list")]
    RestrictedSubvolume(String),

    #[error("error snapshotting subvolume: {0}")]
    SnapshotCreation(String),

    #[error("error deleting subvolume: {0}")]
    DeleteSubvolume(String),

    #[error(transparent)]
    Exec(#[from] exec_rs::ExecError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl BackupError {
    /// Process exit code for this error kind.
    pub fn exit_code(&self) -> i32 {
        match self {
            BackupError::SnapshotExists(_) | BackupError::SnapshotCreation(_) => 3,
            BackupError::CorruptJournal { .. } | BackupError::InvalidDestination(..) => 2,
            _ => 1,
        }
    }
}
