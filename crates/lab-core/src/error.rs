use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, LabError>;

#[derive(Debug, Error)]
pub enum LabError {
    #[error("io error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Missing, unreadable or malformed config snapshot.
    #[error("config snapshot {}: {message}", path.display())]
    Snapshot { path: PathBuf, message: String },

    /// The external replication engine did not complete.
    #[error("replication engine failed: {0}")]
    Execution(String),

    /// The post-action audit still reports problems.
    #[error("repair did not converge: {0}")]
    Convergence(String),

    #[error("migration cannot proceed: {0}")]
    Migration(String),

    /// An operation was asked for in a state where it must not run.
    #[error("refused: {0}")]
    Refused(String),
}

impl LabError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        LabError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn snapshot(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        LabError::Snapshot {
            path: path.into(),
            message: message.into(),
        }
    }
}
