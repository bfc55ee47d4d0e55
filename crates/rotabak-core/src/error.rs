use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("source unavailable: {path}: {reason}")]
    SourceUnavailable { path: PathBuf, reason: String },

    #[error("archive failed validation: {path}: {reason}")]
    ArchiveCorrupt { path: PathBuf, reason: String },

    #[error("transfer failed after {attempts} attempt(s): {reason}")]
    Transfer { attempts: u32, reason: String },

    #[error("archive not found on remote: {0}")]
    NotFound(String),

    #[error("another run holds the lock (pid {pid}, started {started_at}): {path}")]
    LockContention {
        path: PathBuf,
        pid: u32,
        started_at: String,
    },

    #[error("remote unavailable: {0}")]
    RemoteUnavailable(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("invalid run transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("command timed out after {secs}s: {command}")]
    Timeout { command: String, secs: u64 },

    #[error("command failed: {command}: {stderr}")]
    Command { command: String, stderr: String },

    #[error("home directory not found: set HOME environment variable")]
    HomeNotFound,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl BackupError {
    /// Errors a retry might cure. Local and logical failures are not retried.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BackupError::Timeout { .. } | BackupError::Command { .. } | BackupError::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
