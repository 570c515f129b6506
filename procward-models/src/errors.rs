use std::{io, path::PathBuf};

use thiserror::Error;

pub type SendableError = Box<dyn std::error::Error + Send + Sync>;

/// Result alias for process supervision operations.
pub type Result<T> = std::result::Result<T, ProcessError>;

/// Every way a single reconciliation can fail.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The requested parameters were rejected before any process was touched.
    #[error("invalid process spec: {0}")]
    InvalidSpec(String),

    #[error("working directory {} is not usable: {reason}", path.display())]
    WorkingDirInvalid { path: PathBuf, reason: String },

    /// The executable could not be found or exec failed.
    #[error("failed to launch '{command}': {reason}")]
    LaunchFailed { command: String, reason: String },

    /// A one-shot process ran past its timeout and was killed.
    #[error("process timed out after {timeout_secs}s")]
    TimedOut { timeout_secs: u64 },

    /// SIGTERM and SIGKILL both left the process alive.
    #[error("failed to terminate process {pid}: {reason}")]
    TerminationFailed { pid: u32, reason: String },

    #[error("corrupt PID file {}: {reason}", path.display())]
    CorruptRecord { path: PathBuf, reason: String },

    /// The invocation was interrupted while a child was still running.
    #[error("interrupted while waiting for process {pid}")]
    Interrupted { pid: u32 },

    /// Filesystem failure on a PID file or its lock.
    #[error("PID file store error on {}: {source}", path.display())]
    Store {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl ProcessError {
    pub fn store(path: impl Into<PathBuf>, source: io::Error) -> Self {
        ProcessError::Store {
            path: path.into(),
            source,
        }
    }

    pub fn launch_failed(command: impl Into<String>, reason: impl ToString) -> Self {
        ProcessError::LaunchFailed {
            command: command.into(),
            reason: reason.to_string(),
        }
    }

    /// Stable, machine-readable name of the failure.
    pub fn kind(&self) -> &'static str {
        match self {
            ProcessError::InvalidSpec(_) => "invalid-spec",
            ProcessError::WorkingDirInvalid { .. } => "working-dir-invalid",
            ProcessError::LaunchFailed { .. } => "launch-failed",
            ProcessError::TimedOut { .. } => "timed-out",
            ProcessError::TerminationFailed { .. } => "termination-failed",
            ProcessError::CorruptRecord { .. } => "corrupt-record",
            ProcessError::Interrupted { .. } => "interrupted",
            ProcessError::Store { .. } => "store",
        }
    }
}
