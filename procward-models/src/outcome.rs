use std::fmt;

use serde::Serialize;

use crate::errors::ProcessError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReconcileStatus {
    Started,
    AlreadyRunning,
    Completed,
    Stopped,
    AlreadyStopped,
    TimedOut,
    Failed,
}

impl ReconcileStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ReconcileStatus::Started => "started",
            ReconcileStatus::AlreadyRunning => "already-running",
            ReconcileStatus::Completed => "completed",
            ReconcileStatus::Stopped => "stopped",
            ReconcileStatus::AlreadyStopped => "already-stopped",
            ReconcileStatus::TimedOut => "timed-out",
            ReconcileStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for ReconcileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconciliationResult {
    pub changed: bool,
    pub status: ReconcileStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rc: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub msg: String,
}

impl ReconciliationResult {
    pub fn new(changed: bool, status: ReconcileStatus, msg: impl Into<String>) -> Self {
        Self {
            changed,
            status,
            pid: None,
            rc: None,
            stdout: String::new(),
            stderr: String::new(),
            msg: msg.into(),
        }
    }

    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = Some(pid);
        self
    }

    pub fn with_rc(mut self, rc: i32) -> Self {
        self.rc = Some(rc);
        self
    }

    pub fn with_output(mut self, output: CapturedOutput) -> Self {
        self.stdout = output.stdout;
        self.stderr = output.stderr;
        self
    }
}

/// A failed invocation together with whatever it observed before failing.
#[derive(Debug)]
pub struct InvocationFailure {
    pub error: ProcessError,
    /// True when the failure may have left the system modified.
    pub changed: bool,
    pub output: CapturedOutput,
}

impl InvocationFailure {
    pub fn new(error: ProcessError) -> Self {
        Self {
            error,
            changed: false,
            output: CapturedOutput::default(),
        }
    }

    pub fn changed(mut self, changed: bool) -> Self {
        self.changed = changed;
        self
    }

    pub fn with_output(mut self, output: CapturedOutput) -> Self {
        self.output = output;
        self
    }

    pub fn status(&self) -> ReconcileStatus {
        match self.error {
            ProcessError::TimedOut { .. } => ReconcileStatus::TimedOut,
            _ => ReconcileStatus::Failed,
        }
    }
}

impl From<ProcessError> for InvocationFailure {
    fn from(error: ProcessError) -> Self {
        InvocationFailure::new(error)
    }
}

impl fmt::Display for InvocationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.error.kind(), self.error)
    }
}

impl std::error::Error for InvocationFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}
