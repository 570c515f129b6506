use std::{collections::BTreeMap, path::PathBuf, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{ProcessError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DesiredState {
    #[default]
    Present,
    Absent,
}

impl DesiredState {
    pub fn as_str(self) -> &'static str {
        match self {
            DesiredState::Present => "present",
            DesiredState::Absent => "absent",
        }
    }
}

/// A fully validated request for one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    pub argv: Vec<String>,
    pub state: DesiredState,
    pub background: bool,
    /// Upper bound on a one-shot run. Ignored for background processes.
    pub timeout: Duration,
    pub pid_file: Option<PathBuf>,
    pub working_dir: Option<PathBuf>,
    pub environment: BTreeMap<String, String>,
    /// When false the child sees only `environment`.
    pub inherit_env: bool,
    /// Grace period between SIGTERM and SIGKILL.
    pub stop_timeout: Duration,
    pub kill_tree: bool,
    pub log_file: Option<PathBuf>,
}

impl ProcessSpec {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            state: DesiredState::Present,
            background: false,
            timeout: Duration::from_secs(300),
            pid_file: None,
            working_dir: None,
            environment: BTreeMap::new(),
            inherit_env: true,
            stop_timeout: Duration::from_secs(10),
            kill_tree: true,
            log_file: None,
        }
    }

    pub fn program(&self) -> &str {
        self.argv.first().map(String::as_str).unwrap_or_default()
    }

    /// The command as a single line, for messages.
    pub fn display_command(&self) -> String {
        self.argv.join(" ")
    }

    pub fn validate(&self) -> Result<()> {
        if self.argv.is_empty() || self.program().trim().is_empty() {
            return Err(ProcessError::InvalidSpec("command must not be empty".into()));
        }
        if !self.background && self.state == DesiredState::Present && self.timeout.is_zero() {
            return Err(ProcessError::InvalidSpec(
                "timeout must be greater than zero for one-shot processes".into(),
            ));
        }
        if self.stop_timeout.is_zero() {
            return Err(ProcessError::InvalidSpec(
                "stop_timeout must be greater than zero".into(),
            ));
        }
        if let Some(key) = self
            .environment
            .keys()
            .find(|key| key.is_empty() || key.contains('=') || key.contains('\0'))
        {
            return Err(ProcessError::InvalidSpec(format!(
                "invalid environment variable name '{key}'"
            )));
        }
        Ok(())
    }
}

/// Identity of a launched program: what the kernel reports as its executable
/// and the arguments it was started with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSignature {
    pub exe: PathBuf,
    pub argv: Vec<String>,
}

/// Scheduler state letter from `/proc/<pid>/stat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    Running,
    Sleeping,
    Waiting,
    Stopped,
    Zombie,
    Dead,
    Unknown,
}

impl ProcessState {
    pub fn from_code(code: char) -> Self {
        match code {
            'R' => ProcessState::Running,
            'S' | 'I' => ProcessState::Sleeping,
            'D' => ProcessState::Waiting,
            'T' | 't' => ProcessState::Stopped,
            'Z' => ProcessState::Zombie,
            'X' | 'x' => ProcessState::Dead,
            _ => ProcessState::Unknown,
        }
    }

    /// Zombies and dead entries still own a PID but no longer run anything.
    pub fn is_active(self) -> bool {
        !matches!(self, ProcessState::Zombie | ProcessState::Dead)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProcessState::Running => "running",
            ProcessState::Sleeping => "sleeping",
            ProcessState::Waiting => "waiting",
            ProcessState::Stopped => "stopped",
            ProcessState::Zombie => "zombie",
            ProcessState::Dead => "dead",
            ProcessState::Unknown => "unknown",
        }
    }
}

/// What a PID file remembers about a background process.
///
/// `signature` and `start_time` are absent for bare-integer PID files written
/// by the daemons themselves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub pid: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<CommandSignature>,
    #[serde(default = "default_status")]
    pub status: ProcessState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub launched_at: Option<DateTime<Utc>>,
}

impl ProcessRecord {
    pub fn legacy(pid: u32) -> Self {
        Self {
            pid,
            start_time: None,
            signature: None,
            status: ProcessState::Unknown,
            launched_at: None,
        }
    }

    pub fn is_legacy(&self) -> bool {
        self.signature.is_none()
    }
}

fn default_status() -> ProcessState {
    ProcessState::Unknown
}
