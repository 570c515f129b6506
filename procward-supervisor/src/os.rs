use std::{fs, path::PathBuf};

use log::{debug, warn};
use nix::{
    errno::Errno,
    sys::signal::{self, Signal},
    unistd::Pid,
};
use procward_models::ProcessState;

const DELETED_SUFFIX: &str = " (deleted)";

/// The fields of `/proc/<pid>/stat` we care about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcStat {
    pub pid: u32,
    pub ppid: u32,
    pub state: ProcessState,
    /// Clock ticks after boot at which the process started.
    pub start_time: u64,
}

/// Read-only view of a procfs mount.
#[derive(Debug, Clone)]
pub struct ProcFs {
    root: PathBuf,
}

impl Default for ProcFs {
    fn default() -> Self {
        Self::at("/proc")
    }
}

impl ProcFs {
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn entry(&self, pid: u32) -> PathBuf {
        self.root.join(pid.to_string())
    }

    pub fn stat(&self, pid: u32) -> Option<ProcStat> {
        let contents = fs::read_to_string(self.entry(pid).join("stat")).ok()?;
        parse_stat(&contents)
    }

    /// Resolved executable, or `None` when the link is unreadable (kernel
    /// threads, other users' processes).
    pub fn exe(&self, pid: u32) -> Option<PathBuf> {
        let target = fs::read_link(self.entry(pid).join("exe")).ok()?;
        let trimmed = target
            .to_str()
            .and_then(|raw| raw.strip_suffix(DELETED_SUFFIX))
            .map(PathBuf::from);
        Some(trimmed.unwrap_or(target))
    }

    pub fn cmdline(&self, pid: u32) -> Option<Vec<String>> {
        let raw = fs::read(self.entry(pid).join("cmdline")).ok()?;
        if raw.is_empty() {
            return None;
        }
        Some(
            raw.split(|byte| *byte == 0)
                .filter(|part| !part.is_empty())
                .map(|part| String::from_utf8_lossy(part).into_owned())
                .collect(),
        )
    }

    /// Every numeric entry under the procfs root.
    pub fn pids(&self) -> Vec<u32> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) => {
                warn!("Unable to list {}: {}", self.root.display(), err);
                return Vec::new();
            }
        };

        let mut pids: Vec<u32> = entries
            .filter_map(Result::ok)
            .filter_map(|entry| entry.file_name().to_str()?.parse::<u32>().ok())
            .collect();
        pids.sort_unstable();
        pids
    }
}

pub fn parse_stat(contents: &str) -> Option<ProcStat> {
    // The command name may itself contain spaces and parentheses, so split on
    // the last closing paren.
    let open = contents.find('(')?;
    let close = contents.rfind(')')?;
    let pid = contents[..open].trim().parse::<u32>().ok()?;
    let fields: Vec<&str> = contents.get(close + 1..)?.split_whitespace().collect();

    let state = fields.first()?.chars().next()?;
    let ppid = fields.get(1)?.parse::<u32>().ok()?;
    let start_time = fields.get(19)?.parse::<u64>().ok()?;

    Some(ProcStat {
        pid,
        ppid,
        state: ProcessState::from_code(state),
        start_time,
    })
}

fn to_pid(pid: u32) -> Option<Pid> {
    i32::try_from(pid).ok().filter(|v| *v > 0).map(Pid::from_raw)
}

/// Sends `sig` to one process. `Ok(false)` means it was already gone.
pub fn send_signal(pid: u32, sig: Signal) -> Result<bool, Errno> {
    let Some(target) = to_pid(pid) else {
        return Ok(false);
    };
    match signal::kill(target, sig) {
        Ok(()) => {
            debug!("Sent {:?} to PID {}", sig, pid);
            Ok(true)
        }
        Err(Errno::ESRCH) => Ok(false),
        Err(err) => Err(err),
    }
}

/// Sends `sig` to a whole process group; failures are logged, not returned.
pub fn signal_group(pgid: u32, sig: Signal) {
    let Some(target) = to_pid(pgid) else {
        return;
    };
    match signal::killpg(target, sig) {
        Ok(()) => debug!("Sent {:?} to process group {}", sig, pgid),
        Err(Errno::ESRCH) => debug!("Process group {} already gone", pgid),
        Err(err) => warn!("Failed to signal process group {}: {}", pgid, err),
    }
}
