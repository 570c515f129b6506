//! Stopping processes with SIGTERM, then SIGKILL.

use std::{
    path::Path,
    thread,
    time::{Duration, Instant},
};

use log::{debug, info, warn};
use nix::sys::signal::Signal;
use procward_models::{ProcessError, ProcessRecord};

use crate::{os::send_signal, pidfile::PidFileStore, probe::ProcessProbe};

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const KILL_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Target {
    pid: u32,
    start_time: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminationReport {
    /// Every PID that was signalled, in signalling order.
    pub pids: Vec<u32>,
    /// True when at least one process needed SIGKILL.
    pub forced: bool,
}

pub struct Terminator<'a> {
    store: &'a PidFileStore,
    probe: &'a ProcessProbe,
    poll_interval: Duration,
    kill_grace: Duration,
}

impl<'a> Terminator<'a> {
    pub fn new(store: &'a PidFileStore, probe: &'a ProcessProbe) -> Self {
        Self {
            store,
            probe,
            poll_interval: POLL_INTERVAL,
            kill_grace: KILL_GRACE,
        }
    }

    pub fn with_kill_grace(mut self, kill_grace: Duration) -> Self {
        self.kill_grace = kill_grace;
        self
    }

    /// Stops `record`'s process (and, with `tree`, every descendant found when
    /// termination begins), then deletes `pid_file`. Never loops past
    /// `timeout` plus the kill grace period.
    pub fn terminate(
        &self,
        record: &ProcessRecord,
        pid_file: Option<&Path>,
        timeout: Duration,
        tree: bool,
    ) -> Result<TerminationReport, ProcessError> {
        let targets = self.targets(record, tree);
        let pids: Vec<u32> = targets.iter().map(|t| t.pid).collect();
        info!("Terminating PID {} ({} process(es))", record.pid, targets.len());

        self.signal_all(&targets, Signal::SIGTERM, record.pid)?;
        let survivors = self.wait_for_exit(&targets, timeout);

        let forced = !survivors.is_empty();
        if forced {
            warn!(
                "{} process(es) ignored SIGTERM for {}s, sending SIGKILL",
                survivors.len(),
                timeout.as_secs()
            );
            self.signal_all(&survivors, Signal::SIGKILL, record.pid)?;
            let remaining = self.wait_for_exit(&survivors, self.kill_grace);
            if let Some(stuck) = remaining.first() {
                return Err(ProcessError::TerminationFailed {
                    pid: stuck.pid,
                    reason: "still present after SIGKILL; manual intervention required".into(),
                });
            }
        }

        if let Some(path) = pid_file {
            self.store.delete(path)?;
        }

        Ok(TerminationReport { pids, forced })
    }

    /// Root plus descendants, oldest first. Start tokens are pinned now so a
    /// PID recycled mid-termination is never signalled.
    fn targets(&self, record: &ProcessRecord, tree: bool) -> Vec<Target> {
        let root_start = record
            .start_time
            .or_else(|| self.probe.inspect(record.pid).map(|live| live.start_time));
        let mut targets = vec![(
            root_start.unwrap_or(0),
            Target {
                pid: record.pid,
                start_time: root_start,
            },
        )];

        if tree {
            for live in self.probe.descendants(record.pid) {
                targets.push((
                    live.start_time,
                    Target {
                        pid: live.pid,
                        start_time: Some(live.start_time),
                    },
                ));
            }
        }

        targets.sort_by_key(|(start, target)| (*start, target.pid));
        targets.into_iter().map(|(_, target)| target).collect()
    }

    fn signal_all(&self, targets: &[Target], sig: Signal, root: u32) -> Result<(), ProcessError> {
        for target in targets {
            if !self.probe.is_alive(target.pid, target.start_time) {
                continue;
            }
            match send_signal(target.pid, sig) {
                Ok(_) => {}
                Err(err) if target.pid == root => {
                    return Err(ProcessError::TerminationFailed {
                        pid: target.pid,
                        reason: format!("cannot send {sig:?}: {err}"),
                    });
                }
                Err(err) => warn!("Cannot send {:?} to descendant {}: {}", sig, target.pid, err),
            }
        }
        Ok(())
    }

    /// Polls until every target is gone or `timeout` elapses; returns the
    /// survivors.
    fn wait_for_exit(&self, targets: &[Target], timeout: Duration) -> Vec<Target> {
        let start = Instant::now();
        loop {
            let alive: Vec<Target> = targets
                .iter()
                .copied()
                .filter(|t| self.probe.is_alive(t.pid, t.start_time))
                .collect();
            if alive.is_empty() {
                debug!("All targets exited after {:?}", start.elapsed());
                return alive;
            }
            if start.elapsed() >= timeout {
                return alive;
            }
            thread::sleep(self.poll_interval);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::process::{Child, Command, Stdio};

    use procward_models::ProcessState;

    use super::*;

    fn spawn(script: &str) -> Child {
        Command::new("sh")
            .args(["-c", script])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .unwrap()
    }

    fn record_for(child: &Child, probe: &ProcessProbe) -> ProcessRecord {
        let live = probe.inspect(child.id()).unwrap();
        ProcessRecord {
            pid: child.id(),
            start_time: Some(live.start_time),
            signature: None,
            status: ProcessState::Sleeping,
            launched_at: None,
        }
    }

    fn wait_for_children(probe: &ProcessProbe, pid: u32, count: usize) {
        let start = Instant::now();
        while probe.descendants(pid).len() < count {
            assert!(start.elapsed() < Duration::from_secs(5), "children never appeared");
            thread::sleep(Duration::from_millis(20));
        }
    }

    #[test]
    fn graceful_stop_removes_pid_file() {
        let temp = tempfile::tempdir().unwrap();
        let pid_file = temp.path().join("svc.pid");
        let store = PidFileStore::new();
        let probe = ProcessProbe::default();

        let mut child = spawn("exec sleep 30");
        let record = record_for(&child, &probe);
        store.write(&pid_file, &record).unwrap();

        let report = Terminator::new(&store, &probe)
            .terminate(&record, Some(&pid_file), Duration::from_secs(5), false)
            .unwrap();

        assert_eq!(report.pids, vec![child.id()]);
        assert!(!report.forced);
        assert!(!pid_file.exists());
        child.wait().unwrap();
    }

    #[test]
    fn ignoring_sigterm_escalates_to_sigkill() {
        let store = PidFileStore::new();
        let probe = ProcessProbe::default();

        let mut child = spawn("trap '' TERM; while :; do sleep 0.1; done");
        thread::sleep(Duration::from_millis(200));
        let record = record_for(&child, &probe);

        let report = Terminator::new(&store, &probe)
            .terminate(&record, None, Duration::from_millis(300), false)
            .unwrap();

        assert!(report.forced);
        assert!(!probe.is_alive(child.id(), record.start_time));
        child.wait().unwrap();
    }

    #[test]
    fn tree_mode_stops_descendants() {
        let store = PidFileStore::new();
        let probe = ProcessProbe::default();

        let mut child = spawn("sleep 30 & sleep 30 & wait");
        wait_for_children(&probe, child.id(), 2);
        let descendants: Vec<u32> = probe.descendants(child.id()).iter().map(|l| l.pid).collect();
        let record = record_for(&child, &probe);

        let report = Terminator::new(&store, &probe)
            .terminate(&record, None, Duration::from_secs(5), true)
            .unwrap();

        assert_eq!(report.pids[0], child.id());
        for pid in descendants {
            assert!(report.pids.contains(&pid));
            assert!(!probe.is_alive(pid, None));
        }
        child.wait().unwrap();
    }

    #[test]
    fn already_gone_process_is_a_no_op() {
        let temp = tempfile::tempdir().unwrap();
        let pid_file = temp.path().join("gone.pid");
        let store = PidFileStore::new();
        let probe = ProcessProbe::default();

        let mut child = spawn("exit 0");
        let pid = child.id();
        child.wait().unwrap();
        store.write(&pid_file, &ProcessRecord::legacy(pid)).unwrap();

        let report = Terminator::new(&store, &probe)
            .terminate(&ProcessRecord::legacy(pid), Some(&pid_file), Duration::from_secs(1), true)
            .unwrap();
        assert!(!report.forced);
        assert!(!pid_file.exists());
    }
}
