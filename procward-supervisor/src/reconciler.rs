//! Drives one invocation from requested state to observed state.
//!
//! `Start → Probing → {Launching | Terminating | NoOp} → Reporting → Done`.
//! Every probe-then-act section on a PID file runs under the store's lock, so
//! concurrent invocations against the same file serialize and the loser sees
//! the winner's process as already running.

use std::path::Path;

use log::{debug, info, warn};
use procward_models::{
    DesiredState, InvocationFailure, ProcessError, ProcessRecord, ProcessSpec, ReconcileStatus,
    ReconciliationResult,
};

use crate::{
    cancel::CancelToken,
    launcher::{LaunchOutcome, Launcher},
    pidfile::{PidFileLock, PidFileStore},
    probe::{ExpectedCommand, LiveProcess, ProbeResult, ProcessProbe},
    terminator::Terminator,
};

pub type ReconcileResult = Result<ReconciliationResult, InvocationFailure>;

pub struct Reconciler {
    store: PidFileStore,
    probe: ProcessProbe,
    cancel: CancelToken,
    check_mode: bool,
}

impl Reconciler {
    pub fn new(cancel: CancelToken) -> Self {
        Self {
            store: PidFileStore::new(),
            probe: ProcessProbe::default(),
            cancel,
            check_mode: false,
        }
    }

    pub fn with_probe(mut self, probe: ProcessProbe) -> Self {
        self.probe = probe;
        self
    }

    /// Report what would change without launching, signalling, or writing.
    pub fn check_mode(mut self, enabled: bool) -> Self {
        self.check_mode = enabled;
        self
    }

    pub fn probe(&self) -> &ProcessProbe {
        &self.probe
    }

    pub fn reconcile(&self, spec: &ProcessSpec) -> ReconcileResult {
        spec.validate()?;
        debug!(
            "Reconciling '{}' state={} background={} check_mode={}",
            spec.display_command(),
            spec.state.as_str(),
            spec.background,
            self.check_mode
        );

        match (spec.state, spec.background) {
            (DesiredState::Present, false) => self.run_one_shot(spec),
            (DesiredState::Present, true) => self.ensure_running(spec),
            (DesiredState::Absent, _) => self.ensure_stopped(spec),
        }
    }

    fn launcher(&self) -> Launcher<'_> {
        Launcher::new(&self.store, &self.probe, self.cancel.clone())
    }

    fn terminator(&self) -> Terminator<'_> {
        Terminator::new(&self.store, &self.probe)
    }

    fn run_one_shot(&self, spec: &ProcessSpec) -> ReconcileResult {
        if let Some(path) = &spec.pid_file {
            warn!(
                "pid_file {} is ignored: one-shot processes are not tracked",
                path.display()
            );
        }

        if self.check_mode {
            return Ok(ReconciliationResult::new(
                true,
                ReconcileStatus::Completed,
                format!("Would run '{}'", spec.display_command()),
            ));
        }

        match self.launcher().launch(spec)? {
            LaunchOutcome::Completed { rc, output } => Ok(ReconciliationResult::new(
                true,
                ReconcileStatus::Completed,
                format!("Process exited with code {rc}"),
            )
            .with_rc(rc)
            .with_output(output)),
            LaunchOutcome::Detached(record) => Err(unexpected_detach(&record)),
        }
    }

    fn ensure_running(&self, spec: &ProcessSpec) -> ReconcileResult {
        let expected = ExpectedCommand::from_spec(spec);

        let Some(path) = spec.pid_file.as_deref() else {
            warn!("No pid_file given; locating '{}' by signature", spec.display_command());
            let _lock = self.command_lock(spec)?;
            if let Some(live) = self.probe.find_matching(&expected).into_iter().next() {
                return Ok(already_running(live.pid));
            }
            return self.start(spec, &expected, None);
        };

        let _lock = self.lock(path)?;
        let record = self.read_record(path)?;
        match self.probe.probe(record.as_ref(), &expected) {
            ProbeResult::Running(live) => Ok(already_running(live.pid)),
            ProbeResult::Stale { live, reason } => {
                warn!(
                    "Ignoring stale PID file {} (PID {}): {}",
                    path.display(),
                    live.pid,
                    reason
                );
                self.start(spec, &expected, Some(path))
            }
            ProbeResult::Absent => self.start(spec, &expected, Some(path)),
        }
    }

    fn start(
        &self,
        spec: &ProcessSpec,
        expected: &ExpectedCommand,
        pid_file: Option<&Path>,
    ) -> ReconcileResult {
        if self.check_mode {
            return Ok(ReconciliationResult::new(
                true,
                ReconcileStatus::Started,
                format!("Would start '{}'", spec.display_command()),
            ));
        }

        let record = match self.launcher().launch(spec)? {
            LaunchOutcome::Detached(record) => record,
            LaunchOutcome::Completed { .. } => {
                return Err(InvocationFailure::new(ProcessError::launch_failed(
                    spec.display_command(),
                    "background launch ran to completion",
                )));
            }
        };

        // Only report success the kernel can confirm.
        if !self.probe.probe(Some(&record), expected).is_running() {
            if let Some(path) = pid_file {
                self.discard(path);
            }
            return Err(InvocationFailure::new(ProcessError::launch_failed(
                spec.display_command(),
                format!("process {} exited immediately after launch", record.pid),
            )));
        }

        info!("Started '{}' with PID {}", spec.display_command(), record.pid);
        Ok(ReconciliationResult::new(
            true,
            ReconcileStatus::Started,
            format!("Process started with PID {}", record.pid),
        )
        .with_pid(record.pid))
    }

    fn ensure_stopped(&self, spec: &ProcessSpec) -> ReconcileResult {
        let expected = ExpectedCommand::from_spec(spec);

        let Some(path) = spec.pid_file.as_deref() else {
            let _lock = self.command_lock(spec)?;
            let matches = self.probe.find_matching(&expected);
            if matches.is_empty() {
                return Ok(ReconciliationResult::new(
                    false,
                    ReconcileStatus::AlreadyStopped,
                    "Process not found",
                ));
            }
            return self.stop_all(spec, &matches);
        };

        let _lock = self.lock(path)?;
        let record = self.read_record(path)?;
        match (self.probe.probe(record.as_ref(), &expected), record) {
            (ProbeResult::Running(live), Some(record)) => self.stop(spec, &record, &live, Some(path)),
            (verdict, _) => {
                let msg = match &verdict {
                    ProbeResult::Stale { live, reason } => {
                        warn!(
                            "PID file {} names PID {} which is not ours: {}",
                            path.display(),
                            live.pid,
                            reason
                        );
                        format!(
                            "Process not running; stale PID file named PID {}: {}",
                            live.pid, reason
                        )
                    }
                    _ => "Process not running".to_string(),
                };
                if !self.check_mode {
                    self.discard(path);
                }
                Ok(ReconciliationResult::new(
                    false,
                    ReconcileStatus::AlreadyStopped,
                    msg,
                ))
            }
        }
    }

    fn stop(
        &self,
        spec: &ProcessSpec,
        record: &ProcessRecord,
        live: &LiveProcess,
        pid_file: Option<&Path>,
    ) -> ReconcileResult {
        if self.check_mode {
            return Ok(ReconciliationResult::new(
                true,
                ReconcileStatus::Stopped,
                format!("Would stop PID {}", record.pid),
            ));
        }

        let report = self
            .terminator()
            .terminate(record, pid_file, spec.stop_timeout, spec.kill_tree)
            .map_err(|err| InvocationFailure::new(err).changed(true))?;

        if self.probe.is_alive(record.pid, Some(live.start_time)) {
            return Err(InvocationFailure::new(ProcessError::TerminationFailed {
                pid: record.pid,
                reason: "process still present after termination".into(),
            })
            .changed(true));
        }

        let msg = if report.pids.len() > 1 {
            format!("Process {} and its children stopped", record.pid)
        } else {
            format!("Process {} stopped", record.pid)
        };
        info!("{}", msg);
        Ok(ReconciliationResult::new(true, ReconcileStatus::Stopped, msg))
    }

    fn stop_all(&self, spec: &ProcessSpec, matches: &[LiveProcess]) -> ReconcileResult {
        let mut stopped = Vec::with_capacity(matches.len());
        for live in matches {
            let record = ProcessRecord {
                pid: live.pid,
                start_time: Some(live.start_time),
                signature: None,
                status: live.state,
                launched_at: None,
            };
            match self.stop(spec, &record, live, None) {
                Ok(_) => stopped.push(live.pid.to_string()),
                Err(failure) => return Err(failure.changed(true)),
            }
        }

        let verb = if self.check_mode { "Would stop" } else { "Stopped" };
        Ok(ReconciliationResult::new(
            true,
            ReconcileStatus::Stopped,
            format!("{} PID(s) {}", verb, stopped.join(", ")),
        ))
    }

    fn lock(&self, path: &Path) -> Result<Option<PidFileLock>, InvocationFailure> {
        if self.check_mode {
            return Ok(None);
        }
        Ok(Some(self.store.lock(path)?))
    }

    fn command_lock(&self, spec: &ProcessSpec) -> Result<Option<PidFileLock>, InvocationFailure> {
        if self.check_mode {
            return Ok(None);
        }
        Ok(Some(self.store.command_lock(&spec.argv)?))
    }

    /// Corrupt records are treated as stale rather than failing the run.
    fn read_record(&self, path: &Path) -> Result<Option<ProcessRecord>, InvocationFailure> {
        match self.store.read(path) {
            Ok(record) => Ok(record),
            Err(err @ ProcessError::CorruptRecord { .. }) => {
                warn!("{}; treating it as stale", err);
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    fn discard(&self, path: &Path) {
        if let Err(err) = self.store.delete(path) {
            warn!("Unable to remove stale PID file: {}", err);
        }
    }
}

fn already_running(pid: u32) -> ReconciliationResult {
    ReconciliationResult::new(
        false,
        ReconcileStatus::AlreadyRunning,
        format!("Process already running with PID {pid}"),
    )
    .with_pid(pid)
}

fn unexpected_detach(record: &ProcessRecord) -> InvocationFailure {
    InvocationFailure::new(ProcessError::launch_failed(
        format!("PID {}", record.pid),
        "one-shot launch detached unexpectedly",
    ))
    .changed(true)
}

#[cfg(test)]
mod tests {
    use std::{fs, time::Duration};

    use super::*;

    fn background(argv: &[&str], pid_file: &Path) -> ProcessSpec {
        let mut spec = ProcessSpec::new(argv.iter().copied());
        spec.background = true;
        spec.pid_file = Some(pid_file.to_path_buf());
        spec.stop_timeout = Duration::from_secs(5);
        spec
    }

    #[test]
    fn check_mode_touches_nothing() {
        let temp = tempfile::tempdir().unwrap();
        let pid_file = temp.path().join("svc.pid");
        let reconciler = Reconciler::new(CancelToken::new()).check_mode(true);

        let result = reconciler.reconcile(&background(&["sleep", "9999"], &pid_file)).unwrap();
        assert!(result.changed);
        assert_eq!(result.status, ReconcileStatus::Started);
        assert_eq!(result.pid, None);
        assert!(!pid_file.exists());
        assert!(!PidFileStore::lock_path(&pid_file).exists());
    }

    #[test]
    fn absent_cleans_up_corrupt_record_without_change() {
        let temp = tempfile::tempdir().unwrap();
        let pid_file = temp.path().join("svc.pid");
        fs::write(&pid_file, "garbage").unwrap();

        let mut spec = background(&["sleep", "9999"], &pid_file);
        spec.state = DesiredState::Absent;
        let result = Reconciler::new(CancelToken::new()).reconcile(&spec).unwrap();

        assert!(!result.changed);
        assert_eq!(result.status, ReconcileStatus::AlreadyStopped);
        assert!(!pid_file.exists());
    }

    #[test]
    fn present_over_corrupt_record_launches() {
        let temp = tempfile::tempdir().unwrap();
        let pid_file = temp.path().join("svc.pid");
        fs::write(&pid_file, "{ truncated").unwrap();

        let spec = background(&["sleep", "9999"], &pid_file);
        let reconciler = Reconciler::new(CancelToken::new());
        let result = reconciler.reconcile(&spec).unwrap();
        assert!(result.changed);
        assert_eq!(result.status, ReconcileStatus::Started);

        let record = PidFileStore::new().read(&pid_file).unwrap().unwrap();
        assert_eq!(Some(record.pid), result.pid);

        let mut stop = spec.clone();
        stop.state = DesiredState::Absent;
        assert_eq!(reconciler.reconcile(&stop).unwrap().status, ReconcileStatus::Stopped);
    }

    #[test]
    fn one_shot_ignores_pid_file() {
        let temp = tempfile::tempdir().unwrap();
        let pid_file = temp.path().join("once.pid");
        let mut spec = ProcessSpec::new(["true"]);
        spec.pid_file = Some(pid_file.clone());

        let result = Reconciler::new(CancelToken::new()).reconcile(&spec).unwrap();
        assert_eq!(result.status, ReconcileStatus::Completed);
        assert_eq!(result.rc, Some(0));
        assert!(!pid_file.exists());
    }

    #[test]
    fn invalid_spec_fails_before_any_action() {
        let failure = Reconciler::new(CancelToken::new())
            .reconcile(&ProcessSpec::new(Vec::<String>::new()))
            .unwrap_err();
        assert_eq!(failure.error.kind(), "invalid-spec");
        assert!(!failure.changed);
    }

    #[test]
    fn failed_background_launch_leaves_no_record() {
        let temp = tempfile::tempdir().unwrap();
        let pid_file = temp.path().join("missing.pid");
        let spec = background(&["procward-no-such-binary-xyz"], &pid_file);

        let failure = Reconciler::new(CancelToken::new()).reconcile(&spec).unwrap_err();
        assert_eq!(failure.error.kind(), "launch-failed");
        assert!(!failure.changed);
        assert!(!pid_file.exists());
    }
}
