//! Starting processes: one-shot runs with captured output, and detached
//! background processes recorded in a PID file.

use std::{
    fs::{self, OpenOptions},
    io::{self, Read},
    os::unix::process::{CommandExt, ExitStatusExt},
    path::{Path, PathBuf},
    process::{Child, ChildStderr, ChildStdout, Command, ExitStatus, Stdio},
    sync::{Arc, Mutex, PoisonError, mpsc},
    thread,
    time::{Duration, Instant},
};

use chrono::Utc;
use log::{debug, info, warn};
use nix::sys::signal::Signal;
use procward_models::{
    CapturedOutput, CommandSignature, InvocationFailure, ProcessError, ProcessRecord, ProcessSpec,
    ProcessState,
};
use wait_timeout::ChildExt;

use crate::{
    cancel::CancelToken,
    os::signal_group,
    pidfile::PidFileStore,
    probe::{ProcessProbe, resolve_program},
};

/// How often a one-shot wait checks for cancellation.
const WAIT_SLICE: Duration = Duration::from_millis(100);

/// How long to wait for pipe readers once the child is gone.
const OUTPUT_COLLECTION_TIMEOUT: Duration = Duration::from_secs(5);

/// Cap on captured output per stream (10MB).
const MAX_OUTPUT_SIZE: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchOutcome {
    /// A one-shot process ran to completion.
    Completed { rc: i32, output: CapturedOutput },
    /// A background process was started and left running.
    Detached(ProcessRecord),
}

pub struct Launcher<'a> {
    store: &'a PidFileStore,
    probe: &'a ProcessProbe,
    cancel: CancelToken,
}

impl<'a> Launcher<'a> {
    pub fn new(store: &'a PidFileStore, probe: &'a ProcessProbe, cancel: CancelToken) -> Self {
        Self {
            store,
            probe,
            cancel,
        }
    }

    pub fn launch(&self, spec: &ProcessSpec) -> Result<LaunchOutcome, InvocationFailure> {
        spec.validate()?;
        let command = build_command(spec)?;
        if spec.background {
            self.spawn_background(spec, command).map(LaunchOutcome::Detached)
        } else {
            self.run_one_shot(spec, command)
        }
    }

    fn run_one_shot(
        &self,
        spec: &ProcessSpec,
        mut command: Command,
    ) -> Result<LaunchOutcome, InvocationFailure> {
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);

        let mut child = command
            .spawn()
            .map_err(|err| spawn_error(spec, err))?;
        let pid = child.id();
        info!("Started '{}' (PID {})", spec.display_command(), pid);

        let capture = OutputCapture::attach(&mut child);
        // A timeout past the end of the clock means no deadline at all.
        let deadline = Instant::now().checked_add(spec.timeout);

        let status = loop {
            if self.cancel.is_cancelled() {
                warn!("Interrupted, killing process group {}", pid);
                reap_group(&mut child);
                return Err(InvocationFailure::new(ProcessError::Interrupted { pid })
                    .changed(true)
                    .with_output(capture.collect()));
            }

            let now = Instant::now();
            if deadline.is_some_and(|deadline| now >= deadline) {
                warn!(
                    "'{}' exceeded its {}s timeout, killing process group {}",
                    spec.display_command(),
                    spec.timeout.as_secs(),
                    pid
                );
                reap_group(&mut child);
                return Err(InvocationFailure::new(ProcessError::TimedOut {
                    timeout_secs: spec.timeout.as_secs(),
                })
                .changed(true)
                .with_output(capture.collect()));
            }

            let slice = deadline.map_or(WAIT_SLICE, |deadline| WAIT_SLICE.min(deadline - now));
            match child.wait_timeout(slice) {
                Ok(Some(status)) => break status,
                Ok(None) => continue,
                Err(err) => {
                    reap_group(&mut child);
                    return Err(InvocationFailure::new(ProcessError::launch_failed(
                        spec.display_command(),
                        format!("failed to wait for PID {pid}: {err}"),
                    ))
                    .changed(true)
                    .with_output(capture.collect()));
                }
            }
        };

        let rc = exit_code(status);
        debug!("PID {} exited with {}", pid, rc);
        Ok(LaunchOutcome::Completed {
            rc,
            output: capture.collect(),
        })
    }

    fn spawn_background(
        &self,
        spec: &ProcessSpec,
        mut command: Command,
    ) -> Result<ProcessRecord, InvocationFailure> {
        let (stdout, stderr) = background_output(spec.log_file.as_deref())?;
        command.stdin(Stdio::null()).stdout(stdout).stderr(stderr);
        // SAFETY: setsid is async-signal-safe and touches no parent state.
        unsafe {
            command.pre_exec(|| {
                nix::unistd::setsid()
                    .map(|_| ())
                    .map_err(io::Error::from)
            });
        }

        let child = command
            .spawn()
            .map_err(|err| spawn_error(spec, err))?;
        let pid = child.id();
        // The child lives in its own session and must outlive us.
        drop(child);

        let record = self.describe(spec, pid);
        info!(
            "Started background process '{}' (PID {})",
            spec.display_command(),
            pid
        );

        if let Some(path) = &spec.pid_file {
            if let Err(err) = self.store.write(path, &record) {
                // A record we cannot persist is a process we cannot manage.
                warn!("Killing PID {} after failing to record it: {}", pid, err);
                signal_group(pid, Signal::SIGKILL);
                return Err(InvocationFailure::new(err));
            }
        }

        Ok(record)
    }

    /// Builds the record for a freshly spawned child from the kernel's view.
    fn describe(&self, spec: &ProcessSpec, pid: u32) -> ProcessRecord {
        let procfs = self.probe.procfs();
        let stat = procfs.stat(pid);
        let exe = procfs
            .exe(pid)
            .or_else(|| resolve_program(spec.program(), spec.working_dir.as_deref()))
            .unwrap_or_else(|| PathBuf::from(spec.program()));

        ProcessRecord {
            pid,
            start_time: stat.map(|s| s.start_time),
            signature: Some(CommandSignature {
                exe,
                argv: spec.argv.clone(),
            }),
            status: stat.map_or(ProcessState::Unknown, |s| s.state),
            launched_at: Some(Utc::now()),
        }
    }
}

fn build_command(spec: &ProcessSpec) -> Result<Command, ProcessError> {
    let mut command = Command::new(spec.program());
    command.args(&spec.argv[1..]);

    if !spec.inherit_env {
        command.env_clear();
    }
    command.envs(&spec.environment);

    if let Some(dir) = &spec.working_dir {
        check_working_dir(dir)?;
        command.current_dir(dir);
    }

    Ok(command)
}

pub fn check_working_dir(dir: &Path) -> Result<(), ProcessError> {
    let invalid = |reason: &str| ProcessError::WorkingDirInvalid {
        path: dir.to_path_buf(),
        reason: reason.to_string(),
    };
    match fs::metadata(dir) {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => Err(invalid("not a directory")),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Err(invalid("does not exist")),
        Err(err) => Err(invalid(&err.to_string())),
    }
}

fn background_output(log_file: Option<&Path>) -> Result<(Stdio, Stdio), ProcessError> {
    let Some(path) = log_file else {
        return Ok((Stdio::null(), Stdio::null()));
    };
    let open_error = |err: io::Error| {
        ProcessError::launch_failed(path.display().to_string(), format!("cannot open log file: {err}"))
    };
    let stdout = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(open_error)?;
    let stderr = stdout.try_clone().map_err(open_error)?;
    Ok((Stdio::from(stdout), Stdio::from(stderr)))
}

fn spawn_error(spec: &ProcessSpec, err: io::Error) -> ProcessError {
    let reason = match err.kind() {
        io::ErrorKind::NotFound => format!("executable '{}' not found", spec.program()),
        io::ErrorKind::PermissionDenied => {
            format!("permission denied executing '{}'", spec.program())
        }
        _ => err.to_string(),
    };
    ProcessError::launch_failed(spec.display_command(), reason)
}

/// Kills the child's whole process group and reaps the leader.
fn reap_group(child: &mut Child) {
    signal_group(child.id(), Signal::SIGKILL);
    if let Err(err) = child.kill() {
        debug!("Kill of PID {} reported: {}", child.id(), err);
    }
    if let Err(err) = child.wait() {
        warn!("Failed to reap PID {}: {}", child.id(), err);
    }
}

/// Exit code, or the shell convention `128 + signal` for signal deaths.
pub fn exit_code(status: ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => -1,
    }
}

/// Drains stdout and stderr on background threads so a chatty child never
/// blocks on a full pipe. Partial output stays available after a timeout.
struct OutputCapture {
    stdout: Arc<Mutex<Vec<u8>>>,
    stderr: Arc<Mutex<Vec<u8>>>,
    done: mpsc::Receiver<()>,
    readers: usize,
}

impl OutputCapture {
    fn attach(child: &mut Child) -> Self {
        let (tx, done) = mpsc::channel();
        let stdout = Arc::new(Mutex::new(Vec::new()));
        let stderr = Arc::new(Mutex::new(Vec::new()));
        let mut readers = 0;

        if let Some(pipe) = child.stdout.take() {
            spawn_reader::<ChildStdout>(pipe, Arc::clone(&stdout), tx.clone());
            readers += 1;
        }
        if let Some(pipe) = child.stderr.take() {
            spawn_reader::<ChildStderr>(pipe, Arc::clone(&stderr), tx);
            readers += 1;
        }

        Self {
            stdout,
            stderr,
            done,
            readers,
        }
    }

    fn collect(self) -> CapturedOutput {
        let deadline = Instant::now() + OUTPUT_COLLECTION_TIMEOUT;
        for _ in 0..self.readers {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if self.done.recv_timeout(remaining).is_err() {
                warn!("Output pipes still open after the process exited, returning partial output");
                break;
            }
        }
        CapturedOutput {
            stdout: snapshot(&self.stdout),
            stderr: snapshot(&self.stderr),
        }
    }
}

fn spawn_reader<R: Read + Send + 'static>(
    mut pipe: R,
    sink: Arc<Mutex<Vec<u8>>>,
    done: mpsc::Sender<()>,
) {
    thread::spawn(move || {
        let mut chunk = [0u8; 8192];
        loop {
            match pipe.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    let mut buf = sink.lock().unwrap_or_else(PoisonError::into_inner);
                    let room = MAX_OUTPUT_SIZE.saturating_sub(buf.len());
                    buf.extend_from_slice(&chunk[..n.min(room)]);
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
        let _ = done.send(());
    });
}

fn snapshot(buf: &Mutex<Vec<u8>>) -> String {
    let bytes = buf.lock().unwrap_or_else(PoisonError::into_inner);
    String::from_utf8_lossy(&bytes).into_owned()
}
