//! Read-only inspection of running processes.
//!
//! The probe answers one question for the reconciler: does this PID file (or
//! this command) correspond to a live process that we launched? It never
//! signals or mutates anything.

use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    fs::File,
    io::Read,
    path::{Path, PathBuf},
};

use procward_models::{CommandSignature, ProcessRecord, ProcessSpec, ProcessState};

use crate::os::ProcFs;

/// A process as the kernel currently reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveProcess {
    pub pid: u32,
    pub ppid: u32,
    pub state: ProcessState,
    pub start_time: u64,
    pub exe: Option<PathBuf>,
    pub argv: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeResult {
    Absent,
    Running(LiveProcess),
    /// The PID is alive but belongs to something else.
    Stale { live: LiveProcess, reason: String },
}

impl ProbeResult {
    pub fn is_running(&self) -> bool {
        matches!(self, ProbeResult::Running(_))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeResult::Absent => "absent",
            ProbeResult::Running(_) => "running",
            ProbeResult::Stale { .. } => "stale",
        }
    }
}

/// The command a reconciliation expects to find running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectedCommand {
    pub argv: Vec<String>,
    /// Canonical path of the program, when it can be resolved.
    pub exe: Option<PathBuf>,
    /// The program is a `#!` script, so the kernel shows its interpreter
    /// as the executable and prepends it to argv.
    pub script: bool,
}

impl ExpectedCommand {
    pub fn new(argv: Vec<String>, exe: Option<PathBuf>) -> Self {
        let script = exe.as_deref().is_some_and(is_script);
        Self { argv, exe, script }
    }

    pub fn from_spec(spec: &ProcessSpec) -> Self {
        Self::new(
            spec.argv.clone(),
            resolve_program(spec.program(), spec.working_dir.as_deref()),
        )
    }

    /// Whether `live` is our script running under its interpreter:
    /// `[interpreter, (interpreter args), script, args...]`.
    fn matches_interpreted(&self, live: &LiveProcess) -> bool {
        if !self.script {
            return false;
        }
        let (Some(live_argv), Some((program, args))) = (&live.argv, self.argv.split_first()) else {
            return false;
        };
        if live_argv.len() <= self.argv.len() {
            return false;
        }
        let split = live_argv.len() - self.argv.len();
        if live_argv[split + 1..] != *args {
            return false;
        }
        let token = &live_argv[split];
        token == program
            || Path::new(token).canonicalize().ok().as_deref() == self.exe.as_deref()
    }

    fn program_name(&self) -> Option<&str> {
        let program = self.argv.first()?;
        Path::new(program).file_name()?.to_str()
    }
}

/// Resolves a program the way exec would: relative to the working directory
/// when it contains a slash, otherwise through `PATH`.
pub fn resolve_program(program: &str, working_dir: Option<&Path>) -> Option<PathBuf> {
    let candidate = if program.contains('/') {
        let raw = Path::new(program);
        match working_dir {
            Some(dir) if raw.is_relative() => dir.join(raw),
            _ => raw.to_path_buf(),
        }
    } else {
        which::which(program).ok()?
    };
    candidate.canonicalize().ok()
}

fn is_script(path: &Path) -> bool {
    let mut magic = [0u8; 2];
    File::open(path)
        .and_then(|mut file| file.read_exact(&mut magic))
        .is_ok_and(|_| magic == *b"#!")
}

#[derive(Debug, Clone, Default)]
pub struct ProcessProbe {
    procfs: ProcFs,
}

impl ProcessProbe {
    pub fn new(procfs: ProcFs) -> Self {
        Self { procfs }
    }

    pub fn procfs(&self) -> &ProcFs {
        &self.procfs
    }

    /// Snapshot of an active process; `None` for missing PIDs and zombies.
    pub fn inspect(&self, pid: u32) -> Option<LiveProcess> {
        let stat = self.procfs.stat(pid)?;
        if !stat.state.is_active() {
            return None;
        }
        Some(LiveProcess {
            pid,
            ppid: stat.ppid,
            state: stat.state,
            start_time: stat.start_time,
            exe: self.procfs.exe(pid),
            argv: self.procfs.cmdline(pid),
        })
    }

    /// True while `pid` is active and, if given, still has the same start token.
    pub fn is_alive(&self, pid: u32, start_time: Option<u64>) -> bool {
        match self.procfs.stat(pid) {
            Some(stat) => {
                stat.state.is_active() && start_time.is_none_or(|expected| expected == stat.start_time)
            }
            None => false,
        }
    }

    pub fn probe(&self, record: Option<&ProcessRecord>, expected: &ExpectedCommand) -> ProbeResult {
        let Some(record) = record else {
            return ProbeResult::Absent;
        };
        let Some(live) = self.inspect(record.pid) else {
            return ProbeResult::Absent;
        };

        if let Some(start_time) = record.start_time {
            if start_time != live.start_time {
                return ProbeResult::Stale {
                    reason: format!(
                        "PID {} was reused (start token {} != {})",
                        record.pid, live.start_time, start_time
                    ),
                    live,
                };
            }
        }

        let verdict = match &record.signature {
            Some(signature) => check_recorded(&live, signature, expected),
            None => check_expected(&live, expected),
        };

        match verdict {
            Ok(()) => ProbeResult::Running(live),
            Err(reason) => ProbeResult::Stale { live, reason },
        }
    }

    /// Active processes whose executable and arguments match `expected`.
    pub fn find_matching(&self, expected: &ExpectedCommand) -> Vec<LiveProcess> {
        let me = std::process::id();
        self.procfs
            .pids()
            .into_iter()
            .filter(|pid| *pid != me)
            .filter_map(|pid| self.inspect(pid))
            .filter(|live| {
                let exact = live.argv.as_deref() == Some(expected.argv.as_slice())
                    && match (&live.exe, &expected.exe) {
                        (Some(actual), Some(wanted)) => actual == wanted,
                        _ => true,
                    };
                exact || expected.matches_interpreted(live)
            })
            .collect()
    }

    /// Every active descendant of `pid`, oldest first.
    pub fn descendants(&self, pid: u32) -> Vec<LiveProcess> {
        let mut children: BTreeMap<u32, Vec<u32>> = BTreeMap::new();
        for candidate in self.procfs.pids() {
            if let Some(stat) = self.procfs.stat(candidate) {
                if stat.state.is_active() {
                    children.entry(stat.ppid).or_default().push(candidate);
                }
            }
        }

        let mut visited = BTreeSet::from([pid]);
        let mut found = Vec::new();
        let mut queue = VecDeque::from([pid]);
        while let Some(parent) = queue.pop_front() {
            for child in children.get(&parent).into_iter().flatten() {
                if !visited.insert(*child) {
                    continue;
                }
                if let Some(live) = self.inspect(*child) {
                    found.push(live);
                    queue.push_back(*child);
                }
            }
        }

        found.sort_by_key(|live| (live.start_time, live.pid));
        found
    }
}

fn check_recorded(
    live: &LiveProcess,
    signature: &CommandSignature,
    expected: &ExpectedCommand,
) -> Result<(), String> {
    if signature.argv != expected.argv {
        return Err(format!(
            "record was written for '{}', not '{}'",
            signature.argv.join(" "),
            expected.argv.join(" ")
        ));
    }

    match (&live.exe, &live.argv) {
        (Some(exe), _) if *exe == signature.exe => Ok(()),
        (Some(exe), _) => Err(format!(
            "PID {} runs {}, expected {}",
            live.pid,
            exe.display(),
            signature.exe.display()
        )),
        (None, Some(argv)) if *argv == signature.argv => Ok(()),
        _ => Err(format!("unable to verify the identity of PID {}", live.pid)),
    }
}

// Bare PID files carry no signature, so compare against the program we would
// launch.
fn check_expected(live: &LiveProcess, expected: &ExpectedCommand) -> Result<(), String> {
    if expected.matches_interpreted(live) {
        return Ok(());
    }
    if let (Some(actual), Some(wanted)) = (&live.exe, &expected.exe) {
        return if actual == wanted {
            Ok(())
        } else {
            Err(format!(
                "PID {} runs {}, expected {}",
                live.pid,
                actual.display(),
                wanted.display()
            ))
        };
    }

    let live_name = live
        .argv
        .as_ref()
        .and_then(|argv| argv.first())
        .and_then(|program| Path::new(program).file_name())
        .and_then(|name| name.to_str());
    match (live_name, expected.program_name()) {
        (Some(actual), Some(wanted)) if actual == wanted => Ok(()),
        _ => Err(format!("unable to verify the identity of PID {}", live.pid)),
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    /// Builds a fake procfs entry.
    fn fake_process(root: &Path, pid: u32, ppid: u32, state: char, start: u64, exe: &str, argv: &[&str]) {
        let dir = root.join(pid.to_string());
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("stat"),
            format!(
                "{pid} (fake) {state} {ppid} {pid} {pid} 0 -1 0 0 0 0 0 0 0 0 0 20 0 1 0 {start} 0 0"
            ),
        )
        .unwrap();
        std::os::unix::fs::symlink(exe, dir.join("exe")).unwrap();
        let mut cmdline = argv.join("\0");
        cmdline.push('\0');
        fs::write(dir.join("cmdline"), cmdline).unwrap();
    }

    fn expected(argv: &[&str], exe: &str) -> ExpectedCommand {
        ExpectedCommand::new(
            argv.iter().map(|s| s.to_string()).collect(),
            Some(PathBuf::from(exe)),
        )
    }

    fn write_script(dir: &Path) -> PathBuf {
        let script = dir.join("backup.sh");
        fs::write(&script, "#!/bin/sh\nsleep 30\n").unwrap();
        script.canonicalize().unwrap()
    }

    fn record(pid: u32, start: Option<u64>, exe: &str, argv: &[&str]) -> ProcessRecord {
        ProcessRecord {
            pid,
            start_time: start,
            signature: Some(CommandSignature {
                exe: PathBuf::from(exe),
                argv: argv.iter().map(|s| s.to_string()).collect(),
            }),
            status: ProcessState::Sleeping,
            launched_at: None,
        }
    }

    #[test]
    fn missing_record_is_absent() {
        let probe = ProcessProbe::default();
        let wanted = expected(&["sleep", "5"], "/usr/bin/sleep");
        assert_eq!(probe.probe(None, &wanted), ProbeResult::Absent);
    }

    #[test]
    fn matching_record_is_running() {
        let temp = tempfile::tempdir().unwrap();
        fake_process(temp.path(), 100, 1, 'S', 5000, "/usr/bin/sleep", &["sleep", "9999"]);
        let probe = ProcessProbe::new(ProcFs::at(temp.path()));
        let wanted = expected(&["sleep", "9999"], "/usr/bin/sleep");

        let rec = record(100, Some(5000), "/usr/bin/sleep", &["sleep", "9999"]);
        assert!(probe.probe(Some(&rec), &wanted).is_running());
    }

    #[test]
    fn zombie_is_absent() {
        let temp = tempfile::tempdir().unwrap();
        fake_process(temp.path(), 100, 1, 'Z', 5000, "/usr/bin/sleep", &["sleep", "9999"]);
        let probe = ProcessProbe::new(ProcFs::at(temp.path()));
        let wanted = expected(&["sleep", "9999"], "/usr/bin/sleep");

        let rec = record(100, Some(5000), "/usr/bin/sleep", &["sleep", "9999"]);
        assert_eq!(probe.probe(Some(&rec), &wanted), ProbeResult::Absent);
        assert!(!probe.is_alive(100, None));
    }

    #[test]
    fn reused_pid_is_stale() {
        let temp = tempfile::tempdir().unwrap();
        fake_process(temp.path(), 100, 1, 'S', 7777, "/usr/bin/sleep", &["sleep", "9999"]);
        let probe = ProcessProbe::new(ProcFs::at(temp.path()));
        let wanted = expected(&["sleep", "9999"], "/usr/bin/sleep");

        let rec = record(100, Some(5000), "/usr/bin/sleep", &["sleep", "9999"]);
        assert!(matches!(probe.probe(Some(&rec), &wanted), ProbeResult::Stale { .. }));
    }

    #[test]
    fn different_executable_is_stale() {
        let temp = tempfile::tempdir().unwrap();
        fake_process(temp.path(), 100, 1, 'S', 5000, "/usr/sbin/sshd", &["sshd"]);
        let probe = ProcessProbe::new(ProcFs::at(temp.path()));
        let wanted = expected(&["sleep", "9999"], "/usr/bin/sleep");

        let rec = record(100, Some(5000), "/usr/bin/sleep", &["sleep", "9999"]);
        assert!(matches!(probe.probe(Some(&rec), &wanted), ProbeResult::Stale { .. }));
    }

    #[test]
    fn record_for_another_command_is_stale() {
        let temp = tempfile::tempdir().unwrap();
        fake_process(temp.path(), 100, 1, 'S', 5000, "/usr/bin/sleep", &["sleep", "10"]);
        let probe = ProcessProbe::new(ProcFs::at(temp.path()));
        let wanted = expected(&["sleep", "9999"], "/usr/bin/sleep");

        let rec = record(100, Some(5000), "/usr/bin/sleep", &["sleep", "10"]);
        assert!(matches!(probe.probe(Some(&rec), &wanted), ProbeResult::Stale { .. }));
    }

    #[test]
    fn legacy_record_compares_executable() {
        let temp = tempfile::tempdir().unwrap();
        fake_process(temp.path(), 100, 1, 'S', 5000, "/usr/sbin/nginx", &["nginx: master process"]);
        fake_process(temp.path(), 101, 1, 'S', 5001, "/usr/sbin/sshd", &["sshd"]);
        let probe = ProcessProbe::new(ProcFs::at(temp.path()));
        let wanted = expected(&["nginx"], "/usr/sbin/nginx");

        assert!(probe.probe(Some(&ProcessRecord::legacy(100)), &wanted).is_running());
        assert!(!probe.probe(Some(&ProcessRecord::legacy(101)), &wanted).is_running());
    }

    #[test]
    fn finds_matching_processes_by_signature() {
        let temp = tempfile::tempdir().unwrap();
        fake_process(temp.path(), 900100, 1, 'S', 5000, "/usr/bin/sleep", &["sleep", "9999"]);
        fake_process(temp.path(), 900101, 1, 'S', 5001, "/usr/bin/sleep", &["sleep", "10"]);
        fake_process(temp.path(), 900102, 1, 'Z', 5002, "/usr/bin/sleep", &["sleep", "9999"]);
        let probe = ProcessProbe::new(ProcFs::at(temp.path()));

        let found = probe.find_matching(&expected(&["sleep", "9999"], "/usr/bin/sleep"));
        let pids: Vec<u32> = found.iter().map(|p| p.pid).collect();
        assert_eq!(pids, vec![900100]);
    }

    #[test]
    fn scripts_are_found_under_their_interpreter() {
        let temp = tempfile::tempdir().unwrap();
        let script = write_script(temp.path());
        let script_str = script.to_str().unwrap();
        let procfs = temp.path().join("proc");
        fake_process(&procfs, 900200, 1, 'S', 5000, "/usr/bin/dash", &["/bin/sh", script_str, "--full"]);
        fake_process(&procfs, 900201, 1, 'S', 5001, "/usr/bin/dash", &["/bin/sh", script_str, "--quick"]);
        let probe = ProcessProbe::new(ProcFs::at(&procfs));

        let wanted = ExpectedCommand::new(
            vec![script_str.to_string(), "--full".to_string()],
            Some(script.clone()),
        );
        assert!(wanted.script);
        let pids: Vec<u32> = probe.find_matching(&wanted).iter().map(|p| p.pid).collect();
        assert_eq!(pids, vec![900200]);

        assert!(probe.probe(Some(&ProcessRecord::legacy(900200)), &wanted).is_running());
        assert!(!probe.probe(Some(&ProcessRecord::legacy(900201)), &wanted).is_running());
    }

    #[test]
    fn binaries_never_match_an_interpreter_form() {
        let temp = tempfile::tempdir().unwrap();
        fake_process(temp.path(), 100, 1, 'S', 5000, "/usr/bin/dash", &["sh", "sleep", "10"]);
        let probe = ProcessProbe::new(ProcFs::at(temp.path()));

        let wanted = expected(&["sleep", "10"], "/usr/bin/sleep");
        assert!(!wanted.script);
        assert!(probe.find_matching(&wanted).is_empty());
        assert!(!probe.probe(Some(&ProcessRecord::legacy(100)), &wanted).is_running());
    }

    #[test]
    fn descendants_are_ordered_oldest_first() {
        let temp = tempfile::tempdir().unwrap();
        fake_process(temp.path(), 10, 1, 'S', 100, "/bin/sh", &["sh"]);
        fake_process(temp.path(), 30, 10, 'S', 300, "/bin/sh", &["sh"]);
        fake_process(temp.path(), 20, 10, 'S', 200, "/bin/sh", &["sh"]);
        fake_process(temp.path(), 40, 30, 'S', 150, "/bin/sh", &["sh"]);
        fake_process(temp.path(), 50, 1, 'S', 50, "/bin/sh", &["sh"]);
        let probe = ProcessProbe::new(ProcFs::at(temp.path()));

        let pids: Vec<u32> = probe.descendants(10).iter().map(|p| p.pid).collect();
        assert_eq!(pids, vec![40, 20, 30]);
    }

    #[test]
    fn resolves_relative_programs_against_working_dir() {
        let temp = tempfile::tempdir().unwrap();
        let script = temp.path().join("run.sh");
        fs::write(&script, "#!/bin/sh\n").unwrap();

        let resolved = resolve_program("./run.sh", Some(temp.path())).unwrap();
        assert_eq!(resolved, script.canonicalize().unwrap());
        assert!(resolve_program("definitely-not-a-real-program-xyz", None).is_none());
    }
}
