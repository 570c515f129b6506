use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use procward_models::DesiredState;

use crate::config::{CommandParam, ModuleParams};

#[derive(Debug, Parser)]
#[command(
    name = "procward",
    about = "Start, stop, and reconcile Linux processes against a desired state"
)]
pub struct Cli {
    /// Increase diagnostic output on stderr (-v info, -vv debug).
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Also append diagnostics to this file.
    #[arg(long, global = true)]
    pub log_path: Option<PathBuf>,

    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Json)]
    pub format: OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Reconcile a process described by flags.
    Apply(ApplyArgs),
    /// Reconcile a process described by a JSON parameter file.
    ApplyFile {
        path: PathBuf,
    },
    /// Show what a PID file points at.
    Probe {
        #[arg(long)]
        pid_file: PathBuf,
        /// Command the PID file is expected to track.
        #[arg(long)]
        command: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StateArg {
    Present,
    Absent,
}

impl From<StateArg> for DesiredState {
    fn from(value: StateArg) -> Self {
        match value {
            StateArg::Present => DesiredState::Present,
            StateArg::Absent => DesiredState::Absent,
        }
    }
}

#[derive(Debug, Args)]
pub struct ApplyArgs {
    /// Command line to run, split with POSIX shell quoting rules.
    #[arg(long)]
    pub command: String,

    #[arg(long, value_enum, default_value_t = StateArg::Present)]
    pub state: StateArg,

    /// Detach the process and track it instead of waiting for it.
    #[arg(long, default_value_t = false)]
    pub background: bool,

    /// Seconds a one-shot process may run.
    #[arg(long, default_value_t = 300, allow_negative_numbers = true)]
    pub timeout: i64,

    #[arg(long)]
    pub pid_file: Option<PathBuf>,

    #[arg(long)]
    pub working_dir: Option<PathBuf>,

    /// Environment override, repeatable.
    #[arg(short = 'e', long = "env", value_name = "NAME=VALUE", value_parser = parse_env_pair)]
    pub environment: Vec<(String, String)>,

    /// Start from an empty environment instead of inheriting ours.
    #[arg(long, default_value_t = false)]
    pub clean_env: bool,

    /// Seconds to wait after SIGTERM before SIGKILL.
    #[arg(long, default_value_t = 10, allow_negative_numbers = true)]
    pub stop_timeout: i64,

    /// Only signal the tracked PID, not its descendants.
    #[arg(long, default_value_t = false)]
    pub no_kill_tree: bool,

    /// File receiving a background process's stdout and stderr.
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// Report what would change without doing it.
    #[arg(long, default_value_t = false)]
    pub check: bool,
}

impl ApplyArgs {
    pub fn into_params(self) -> ModuleParams {
        ModuleParams {
            command: Some(CommandParam::Line(self.command)),
            state: self.state.into(),
            background: self.background,
            timeout: self.timeout,
            pid_file: self.pid_file,
            working_dir: self.working_dir,
            environment: self
                .environment
                .into_iter()
                .map(|(name, value)| (name, serde_json::Value::String(value)))
                .collect(),
            inherit_env: !self.clean_env,
            stop_timeout: self.stop_timeout,
            kill_tree: !self.no_kill_tree,
            log_file: self.log_file,
            check_mode: self.check,
        }
    }
}

fn parse_env_pair(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((name, value)) if !name.is_empty() => Ok((name.to_string(), value.to_string())),
        _ => Err(format!("expected NAME=VALUE, got '{raw}'")),
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn apply_flags_become_params() {
        let cli = Cli::try_parse_from([
            "procward",
            "apply",
            "--command",
            "sleep 9999",
            "--background",
            "--pid-file",
            "/tmp/t.pid",
            "-e",
            "A=1=2",
            "--no-kill-tree",
        ])
        .unwrap();
        let Commands::Apply(args) = cli.command else {
            panic!("expected apply");
        };
        let params = args.into_params();
        assert!(params.background);
        assert!(!params.kill_tree);
        assert_eq!(params.environment["A"], serde_json::Value::String("1=2".into()));

        let spec = params.into_spec().unwrap();
        assert_eq!(spec.argv, vec!["sleep", "9999"]);
        assert_eq!(spec.pid_file, Some(PathBuf::from("/tmp/t.pid")));
    }

    #[test]
    fn env_pairs_need_a_name() {
        assert!(parse_env_pair("=x").is_err());
        assert!(parse_env_pair("novalue").is_err());
        assert_eq!(parse_env_pair("K=").unwrap(), ("K".into(), String::new()));
    }
}
