use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;
use serde_json::Value;

use procward_models::{DesiredState, ProcessError, ProcessSpec};

/// Invocation parameters as the automation host hands them over. Loosely
/// typed; [`ModuleParams::into_spec`] turns them into a [`ProcessSpec`].
#[derive(Debug, Clone, Deserialize)]
pub struct ModuleParams {
    pub command: Option<CommandParam>,
    #[serde(default)]
    pub state: DesiredState,
    #[serde(default)]
    pub background: bool,
    #[serde(default = "default_timeout")]
    pub timeout: i64,
    pub pid_file: Option<PathBuf>,
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub environment: BTreeMap<String, Value>,
    #[serde(default = "default_true")]
    pub inherit_env: bool,
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout: i64,
    #[serde(default = "default_true")]
    pub kill_tree: bool,
    pub log_file: Option<PathBuf>,
    #[serde(default, alias = "_ansible_check_mode")]
    pub check_mode: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum CommandParam {
    Line(String),
    Argv(Vec<String>),
}

impl CommandParam {
    pub fn into_argv(self) -> Result<Vec<String>, ProcessError> {
        match self {
            CommandParam::Line(line) => shell_words::split(&line).map_err(|err| {
                ProcessError::InvalidSpec(format!("cannot parse command '{line}': {err}"))
            }),
            CommandParam::Argv(argv) => Ok(argv),
        }
    }
}

impl ModuleParams {
    pub fn into_spec(self) -> Result<ProcessSpec, ProcessError> {
        let argv = self
            .command
            .ok_or_else(|| ProcessError::InvalidSpec("command is required".into()))?
            .into_argv()?;

        let one_shot = !self.background && self.state == DesiredState::Present;
        if one_shot && self.timeout <= 0 {
            return Err(ProcessError::InvalidSpec(format!(
                "timeout must be greater than zero, got {}",
                self.timeout
            )));
        }
        if self.stop_timeout <= 0 {
            return Err(ProcessError::InvalidSpec(format!(
                "stop_timeout must be greater than zero, got {}",
                self.stop_timeout
            )));
        }

        let mut environment = BTreeMap::new();
        for (name, value) in self.environment {
            let value = env_value(&name, value)?;
            environment.insert(name, value);
        }

        let mut spec = ProcessSpec::new(argv);
        spec.state = self.state;
        spec.background = self.background;
        spec.timeout = Duration::from_secs(self.timeout.max(0) as u64);
        spec.pid_file = self.pid_file;
        spec.working_dir = self.working_dir;
        spec.environment = environment;
        spec.inherit_env = self.inherit_env;
        spec.stop_timeout = Duration::from_secs(self.stop_timeout as u64);
        spec.kill_tree = self.kill_tree;
        spec.log_file = self.log_file;
        spec.validate()?;
        Ok(spec)
    }
}

/// Reads a JSON parameter file.
pub fn load_params(path: &Path) -> Result<ModuleParams, ProcessError> {
    let data = fs::read_to_string(path).map_err(|err| {
        ProcessError::InvalidSpec(format!("unable to read {}: {err}", path.display()))
    })?;
    parse_params(&data).map_err(|err| match err {
        ProcessError::InvalidSpec(msg) => {
            ProcessError::InvalidSpec(format!("{} ({})", msg, path.display()))
        }
        other => other,
    })
}

pub fn parse_params(data: &str) -> Result<ModuleParams, ProcessError> {
    serde_json::from_str(data)
        .map_err(|err| ProcessError::InvalidSpec(format!("invalid parameters: {err}")))
}

// Automation hosts hand over YAML scalars, so numbers and booleans are
// accepted and stringified.
fn env_value(name: &str, value: Value) -> Result<String, ProcessError> {
    match value {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(ProcessError::InvalidSpec(format!(
            "environment value for '{name}' must be a scalar, got {other}"
        ))),
    }
}

fn default_true() -> bool {
    true
}

fn default_timeout() -> i64 {
    300
}

fn default_stop_timeout() -> i64 {
    10
}
