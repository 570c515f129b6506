use std::process::ExitCode;

use clap::Parser;
use log::{debug, warn};

use procward::{
    CancelToken, PidFileStore, ProcessProbe, Reconciler,
    cli::{Cli, Commands, OutputFormat},
    config::{self, CommandParam, ModuleParams},
    display::{ProbeReport, render_failure, render_probe, render_result},
};
use procward_models::{InvocationFailure, ProcessError, SendableError};
use procward_utilities::{logger::LogOptions, startup::startup};

fn main() -> Result<ExitCode, SendableError> {
    let cli = Cli::parse();
    startup(
        "procward",
        &LogOptions {
            verbosity: cli.verbose,
            log_file: cli.log_path.clone(),
        },
    )?;

    let format = cli.format;
    match cli.command {
        Commands::Apply(args) => Ok(apply(Ok(args.into_params()), format)),
        Commands::ApplyFile { path } => Ok(apply(config::load_params(&path), format)),
        Commands::Probe { pid_file, command } => {
            let argv = command
                .map(|line| CommandParam::Line(line).into_argv())
                .transpose()?;
            let report = ProbeReport::collect(
                &PidFileStore::new(),
                &ProcessProbe::default(),
                &pid_file,
                argv,
            )?;
            debug!("{} probes as {}", pid_file.display(), report.verdict);
            println!("{}", render_probe(&report, format));
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn apply(params: Result<ModuleParams, ProcessError>, format: OutputFormat) -> ExitCode {
    let outcome = params
        .and_then(|params| Ok((params.check_mode, params.into_spec()?)))
        .map_err(InvocationFailure::from)
        .and_then(|(check_mode, spec)| {
            let cancel = CancelToken::from_signals().unwrap_or_else(|err| {
                warn!("Unable to install signal handlers: {}", err);
                CancelToken::new()
            });
            Reconciler::new(cancel).check_mode(check_mode).reconcile(&spec)
        });

    match outcome {
        Ok(result) => {
            println!("{}", render_result(&result, format));
            ExitCode::SUCCESS
        }
        Err(failure) => {
            println!("{}", render_failure(&failure, format));
            ExitCode::FAILURE
        }
    }
}
