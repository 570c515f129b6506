use std::{env, path::PathBuf, time::SystemTime};
use log::{LevelFilter, debug};
use procward_models::errors::SendableError;

/// Where diagnostics go. Stdout is reserved for the invocation result.
#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    pub verbosity: u8,
    pub log_file: Option<PathBuf>,
}

pub fn level_for_verbosity(verbosity: u8) -> LevelFilter {
    match verbosity {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

pub fn setup_logger(options: &LogOptions) -> Result<(), SendableError> {
    let mut dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{} {} {}] {}",
                humantime::format_rfc3339_seconds(SystemTime::now()),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(level_for_verbosity(options.verbosity))
        .chain(std::io::stderr());

    if let Some(path) = &options.log_file {
        dispatch = dispatch.chain(fern::log_file(path)?);
    }

    dispatch.apply()?;
    Ok(())
}

pub fn print_env() -> std::io::Result<()> {
    let path = env::current_dir()?;
    debug!("The current directory is {}", path.display());
    Ok(())
}
