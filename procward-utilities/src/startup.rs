use log::info;
use procward_models::errors::SendableError;
use crate::logger::{self, LogOptions, print_env};


pub fn startup(name: &str, options: &LogOptions) -> Result<(), SendableError> {
    logger::setup_logger(options)?;
    log_panics::init();

    info!("--- {} ---", name);
    print_env()?;

    Ok(())
}
