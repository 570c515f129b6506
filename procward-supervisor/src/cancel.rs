use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use log::warn;

/// Set once the invocation has been asked to stop (SIGINT / SIGTERM).
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Routes SIGINT and SIGTERM into a fresh token. Can only be installed
    /// once per process.
    pub fn from_signals() -> Result<Self, ctrlc::Error> {
        let token = Self::new();
        let handle = token.clone();
        ctrlc::set_handler(move || {
            warn!("Interrupt received, stopping");
            handle.cancel();
        })?;
        Ok(token)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}
