pub mod cancel;
pub mod cli;
pub mod config;
pub mod display;
pub mod launcher;
pub mod os;
pub mod pidfile;
pub mod probe;
pub mod reconciler;
pub mod terminator;

pub use cancel::CancelToken;
pub use pidfile::PidFileStore;
pub use probe::{ExpectedCommand, ProbeResult, ProcessProbe};
pub use reconciler::{ReconcileResult, Reconciler};
