pub mod errors;
pub mod models;
pub mod outcome;

pub use errors::{ProcessError, Result, SendableError};
pub use models::{CommandSignature, DesiredState, ProcessRecord, ProcessSpec, ProcessState};
pub use outcome::{CapturedOutput, InvocationFailure, ReconcileStatus, ReconciliationResult};
