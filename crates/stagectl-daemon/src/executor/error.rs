/*
[INPUT]:  Failures inside an operation body (validation, instrument, poll loop)
[OUTPUT]: OperationError, captured by the executor and recorded on the task
[POS]:    Executor layer - error taxonomy of the blocking worker
[UPDATE]: When an operation body gains a new failure mode
*/

use stagectl_instrument::{InstrumentError, StatusCode};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum OperationError {
    /// Parameters broke the operation's contract; nothing was sent to the instrument
    #[error("Validation error: {0}")]
    Validation(String),

    /// The instrument reported a named failure state
    #[error("{context} failed: {code}")]
    Hardware { context: String, code: StatusCode },

    /// Wall-clock budget exhausted; the instrument was told to stop
    #[error("Timeout: {context} did not finish within {:.1}s", .after.as_secs_f64())]
    Timeout { context: String, after: Duration },

    /// Cancellation was observed and honoured
    #[error("Operation cancelled")]
    Cancelled,

    /// The operation finished but produced no usable measurement
    #[error("Measurement error: {0}")]
    Measurement(String),

    #[error("Instrument error: {0}")]
    Instrument(#[from] InstrumentError),

    /// Worker thread panicked or was torn down
    #[error("Worker error: {0}")]
    Worker(String),
}

impl OperationError {
    pub fn validation(message: impl Into<String>) -> Self {
        OperationError::Validation(message.into())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, OperationError::Cancelled)
    }

    /// Structured vendor status, when the failure carries one
    pub fn status_code(&self) -> Option<&StatusCode> {
        match self {
            OperationError::Hardware { code, .. } => Some(code),
            OperationError::Instrument(InstrumentError::Rejected { code }) => Some(code),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, OperationError>;
