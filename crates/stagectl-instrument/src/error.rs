/*
[INPUT]:  Failure sources at the instrument boundary (link, dispatch, vendor status)
[OUTPUT]: InstrumentError with transient/permanent classification
[POS]:    Error handling layer - unified error type for the instrument crate
[UPDATE]: When adding new error sources or improving error messages
*/

use thiserror::Error;

use crate::types::StatusCode;

/// Main error type for instrument calls
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InstrumentError {
    /// No controller session is open
    #[error("Instrument is not connected")]
    NotConnected,

    /// Axis number outside the controller's range
    #[error("Invalid axis number {axis} (expected 1-{max})")]
    InvalidAxis { axis: u8, max: u8 },

    /// Motion requested on an axis whose servo is off
    #[error("Servo is off on axis {axis}")]
    ServoOff { axis: u8 },

    /// Channel number outside the controller's range
    #[error("Invalid channel number {channel}")]
    InvalidChannel { channel: u8 },

    /// The initiating call was refused with a vendor status
    #[error("Command rejected: {code}")]
    Rejected { code: StatusCode },

    /// Another function already owns the requested unit
    #[error("Instrument busy: {0}")]
    Busy(String),

    /// Link to the controller failed
    #[error("Communication error: {0}")]
    Communication(String),
}

impl InstrumentError {
    /// Check if repeating the same call could succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            InstrumentError::Busy(_) | InstrumentError::Communication(_)
        )
    }
}

/// Result type alias for instrument operations
pub type Result<T> = std::result::Result<T, InstrumentError>;
