/*
[INPUT]:  Commands, poll targets and readback requests from the orchestration core
[OUTPUT]: Instrument trait - the synchronous call boundary to the controller
[POS]:    Boundary layer - implemented by the vendor binding and the simulator
[UPDATE]: When the controller boundary gains or changes a call
*/

use crate::error::Result;
use crate::types::{Command, PollStatus, ProfilePoint, ProfileSource, Readback, Subsystem};

/// Synchronous controller interface.
///
/// Every call may block on controller I/O and must therefore be made from a
/// worker thread, never from the async scheduler. `poll_status` is cheap and
/// safe to call at high frequency.
pub trait Instrument: Send + Sync {
    /// Dispatch a long-running function. Returns once the command is accepted.
    fn initiate(&self, command: &Command) -> Result<()>;

    fn poll_status(&self, subsystem: Subsystem) -> Result<PollStatus>;

    fn read_value(&self, readback: Readback) -> Result<f64>;

    /// Request an immediate halt. Stopping an idle subsystem is a no-op.
    fn stop(&self, subsystem: Subsystem) -> Result<()>;

    fn is_servo_on(&self, axis: u8) -> Result<bool>;

    /// Profile recorded by the last completed function of the given source.
    fn profile_data(&self, source: ProfileSource) -> Result<Vec<ProfilePoint>>;
}
