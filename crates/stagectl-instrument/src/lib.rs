/*
[INPUT]:  Crate modules and public type definitions
[OUTPUT]: Public stagectl-instrument crate surface
[POS]:    Crate root - module wiring
[UPDATE]: When public modules or exports change
*/

pub mod error;
pub mod instrument;
pub mod sim;
pub mod types;

pub use error::{InstrumentError, Result};
pub use instrument::Instrument;
pub use sim::{SimulatedInstrument, SimulationConfig};

// Re-export all types
pub use types::*;
