/*
[INPUT]:  Vendor status tables, command parameters, poll vocabulary
[OUTPUT]: Typed Rust structs/enums shared across the instrument boundary
[POS]:    Data layer - type definitions for instrument communication
[UPDATE]: When the vendor contract changes or new types are added
*/

pub mod commands;
pub mod enums;
pub mod models;

pub use commands::*;
pub use enums::*;
pub use models::*;
