/*
[INPUT]:  Public API exports for stagectl-daemon crate
[OUTPUT]: Module declarations and public re-exports
[POS]:    Crate root - library entry point
[UPDATE]: When adding new modules or public exports
*/

pub mod config;
pub mod executor;
pub mod operations;
pub mod supervisor;
pub mod task;

// Re-export main types for convenience
pub use config::DaemonConfig;
pub use executor::{Operation, OperationContext, OperationError, TaskExecutor};
pub use operations::OperationRequest;
pub use supervisor::TaskSupervisor;
pub use task::{OperationKind, RegistryError, Task, TaskEvent, TaskRegistry, TaskStatus};
