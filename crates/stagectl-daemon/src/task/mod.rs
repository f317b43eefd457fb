/*
[INPUT]:  Task lifecycle vocabulary and the registry that owns task state
[OUTPUT]: Task, TaskStatus, OperationKind, TaskRegistry, RegistryError
[POS]:    Task layer - module wiring
[UPDATE]: When task-layer modules or exports change
*/

mod error;
mod model;
mod registry;
mod status;

pub use error::{RegistryError, Result};
pub use model::{ProgressPatch, Task, TaskEvent, message_patch};
pub use registry::{DEFAULT_HISTORY_CAPACITY, TaskRegistry};
pub use status::{OperationKind, TaskStatus};
