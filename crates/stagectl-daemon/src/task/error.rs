/*
[INPUT]:  Registry lookups and lifecycle requests from callers
[OUTPUT]: RegistryError raised synchronously to the caller
[POS]:    Task layer - errors that never touch task state
[UPDATE]: When a registry operation gains a new failure mode
*/

use thiserror::Error;
use uuid::Uuid;

use super::status::TaskStatus;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// Another task still owns the instrument
    #[error("Task {task_id} is already {status}. Only one task can run at a time.")]
    Conflict { task_id: Uuid, status: TaskStatus },

    #[error("Task '{task_id}' not found")]
    NotFound { task_id: Uuid },

    /// Cancellation requested outside Pending/Running
    #[error("Task '{task_id}' cannot be cancelled while {status}")]
    InvalidState { task_id: Uuid, status: TaskStatus },

    #[error("Task '{task_id}' cannot move from {from} to {to}")]
    InvalidTransition {
        task_id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
    },
}

pub type Result<T> = std::result::Result<T, RegistryError>;
