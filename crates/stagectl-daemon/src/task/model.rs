/*
[INPUT]:  OperationRequest at creation, transitions and patches from the registry
[OUTPUT]: Task entity, ProgressPatch, TaskEvent broadcast payload
[POS]:    Task layer - value entity for one long-running hardware operation
[UPDATE]: When the task status surface or broadcast payload changes
*/

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::error::{RegistryError, Result};
use super::status::{OperationKind, TaskStatus};
use crate::operations::OperationRequest;

/// Merge-only progress record. Keys per operation kind are documented on
/// the kind's progress struct.
pub type ProgressPatch = Map<String, Value>;

pub fn message_patch(message: impl Into<String>) -> ProgressPatch {
    let mut patch = ProgressPatch::new();
    patch.insert("message".to_string(), Value::String(message.into()));
    patch
}

/// One long-running hardware operation and its lifecycle state.
///
/// Serializes to the task status surface: `result` only appears once the
/// task completed and `error` only once it failed.
#[derive(Debug, Clone, Serialize)]
pub struct Task {
    pub id: Uuid,
    pub operation_kind: OperationKind,
    pub status: TaskStatus,
    pub progress: ProgressPatch,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(rename = "request_data")]
    pub request: OperationRequest,
    #[serde(skip)]
    cancellation: CancellationToken,
}

impl Task {
    pub(crate) fn new(request: OperationRequest) -> Self {
        Self {
            id: Uuid::new_v4(),
            operation_kind: request.kind(),
            status: TaskStatus::Pending,
            progress: ProgressPatch::new(),
            result: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            request,
            cancellation: CancellationToken::new(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Signal armed once cancellation is requested. Never reset.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancellation_requested(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub fn event(&self) -> TaskEvent {
        TaskEvent {
            event_type: "task_progress",
            task_id: self.id,
            operation_kind: self.operation_kind,
            status: self.status,
            progress: self.progress.clone(),
        }
    }

    pub(crate) fn transition(&mut self, next: TaskStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(RegistryError::InvalidTransition {
                task_id: self.id,
                from: self.status,
                to: next,
            });
        }
        let now = Utc::now();
        if next == TaskStatus::Running && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.completed_at = Some(now);
        }
        self.status = next;
        Ok(())
    }

    pub(crate) fn merge_progress(&mut self, patch: ProgressPatch) {
        self.progress.extend(patch);
    }

    pub(crate) fn arm_cancellation(&self) {
        self.cancellation.cancel();
    }

    pub(crate) fn set_result(&mut self, result: Value) {
        debug_assert!(self.result.is_none() && self.error.is_none());
        self.result = Some(result);
    }

    pub(crate) fn set_error(&mut self, error: String) {
        debug_assert!(self.result.is_none() && self.error.is_none());
        self.error = Some(error);
    }
}

/// Broadcast payload, one per applied progress update or status transition.
#[derive(Debug, Clone, Serialize)]
pub struct TaskEvent {
    #[serde(rename = "type")]
    pub event_type: &'static str,
    pub task_id: Uuid,
    pub operation_kind: OperationKind,
    pub status: TaskStatus,
    pub progress: ProgressPatch,
}
