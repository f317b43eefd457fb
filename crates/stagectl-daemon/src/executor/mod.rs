/*
[INPUT]:  Task id from the registry, a boxed Operation body, the shared Instrument
[OUTPUT]: Task driven from Pending to exactly one terminal state, slot released
[POS]:    Executor layer - lifecycle framework around operation bodies
[UPDATE]: When changing outcome mapping, worker hand-off or cleanup ordering
[UPDATE]: Success is recorded through complete_or_cancel so a late cancel cannot wedge the slot
*/

pub mod blocking;
pub mod bridge;
pub mod error;

use serde::Serialize;
use serde_json::Value;
use stagectl_instrument::Instrument;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::task::{OperationKind, RegistryError, TaskRegistry, TaskStatus, message_patch};

pub use blocking::{CancellablePoll, PolledOperation, Timing};
pub use bridge::{ProgressReporter, drain_progress};
pub use error::OperationError;

/// Worker-side view of a task: identity, cancellation signal, progress sink.
#[derive(Debug, Clone)]
pub struct OperationContext {
    task_id: Uuid,
    cancellation: CancellationToken,
    progress: ProgressReporter,
}

impl OperationContext {
    pub fn new(task_id: Uuid, cancellation: CancellationToken, progress: ProgressReporter) -> Self {
        Self {
            task_id,
            cancellation,
            progress,
        }
    }

    pub fn task_id(&self) -> Uuid {
        self.task_id
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub fn report<T: Serialize>(&self, progress: &T) {
        self.progress.report(progress);
    }
}

/// Operation-specific body driven by [`TaskExecutor`].
///
/// `run` executes on a blocking worker thread. It returns the task result,
/// `OperationError::Cancelled` once cancellation was honoured, or any other
/// error to fail the task.
pub trait Operation: Send + 'static {
    fn kind(&self) -> OperationKind;

    fn run(&self, ctx: &OperationContext, instrument: &dyn Instrument) -> error::Result<Value>;
}

/// Drives one task through its lifecycle.
#[derive(Clone)]
pub struct TaskExecutor {
    registry: Arc<TaskRegistry>,
    instrument: Arc<dyn Instrument>,
}

impl TaskExecutor {
    pub fn new(registry: Arc<TaskRegistry>, instrument: Arc<dyn Instrument>) -> Self {
        Self {
            registry,
            instrument,
        }
    }

    /// Run the task to a terminal state and release the current slot.
    ///
    /// Only a missing task is reported as an error. Every outcome of the
    /// body, including cancellation and panics, ends up on the task itself.
    pub async fn execute(
        &self,
        task_id: Uuid,
        operation: Box<dyn Operation>,
    ) -> Result<TaskStatus, RegistryError> {
        let task = self
            .registry
            .get(task_id)
            .ok_or(RegistryError::NotFound { task_id })?;
        let kind = operation.kind();

        let status = match self.registry.update_status(
            task_id,
            TaskStatus::Running,
            message_patch("Task execution started"),
        ) {
            Ok(_) => {
                info!(task_id = %task_id, kind = %kind, "task started");
                let cancellation = task.cancellation().clone();
                let outcome = self.run_worker(task_id, cancellation, operation).await;
                self.record_outcome(task_id, kind, outcome)
            }
            Err(RegistryError::InvalidTransition {
                from: TaskStatus::Stopping,
                ..
            }) => {
                info!(task_id = %task_id, kind = %kind, "task cancelled before start");
                self.settle_cancelled(task_id)
            }
            Err(err) => {
                error!(task_id = %task_id, error = %err, "task could not start");
                self.registry
                    .get(task_id)
                    .map_or(TaskStatus::Failed, |task| task.status)
            }
        };

        self.registry.release_if_terminal(task_id);
        Ok(status)
    }

    async fn run_worker(
        &self,
        task_id: Uuid,
        cancellation: CancellationToken,
        operation: Box<dyn Operation>,
    ) -> error::Result<Value> {
        let (reporter, receiver) = ProgressReporter::channel();
        let ctx = OperationContext::new(task_id, cancellation, reporter);
        let instrument = Arc::clone(&self.instrument);

        let worker = tokio::task::spawn_blocking(move || operation.run(&ctx, instrument.as_ref()));

        // Ends once the worker drops its reporter, i.e. when the body returns.
        drain_progress(&self.registry, task_id, receiver).await;

        match worker.await {
            Ok(outcome) => outcome,
            Err(join_err) if join_err.is_panic() => {
                Err(OperationError::Worker(format!("operation panicked: {join_err}")))
            }
            Err(join_err) => Err(OperationError::Worker(join_err.to_string())),
        }
    }

    fn record_outcome(
        &self,
        task_id: Uuid,
        kind: OperationKind,
        outcome: error::Result<Value>,
    ) -> TaskStatus {
        let recorded = match outcome {
            Ok(result) => {
                let recorded = self.registry.complete_or_cancel(
                    task_id,
                    result,
                    message_patch("Task completed successfully"),
                );
                match &recorded {
                    Ok(task) if task.status == TaskStatus::Cancelled => {
                        info!(
                            task_id = %task_id,
                            kind = %kind,
                            "operation finished after cancellation request"
                        );
                    }
                    Ok(_) => info!(task_id = %task_id, kind = %kind, "task completed"),
                    Err(_) => {}
                }
                recorded
            }
            Err(OperationError::Cancelled) => {
                info!(task_id = %task_id, kind = %kind, "task cancelled");
                return self.settle_cancelled(task_id);
            }
            Err(err) => {
                warn!(task_id = %task_id, kind = %kind, error = %err, "task failed");
                let message = err.to_string();
                let patch = message_patch(format!("Task failed: {message}"));
                self.registry.fail(task_id, message, patch)
            }
        };

        match recorded {
            Ok(task) => task.status,
            Err(err) => {
                error!(task_id = %task_id, error = %err, "failed to record task outcome");
                self.current_status(task_id)
            }
        }
    }

    fn settle_cancelled(&self, task_id: Uuid) -> TaskStatus {
        if self.current_status(task_id) == TaskStatus::Running {
            // Signal armed without a registry request; pass through Stopping.
            if let Err(err) =
                self.registry
                    .update_status(task_id, TaskStatus::Stopping, message_patch("Stopping"))
            {
                error!(task_id = %task_id, error = %err, "failed to mark task stopping");
            }
        }
        match self
            .registry
            .update_status(task_id, TaskStatus::Cancelled, message_patch("Task cancelled"))
        {
            Ok(task) => task.status,
            Err(err) => {
                error!(task_id = %task_id, error = %err, "failed to record cancellation");
                self.current_status(task_id)
            }
        }
    }

    fn current_status(&self, task_id: Uuid) -> TaskStatus {
        self.registry
            .get(task_id)
            .map_or(TaskStatus::Failed, |task| task.status)
    }
}
