/*
[INPUT]:  Progress records produced on a blocking worker thread
[OUTPUT]: ProgressReporter (worker side) and drain loop (scheduler side)
[POS]:    Executor layer - progress bridge between worker and scheduler
[UPDATE]: When changing how progress crosses the thread boundary
*/

use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

use crate::task::{ProgressPatch, TaskRegistry};

/// Worker-side handle. Sending never blocks and never touches task state.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    tx: mpsc::UnboundedSender<ProgressPatch>,
}

pub type ProgressReceiver = mpsc::UnboundedReceiver<ProgressPatch>;

impl ProgressReporter {
    pub fn channel() -> (Self, ProgressReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Serialize a progress record into a patch and hand it to the scheduler.
    pub fn report<T: Serialize>(&self, progress: &T) {
        match serde_json::to_value(progress) {
            Ok(Value::Object(patch)) => self.report_patch(patch),
            Ok(other) => warn!(value = %other, "progress record is not an object; dropped"),
            Err(err) => warn!(error = %err, "failed to serialize progress record"),
        }
    }

    pub fn report_patch(&self, patch: ProgressPatch) {
        // Receiver gone means the task already settled.
        let _ = self.tx.send(patch);
    }
}

/// Apply patches to the task in send order until every reporter is dropped.
pub async fn drain_progress(
    registry: &TaskRegistry,
    task_id: Uuid,
    mut rx: ProgressReceiver,
) -> usize {
    let mut applied = 0;
    while let Some(patch) = rx.recv().await {
        match registry.update_progress(task_id, patch) {
            Ok(()) => applied += 1,
            Err(err) => warn!(task_id = %task_id, error = %err, "dropping progress update"),
        }
    }
    applied
}
