/*
[INPUT]:  Create/cancel requests (scheduler), status and progress updates (executor, bridge)
[OUTPUT]: Single-task gate, bounded task history, ordered TaskEvent broadcast
[POS]:    Task layer - serialization point for every task mutation
[UPDATE]: When changing the concurrency gate, eviction policy or event ordering
*/

use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::broadcast;
use tracing::{debug, info};
use uuid::Uuid;

use super::error::{RegistryError, Result};
use super::model::{ProgressPatch, Task, TaskEvent, message_patch};
use super::status::{OperationKind, TaskStatus};
use crate::operations::OperationRequest;

pub const DEFAULT_HISTORY_CAPACITY: usize = 100;
const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Default)]
struct RegistryState {
    current: Option<Uuid>,
    tasks: HashMap<Uuid, Task>,
    /// Task ids in creation order, oldest first.
    order: VecDeque<Uuid>,
}

impl RegistryState {
    fn task_mut(&mut self, task_id: Uuid) -> Result<&mut Task> {
        self.tasks
            .get_mut(&task_id)
            .ok_or(RegistryError::NotFound { task_id })
    }

    fn active_current(&self) -> Option<&Task> {
        self.current
            .and_then(|id| self.tasks.get(&id))
            .filter(|task| !task.is_terminal())
    }

    fn evict_over(&mut self, capacity: usize) {
        while self.tasks.len() > capacity {
            let exempt = self.active_current().map(|task| task.id);
            let Some(position) = self.order.iter().position(|id| Some(*id) != exempt) else {
                break;
            };
            if let Some(evicted) = self.order.remove(position) {
                self.tasks.remove(&evicted);
                if self.current == Some(evicted) {
                    self.current = None;
                }
                debug!(task_id = %evicted, "evicted task from history");
            }
        }
    }
}

/// Process-wide task registry.
///
/// Holds at most one non-terminal task at a time plus a bounded history.
/// Every mutation happens under one lock and publishes its [`TaskEvent`]
/// before the lock is released, so subscribers see events in the order
/// they were applied.
#[derive(Debug)]
pub struct TaskRegistry {
    state: Mutex<RegistryState>,
    capacity: usize,
    events: broadcast::Sender<TaskEvent>,
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

impl TaskRegistry {
    pub fn new(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            state: Mutex::new(RegistryState::default()),
            capacity: capacity.max(1),
            events,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, task: &Task) {
        // No subscribers is fine.
        let _ = self.events.send(task.event());
    }

    /// Allocate a Pending task for the request and make it current.
    pub fn create(&self, request: OperationRequest) -> Result<Task> {
        let mut state = self.lock();
        if let Some(active) = state.active_current() {
            return Err(RegistryError::Conflict {
                task_id: active.id,
                status: active.status,
            });
        }

        let task = Task::new(request);
        state.current = Some(task.id);
        state.order.push_back(task.id);
        state.tasks.insert(task.id, task.clone());
        state.evict_over(self.capacity);

        info!(task_id = %task.id, kind = %task.operation_kind, "task created");
        Ok(task)
    }

    pub fn get(&self, task_id: Uuid) -> Option<Task> {
        self.lock().tasks.get(&task_id).cloned()
    }

    /// The current task, terminal or not, until its slot is released.
    pub fn current(&self) -> Option<Task> {
        let state = self.lock();
        state.current.and_then(|id| state.tasks.get(&id)).cloned()
    }

    /// Most recently created first, optionally filtered by kind.
    pub fn history(&self, limit: usize, kind: Option<OperationKind>) -> Vec<Task> {
        let state = self.lock();
        state
            .order
            .iter()
            .rev()
            .filter_map(|id| state.tasks.get(id))
            .filter(|task| kind.is_none_or(|kind| task.operation_kind == kind))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Move the task along a lifecycle edge and publish one event that
    /// carries the transition together with `patch`.
    pub fn update_status(
        &self,
        task_id: Uuid,
        status: TaskStatus,
        patch: ProgressPatch,
    ) -> Result<Task> {
        let mut state = self.lock();
        let task = state.task_mut(task_id)?;
        task.transition(status)?;
        task.merge_progress(patch);
        self.publish(task);
        debug!(task_id = %task_id, status = %status, "task status updated");
        Ok(task.clone())
    }

    pub fn update_progress(&self, task_id: Uuid, patch: ProgressPatch) -> Result<()> {
        let mut state = self.lock();
        let task = state.task_mut(task_id)?;
        task.merge_progress(patch);
        self.publish(task);
        Ok(())
    }

    pub fn complete(&self, task_id: Uuid, result: Value, patch: ProgressPatch) -> Result<Task> {
        let mut state = self.lock();
        let task = state.task_mut(task_id)?;
        task.transition(TaskStatus::Completed)?;
        task.set_result(result);
        task.merge_progress(patch);
        self.publish(task);
        Ok(task.clone())
    }

    /// Record a successful body outcome.
    ///
    /// A task already moved to Stopping has no edge to Completed; it is
    /// settled as Cancelled instead and `result` is dropped. Both cases are
    /// decided under the same lock as the write.
    pub fn complete_or_cancel(
        &self,
        task_id: Uuid,
        result: Value,
        patch: ProgressPatch,
    ) -> Result<Task> {
        let mut state = self.lock();
        let task = state.task_mut(task_id)?;
        if task.status == TaskStatus::Stopping {
            task.transition(TaskStatus::Cancelled)?;
            task.merge_progress(message_patch("Task cancelled"));
        } else {
            task.transition(TaskStatus::Completed)?;
            task.set_result(result);
            task.merge_progress(patch);
        }
        self.publish(task);
        Ok(task.clone())
    }

    pub fn fail(
        &self,
        task_id: Uuid,
        error: impl Into<String>,
        patch: ProgressPatch,
    ) -> Result<Task> {
        let mut state = self.lock();
        let task = state.task_mut(task_id)?;
        task.transition(TaskStatus::Failed)?;
        task.set_error(error.into());
        task.merge_progress(patch);
        self.publish(task);
        Ok(task.clone())
    }

    /// Arm the task's cancellation signal and move it to Stopping.
    pub fn request_cancellation(&self, task_id: Uuid) -> Result<Task> {
        let mut state = self.lock();
        let task = state.task_mut(task_id)?;
        if !task.status.is_cancellable() {
            return Err(RegistryError::InvalidState {
                task_id,
                status: task.status,
            });
        }
        task.arm_cancellation();
        task.transition(TaskStatus::Stopping)?;
        task.merge_progress(message_patch("Cancellation requested"));
        self.publish(task);
        info!(task_id = %task_id, "task cancellation requested");
        Ok(task.clone())
    }

    /// Free the current-task slot if it holds this task in a terminal state.
    pub fn release_if_terminal(&self, task_id: Uuid) -> bool {
        let mut state = self.lock();
        let releasable = state.current == Some(task_id)
            && state.tasks.get(&task_id).is_some_and(Task::is_terminal);
        if releasable {
            state.current = None;
            debug!(task_id = %task_id, "current task slot released");
        }
        releasable
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operations::{MovementRequest, MovementType};
    use serde_json::json;

    fn move_request() -> OperationRequest {
        OperationRequest::AxisMovement(MovementRequest {
            movement: MovementType::Relative,
            axis: 2,
            target: 5.0,
            speed: 100.0,
        })
    }

    fn run_to_completion(registry: &TaskRegistry) -> Uuid {
        let task = registry.create(move_request()).unwrap();
        registry
            .update_status(task.id, TaskStatus::Running, ProgressPatch::new())
            .unwrap();
        registry
            .complete(task.id, json!({"ok": true}), ProgressPatch::new())
            .unwrap();
        assert!(registry.release_if_terminal(task.id));
        task.id
    }

    #[test]
    fn create_rejects_while_current_is_active() {
        let registry = TaskRegistry::default();
        let first = registry.create(move_request()).unwrap();

        for status in [TaskStatus::Pending, TaskStatus::Running, TaskStatus::Stopping] {
            if status != TaskStatus::Pending {
                registry.update_status(first.id, status, ProgressPatch::new()).unwrap();
            }
            let err = registry.create(move_request()).unwrap_err();
            assert_eq!(
                err,
                RegistryError::Conflict {
                    task_id: first.id,
                    status
                }
            );
        }
        assert_eq!(registry.history(10, None).len(), 1);
    }

    #[test]
    fn create_allowed_once_current_is_terminal_even_before_release() {
        let registry = TaskRegistry::default();
        let first = registry.create(move_request()).unwrap();
        registry.update_status(first.id, TaskStatus::Running, ProgressPatch::new()).unwrap();
        registry.fail(first.id, "boom", ProgressPatch::new()).unwrap();

        let second = registry.create(move_request()).unwrap();
        assert_eq!(registry.current().unwrap().id, second.id);
        assert!(!registry.release_if_terminal(first.id));
    }

    #[test]
    fn unknown_ids_are_not_found() {
        let registry = TaskRegistry::default();
        let missing = Uuid::new_v4();
        assert!(registry.get(missing).is_none());
        assert_eq!(
            registry.update_progress(missing, ProgressPatch::new()).unwrap_err(),
            RegistryError::NotFound { task_id: missing }
        );
        assert!(matches!(
            registry.request_cancellation(missing),
            Err(RegistryError::NotFound { .. })
        ));
    }

    #[test]
    fn complete_sets_result_once() {
        let registry = TaskRegistry::default();
        let id = run_to_completion(&registry);
        let task = registry.get(id).unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.result, Some(json!({"ok": true})));
        assert!(task.error.is_none());

        let err = registry.complete(id, json!(2), ProgressPatch::new()).unwrap_err();
        assert!(matches!(err, RegistryError::InvalidTransition { .. }));
        let err = registry.fail(id, "late", ProgressPatch::new()).unwrap_err();
        assert!(matches!(err, RegistryError::InvalidTransition { .. }));
        assert_eq!(registry.get(id).unwrap().result, Some(json!({"ok": true})));
    }

    #[test]
    fn complete_or_cancel_completes_running_task() {
        let registry = TaskRegistry::default();
        let task = registry.create(move_request()).unwrap();
        registry.update_status(task.id, TaskStatus::Running, ProgressPatch::new()).unwrap();

        let done = registry
            .complete_or_cancel(task.id, json!({"ok": true}), message_patch("done"))
            .unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.result, Some(json!({"ok": true})));
        assert!(registry.release_if_terminal(task.id));
    }

    #[test]
    fn complete_or_cancel_settles_stopping_task_as_cancelled() {
        let registry = TaskRegistry::default();
        let mut events = registry.subscribe();
        let task = registry.create(move_request()).unwrap();
        registry.update_status(task.id, TaskStatus::Running, ProgressPatch::new()).unwrap();
        registry.request_cancellation(task.id).unwrap();

        let done = registry
            .complete_or_cancel(task.id, json!({"late": true}), message_patch("done"))
            .unwrap();
        assert_eq!(done.status, TaskStatus::Cancelled);
        assert!(done.result.is_none());
        assert_eq!(done.progress["message"], json!("Task cancelled"));
        assert!(registry.release_if_terminal(task.id));

        let mut last = None;
        while let Ok(event) = events.try_recv() {
            last = Some(event.status);
        }
        assert_eq!(last, Some(TaskStatus::Cancelled));
    }

    #[test]
    fn cancellation_is_not_idempotent() {
        let registry = TaskRegistry::default();
        let task = registry.create(move_request()).unwrap();

        let stopping = registry.request_cancellation(task.id).unwrap();
        assert_eq!(stopping.status, TaskStatus::Stopping);
        assert!(stopping.is_cancellation_requested());

        let err = registry.request_cancellation(task.id).unwrap_err();
        assert_eq!(
            err,
            RegistryError::InvalidState {
                task_id: task.id,
                status: TaskStatus::Stopping
            }
        );
        let task = registry.get(task.id).unwrap();
        assert_eq!(task.status, TaskStatus::Stopping);
        assert!(task.cancellation().is_cancelled());
    }

    #[test]
    fn cancellation_of_terminal_task_is_invalid_state() {
        let registry = TaskRegistry::default();
        let id = run_to_completion(&registry);
        assert!(matches!(
            registry.request_cancellation(id),
            Err(RegistryError::InvalidState {
                status: TaskStatus::Completed,
                ..
            })
        ));
    }

    #[test]
    fn history_is_bounded_and_newest_first() {
        let registry = TaskRegistry::new(3);
        let ids: Vec<Uuid> = (0..5).map(|_| run_to_completion(&registry)).collect();

        let history: Vec<Uuid> = registry.history(10, None).iter().map(|t| t.id).collect();
        assert_eq!(history, vec![ids[4], ids[3], ids[2]]);
        assert!(registry.get(ids[0]).is_none());
        assert!(registry.get(ids[1]).is_none());
    }

    #[test]
    fn history_filters_by_kind_and_limit() {
        let registry = TaskRegistry::default();
        run_to_completion(&registry);
        run_to_completion(&registry);
        assert_eq!(registry.history(1, None).len(), 1);
        assert_eq!(registry.history(10, Some(OperationKind::AxisMovement)).len(), 2);
        assert!(registry.history(10, Some(OperationKind::FlatAlignment)).is_empty());
    }

    #[test]
    fn active_current_task_is_exempt_from_eviction() {
        let registry = TaskRegistry::new(1);
        run_to_completion(&registry);
        let active = registry.create(move_request()).unwrap();
        assert_eq!(registry.history(10, None).len(), 1);
        assert!(registry.get(active.id).is_some());
    }

    #[tokio::test]
    async fn events_follow_application_order() {
        let registry = TaskRegistry::default();
        let mut events = registry.subscribe();
        let task = registry.create(move_request()).unwrap();

        registry
            .update_status(task.id, TaskStatus::Running, message_patch("Task execution started"))
            .unwrap();
        for percent in [10, 20, 30] {
            let mut patch = ProgressPatch::new();
            patch.insert("progress_percent".into(), json!(percent));
            registry.update_progress(task.id, patch).unwrap();
        }
        registry.request_cancellation(task.id).unwrap();
        registry
            .update_status(task.id, TaskStatus::Cancelled, message_patch("Task cancelled"))
            .unwrap();

        let mut statuses = Vec::new();
        let mut percents = Vec::new();
        while let Ok(event) = events.try_recv() {
            assert_eq!(event.task_id, task.id);
            statuses.push(event.status);
            if let Some(percent) = event.progress.get("progress_percent") {
                percents.push(percent.as_i64().unwrap());
            }
        }
        assert_eq!(
            statuses,
            vec![
                TaskStatus::Running,
                TaskStatus::Running,
                TaskStatus::Running,
                TaskStatus::Running,
                TaskStatus::Stopping,
                TaskStatus::Cancelled,
            ]
        );
        assert_eq!(percents, vec![10, 20, 30, 30, 30]);
    }
}
