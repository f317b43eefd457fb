/*
[INPUT]:  Operation requests, cancellation requests, shutdown
[OUTPUT]: Spawned executors per task, immediate hardware stop on cancel, bounded shutdown
[POS]:    Supervisor layer - scheduler-side facade over registry, executor and instrument
[UPDATE]: When changing submit/cancel flow or shutdown guarantees
[UPDATE]: Finished executor handles are pruned on submit
*/

use anyhow::{Context, Result, anyhow};
use stagectl_instrument::Instrument;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::TimingConfig;
use crate::executor::TaskExecutor;
use crate::operations::OperationRequest;
use crate::task::{RegistryError, Task, TaskRegistry, TaskStatus};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

type ExecutorOutput = Result<TaskStatus, RegistryError>;
type ExecutorHandle = JoinHandle<ExecutorOutput>;

pub struct TaskSupervisor {
    registry: Arc<TaskRegistry>,
    instrument: Arc<dyn Instrument>,
    executor: TaskExecutor,
    timings: TimingConfig,
    handles: Mutex<HashMap<Uuid, ExecutorHandle>>,
}

impl TaskSupervisor {
    pub fn new(
        registry: Arc<TaskRegistry>,
        instrument: Arc<dyn Instrument>,
        timings: TimingConfig,
    ) -> Self {
        let executor = TaskExecutor::new(Arc::clone(&registry), Arc::clone(&instrument));
        Self {
            registry,
            instrument,
            executor,
            timings,
            handles: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    /// Register the task and spawn its executor. Must be called inside a tokio runtime.
    ///
    /// Fails with `Conflict` while another task is active. Invalid request
    /// data is not rejected here; the task is created and then fails.
    pub fn submit(&self, request: OperationRequest) -> Result<Task, RegistryError> {
        let operation = request.build(&self.timings);
        let task = self.registry.create(request)?;
        let task_id = task.id;
        info!(task_id = %task_id, kind = %task.operation_kind, "task submitted");

        let executor = self.executor.clone();
        let handle = tokio::spawn(async move { executor.execute(task_id, operation).await });
        let mut handles = self.lock_handles();
        // Finished executors nobody waited on; their outcome is already in the registry.
        handles.retain(|_, handle| !handle.is_finished());
        handles.insert(task_id, handle);
        Ok(task)
    }

    /// Request cancellation and stop the hardware right away.
    ///
    /// The worker still observes the signal at its next poll and settles the task.
    /// A poll that reads back the normal stop this call caused settles as cancelled.
    pub async fn cancel(&self, task_id: Uuid) -> Result<Task, RegistryError> {
        let task = self.registry.request_cancellation(task_id)?;
        info!(task_id = %task_id, kind = %task.operation_kind, "cancellation requested");

        let target = task.request.stop_target();
        let instrument = Arc::clone(&self.instrument);
        match tokio::task::spawn_blocking(move || instrument.stop(target)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(
                task_id = %task_id,
                %target,
                error = %err,
                "immediate stop failed"
            ),
            Err(join_err) => warn!(
                task_id = %task_id,
                %target,
                error = %join_err,
                "immediate stop did not run"
            ),
        }
        Ok(task)
    }

    /// Cancel the current task, if any is still cancellable.
    pub async fn cancel_current(&self) -> Option<Task> {
        let current = self.registry.current().filter(|task| task.status.is_cancellable())?;
        match self.cancel(current.id).await {
            Ok(task) => Some(task),
            Err(err) => {
                // Settled between the lookup and the request.
                info!(task_id = %current.id, error = %err, "current task no longer cancellable");
                None
            }
        }
    }

    /// Wait for the task's executor to finish and return the final snapshot.
    pub async fn wait(&self, task_id: Uuid) -> Result<Task> {
        let handle = self.lock_handles().remove(&task_id);
        if let Some(handle) = handle {
            join_executor(task_id, handle).await?;
        }
        self.registry
            .get(task_id)
            .with_context(|| format!("task_id={task_id} no longer in registry"))
    }

    /// Cancel the current task and wait for every executor to exit.
    ///
    /// Bounded by a 30s deadline; remaining executors are aborted on expiry.
    pub async fn shutdown_and_wait(&self) -> Result<()> {
        if let Some(task) = self.cancel_current().await {
            info!(task_id = %task.id, "cancelled current task for shutdown");
        }
        self.join_all_with_deadline(SHUTDOWN_TIMEOUT).await
    }

    async fn join_all_with_deadline(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut handles: Vec<(Uuid, ExecutorHandle)> = self.lock_handles().drain().collect();

        while let Some((task_id, mut handle)) = handles.pop() {
            tokio::select! {
                res = &mut handle => {
                    if let Err(err) = executor_outcome(task_id, res) {
                        abort_all(handles);
                        return Err(err);
                    }
                }
                _ = sleep_until(deadline) => {
                    handle.abort();
                    abort_all(handles);
                    return Err(anyhow!("shutdown timed out after {timeout:?}"));
                }
            }
        }

        Ok(())
    }

    fn lock_handles(&self) -> MutexGuard<'_, HashMap<Uuid, ExecutorHandle>> {
        self.handles
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

async fn join_executor(task_id: Uuid, handle: ExecutorHandle) -> Result<TaskStatus> {
    executor_outcome(task_id, handle.await)
}

fn executor_outcome(
    task_id: Uuid,
    res: std::result::Result<ExecutorOutput, tokio::task::JoinError>,
) -> Result<TaskStatus> {
    match res {
        Ok(Ok(status)) => Ok(status),
        Ok(Err(err)) => {
            Err(err).with_context(|| format!("executor returned error task_id={task_id}"))
        }
        Err(join_err) => {
            error!(task_id = %task_id, error = %join_err, "executor did not finish");
            if join_err.is_panic() {
                return Err(anyhow!("executor panicked task_id={task_id}: {join_err}"));
            }
            Err(anyhow!("executor join error task_id={task_id}: {join_err}"))
        }
    }
}

fn abort_all(handles: Vec<(Uuid, ExecutorHandle)>) {
    for (_task_id, handle) in handles {
        handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operations::{MovementRequest, MovementType};
    use stagectl_instrument::{SimulatedInstrument, SimulationConfig};

    fn supervisor() -> TaskSupervisor {
        let instrument = SimulatedInstrument::new(SimulationConfig {
            noise: 0.0,
            ..SimulationConfig::default()
        });
        TaskSupervisor::new(
            Arc::new(TaskRegistry::default()),
            Arc::new(instrument),
            TimingConfig::default(),
        )
    }

    fn short_move() -> OperationRequest {
        OperationRequest::AxisMovement(MovementRequest {
            movement: MovementType::Relative,
            axis: 2,
            target: 5.0,
            speed: 1000.0,
        })
    }

    #[tokio::test]
    async fn submit_runs_to_completion() {
        let supervisor = supervisor();
        let task = supervisor.submit(short_move()).unwrap();
        let done = supervisor.wait(task.id).await.unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert!(supervisor.registry().current().is_none());
    }

    #[tokio::test]
    async fn second_submit_conflicts_while_active() {
        let supervisor = supervisor();
        let first = supervisor.submit(short_move()).unwrap();
        let err = supervisor.submit(short_move()).unwrap_err();
        assert!(matches!(err, RegistryError::Conflict { task_id, .. } if task_id == first.id));
        supervisor.wait(first.id).await.unwrap();
    }

    #[tokio::test]
    async fn submit_prunes_executors_nobody_waited_on() {
        let supervisor = supervisor();
        for _ in 0..3 {
            let task = supervisor.submit(short_move()).unwrap();
            loop {
                let finished = supervisor
                    .lock_handles()
                    .get(&task.id)
                    .is_some_and(|handle| handle.is_finished());
                if finished {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            assert!(supervisor.registry().get(task.id).unwrap().is_terminal());
        }

        let last = supervisor.submit(short_move()).unwrap();
        let pending: Vec<Uuid> = supervisor.lock_handles().keys().copied().collect();
        assert_eq!(pending, vec![last.id]);
        supervisor.wait(last.id).await.unwrap();
    }

    #[tokio::test]
    async fn cancel_unknown_task_is_not_found() {
        let supervisor = supervisor();
        let err = supervisor.cancel(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, RegistryError::NotFound { .. }));
    }

    #[tokio::test]
    async fn shutdown_without_tasks_is_immediate() {
        let supervisor = supervisor();
        assert!(supervisor.cancel_current().await.is_none());
        supervisor.shutdown_and_wait().await.unwrap();
    }
}
