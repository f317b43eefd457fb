/*
[INPUT]:  Lifecycle events (start, cancel request, outcome)
[OUTPUT]: TaskStatus state machine and the closed OperationKind set
[POS]:    Task layer - legal transitions between task states
[UPDATE]: When adding a state or an edge to the lifecycle
*/

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Stopping,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Pending and Running are the only states a cancellation can be requested from.
    pub fn is_cancellable(self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Running)
    }

    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Stopping)
                | (Running, Stopping)
                | (Running, Completed)
                | (Running, Failed)
                | (Stopping, Cancelled)
                | (Stopping, Failed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Stopping => "stopping",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    AngleAdjustment,
    FlatAlignment,
    FocusAlignment,
    ProfileMeasurement,
    AxisMovement,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::AngleAdjustment => "angle_adjustment",
            OperationKind::FlatAlignment => "flat_alignment",
            OperationKind::FocusAlignment => "focus_alignment",
            OperationKind::ProfileMeasurement => "profile_measurement",
            OperationKind::AxisMovement => "axis_movement",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
