/*
[INPUT]:  Operation requests (config queue, future transport), per-kind timings
[OUTPUT]: OperationRequest union, validation, stop target, boxed Operation bodies
[POS]:    Operations layer - dispatch from request data to operation bodies
[UPDATE]: When adding an operation kind
*/

mod alignment;
mod angle_adjustment;
mod motion;
mod profile;

use serde::{Deserialize, Serialize};
use stagectl_instrument::{
    AlignmentParams, AngleAdjustmentParams, FocusAlignmentParams, ProfileParams, Subsystem,
};

use crate::config::TimingConfig;
use crate::executor::{Operation, OperationError};
use crate::task::OperationKind;

pub use alignment::{AlignmentOperation, AlignmentProgress, AlignmentResult};
pub use angle_adjustment::{
    AngleAdjustmentOperation, AngleAdjustmentProgress, AngleAdjustmentResult,
};
pub use motion::{MotionOperation, MovementProgress, MovementRequest, MovementResult, MovementType};
pub use profile::{LINEAR_AXES, ProfileOperation, ProfileProgress, ProfileResult};

pub use alignment::DEFAULT_TIMING as ALIGNMENT_TIMING;
pub use angle_adjustment::DEFAULT_TIMING as ANGLE_ADJUSTMENT_TIMING;
pub use motion::DEFAULT_TIMING as AXIS_MOVEMENT_TIMING;
pub use profile::DEFAULT_TIMING as PROFILE_MEASUREMENT_TIMING;

/// Highest axis and channel number on the controller.
pub const MAX_AXIS: u8 = 12;

/// Request data of a task, tagged by operation kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OperationRequest {
    AxisMovement(MovementRequest),
    FlatAlignment(AlignmentParams),
    FocusAlignment(FocusAlignmentParams),
    AngleAdjustment(AngleAdjustmentParams),
    ProfileMeasurement(ProfileParams),
}

impl OperationRequest {
    pub fn kind(&self) -> OperationKind {
        match self {
            OperationRequest::AxisMovement(_) => OperationKind::AxisMovement,
            OperationRequest::FlatAlignment(_) => OperationKind::FlatAlignment,
            OperationRequest::FocusAlignment(_) => OperationKind::FocusAlignment,
            OperationRequest::AngleAdjustment(_) => OperationKind::AngleAdjustment,
            OperationRequest::ProfileMeasurement(_) => OperationKind::ProfileMeasurement,
        }
    }

    /// Unit to halt when the task is cancelled.
    pub fn stop_target(&self) -> Subsystem {
        match self {
            OperationRequest::AxisMovement(request) => Subsystem::Axis(request.axis),
            OperationRequest::FlatAlignment(_) | OperationRequest::FocusAlignment(_) => {
                Subsystem::Alignment
            }
            OperationRequest::AngleAdjustment(params) => Subsystem::AngleAdjustment(params.stage),
            OperationRequest::ProfileMeasurement(_) => Subsystem::Profile,
        }
    }

    pub fn validate(&self) -> Result<(), OperationError> {
        match self {
            OperationRequest::AxisMovement(request) => request.validate(),
            OperationRequest::FlatAlignment(params) => alignment::validate(params),
            OperationRequest::FocusAlignment(params) => alignment::validate(&params.alignment),
            OperationRequest::AngleAdjustment(params) => angle_adjustment::validate(params),
            OperationRequest::ProfileMeasurement(params) => profile::validate(params),
        }
    }

    pub fn build(&self, timings: &TimingConfig) -> Box<dyn Operation> {
        match self {
            OperationRequest::AxisMovement(request) => {
                Box::new(MotionOperation::new(request.clone(), timings.axis_movement))
            }
            OperationRequest::FlatAlignment(params) => {
                Box::new(AlignmentOperation::flat(params.clone(), timings.alignment))
            }
            OperationRequest::FocusAlignment(params) => {
                Box::new(AlignmentOperation::focus(params.clone(), timings.alignment))
            }
            OperationRequest::AngleAdjustment(params) => Box::new(AngleAdjustmentOperation::new(
                params.clone(),
                timings.angle_adjustment,
            )),
            OperationRequest::ProfileMeasurement(params) => Box::new(ProfileOperation::new(
                params.clone(),
                timings.profile_measurement,
            )),
        }
    }
}

pub(crate) fn check_axis(field: &str, axis: u8) -> Result<(), OperationError> {
    if axis == 0 || axis > MAX_AXIS {
        return Err(OperationError::validation(format!(
            "{field} must be between 1 and {MAX_AXIS}, got {axis}"
        )));
    }
    Ok(())
}

pub(crate) fn check_positive(field: &str, value: f64) -> Result<(), OperationError> {
    if !value.is_finite() || value <= 0.0 {
        return Err(OperationError::validation(format!(
            "{field} must be a positive number, got {value}"
        )));
    }
    Ok(())
}

/// Round to microsecond resolution for reporting.
pub(crate) fn seconds(elapsed: std::time::Duration) -> f64 {
    (elapsed.as_secs_f64() * 1e6).round() / 1e6
}

#[cfg(test)]
mod tests {
    use super::*;
    use stagectl_instrument::AdjustmentStage;

    #[test]
    fn request_deserializes_by_kind_tag() {
        let request: OperationRequest = serde_json::from_value(serde_json::json!({
            "kind": "axis_movement",
            "movement": "relative",
            "axis": 3,
            "distance": 250.0,
        }))
        .unwrap();
        assert_eq!(request.kind(), OperationKind::AxisMovement);
        assert_eq!(request.stop_target(), Subsystem::Axis(3));
        match request {
            OperationRequest::AxisMovement(movement) => {
                assert_eq!(movement.target, 250.0);
                assert_eq!(movement.speed, 1000.0);
            }
            other => panic!("unexpected request {other:?}"),
        }
    }

    #[test]
    fn kind_only_request_uses_defaults() {
        let request: OperationRequest =
            serde_json::from_value(serde_json::json!({"kind": "flat_alignment"})).unwrap();
        assert_eq!(request, OperationRequest::FlatAlignment(AlignmentParams::default()));
        assert!(request.validate().is_ok());
    }

    #[test]
    fn stop_target_follows_angle_stage() {
        let request = OperationRequest::AngleAdjustment(AngleAdjustmentParams {
            stage: AdjustmentStage::Right,
            ..AngleAdjustmentParams::default()
        });
        assert_eq!(
            request.stop_target(),
            Subsystem::AngleAdjustment(AdjustmentStage::Right)
        );
    }

    #[test]
    fn build_matches_kind() {
        let timings = TimingConfig::default();
        for request in [
            OperationRequest::FlatAlignment(AlignmentParams::default()),
            OperationRequest::FocusAlignment(FocusAlignmentParams::default()),
            OperationRequest::ProfileMeasurement(ProfileParams::default()),
        ] {
            assert_eq!(request.build(&timings).kind(), request.kind());
        }
    }
}
