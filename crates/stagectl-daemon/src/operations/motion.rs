/*
[INPUT]:  MovementRequest (absolute or relative single-axis move)
[OUTPUT]: MotionOperation body, MovementProgress records, MovementResult
[POS]:    Operations layer - axis movement on the cancellable poll loop
[UPDATE]: When changing motion validation, progress keys or result fields
*/

use serde::{Deserialize, Serialize};
use serde_json::Value;
use stagectl_instrument::{Command, Instrument, InstrumentError, Readback, StatusCode, Subsystem};
use std::time::Duration;
use tracing::info;

use super::{check_axis, check_positive, seconds};
use crate::executor::error::Result;
use crate::executor::{
    CancellablePoll, Operation, OperationContext, OperationError, PolledOperation, Timing,
};
use crate::task::OperationKind;

pub const DEFAULT_TIMING: Timing = Timing {
    poll_interval_ms: 50,
    start_delay_ms: 100,
    settle_ms: 500,
    stop_settle_ms: 200,
    timeout_ms: 60_000,
};

const DEFAULT_SPEED: f64 = 1000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MovementType {
    Absolute,
    Relative,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MovementRequest {
    pub movement: MovementType,
    pub axis: u8,
    /// Target position for absolute moves, distance for relative moves (µm).
    #[serde(alias = "position", alias = "distance")]
    pub target: f64,
    /// µm/s
    #[serde(default = "default_speed")]
    pub speed: f64,
}

fn default_speed() -> f64 {
    DEFAULT_SPEED
}

impl MovementRequest {
    pub fn validate(&self) -> Result<()> {
        check_axis("axis", self.axis)?;
        check_positive("speed", self.speed)?;
        if !self.target.is_finite() {
            return Err(OperationError::validation(format!(
                "target must be a finite number, got {}",
                self.target
            )));
        }
        Ok(())
    }
}

/// Progress keys: `axis`, `target_position`, `current_position`,
/// `progress_percent`, `elapsed_time`, plus `speed` and `message` on start.
#[derive(Debug, Clone, Serialize)]
pub struct MovementProgress {
    pub axis: u8,
    pub target_position: f64,
    pub current_position: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress_percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed_time: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MovementResult {
    pub success: bool,
    pub axis: u8,
    pub target_position: f64,
    pub initial_position: f64,
    pub final_position: f64,
    pub execution_time: f64,
}

pub struct MotionOperation {
    request: MovementRequest,
    timing: Timing,
}

impl MotionOperation {
    pub fn new(request: MovementRequest, timing: Timing) -> Self {
        Self { request, timing }
    }
}

impl Operation for MotionOperation {
    fn kind(&self) -> OperationKind {
        OperationKind::AxisMovement
    }

    fn run(&self, ctx: &OperationContext, instrument: &dyn Instrument) -> Result<Value> {
        self.request.validate()?;
        let axis = self.request.axis;
        if !instrument.is_servo_on(axis)? {
            return Err(InstrumentError::ServoOff { axis }.into());
        }

        let initial_position = instrument.read_value(Readback::AxisPosition(axis))?;
        let target_position = match self.request.movement {
            MovementType::Absolute => self.request.target,
            MovementType::Relative => initial_position + self.request.target,
        };
        ctx.report(&MovementProgress {
            axis,
            target_position,
            current_position: initial_position,
            progress_percent: Some(0.0),
            elapsed_time: None,
            speed: Some(self.request.speed),
            message: Some(format!(
                "Moving axis {axis} to {target_position:.3} at {} um/s",
                self.request.speed
            )),
        });

        let mut axis_move = AxisMove {
            request: &self.request,
            initial_position,
            target_position,
        };
        let result = CancellablePoll::new(ctx, instrument, self.timing).run(&mut axis_move)?;
        info!(
            task_id = %ctx.task_id(),
            axis,
            final_position = result.final_position,
            "axis movement finished"
        );
        serde_json::to_value(result).map_err(|err| OperationError::Measurement(err.to_string()))
    }
}

struct AxisMove<'a> {
    request: &'a MovementRequest,
    initial_position: f64,
    target_position: f64,
}

impl AxisMove<'_> {
    fn percent(&self, position: f64) -> f64 {
        let span = (self.target_position - self.initial_position).abs();
        if span <= f64::EPSILON {
            return 100.0;
        }
        ((position - self.initial_position).abs() / span * 100.0).clamp(0.0, 100.0)
    }
}

impl PolledOperation for AxisMove<'_> {
    type Output = MovementResult;

    fn name(&self) -> &'static str {
        "Axis movement"
    }

    fn subsystem(&self) -> Subsystem {
        Subsystem::Axis(self.request.axis)
    }

    fn initiate(&mut self, _ctx: &OperationContext, instrument: &dyn Instrument) -> Result<()> {
        let command = match self.request.movement {
            MovementType::Absolute => Command::MoveAbsolute {
                axis: self.request.axis,
                position: self.request.target,
                speed: self.request.speed,
            },
            MovementType::Relative => Command::MoveRelative {
                axis: self.request.axis,
                distance: self.request.target,
                speed: self.request.speed,
            },
        };
        instrument.initiate(&command)?;
        Ok(())
    }

    fn on_progress(
        &mut self,
        ctx: &OperationContext,
        instrument: &dyn Instrument,
        _phase: Option<&StatusCode>,
        elapsed: Duration,
    ) {
        let Ok(current_position) = instrument.read_value(Readback::AxisPosition(self.request.axis))
        else {
            return;
        };
        ctx.report(&MovementProgress {
            axis: self.request.axis,
            target_position: self.target_position,
            current_position,
            progress_percent: Some(self.percent(current_position)),
            elapsed_time: Some(seconds(elapsed)),
            speed: None,
            message: None,
        });
    }

    fn on_stopped(&mut self, ctx: &OperationContext, instrument: &dyn Instrument) {
        let Ok(current_position) = instrument.read_value(Readback::AxisPosition(self.request.axis))
        else {
            return;
        };
        ctx.report(&MovementProgress {
            axis: self.request.axis,
            target_position: self.target_position,
            current_position,
            progress_percent: Some(self.percent(current_position)),
            elapsed_time: None,
            speed: None,
            message: Some("Movement cancelled by user".to_string()),
        });
    }

    fn finish(
        &mut self,
        _ctx: &OperationContext,
        instrument: &dyn Instrument,
        _phase: Option<StatusCode>,
        elapsed: Duration,
    ) -> Result<MovementResult> {
        let final_position = instrument.read_value(Readback::AxisPosition(self.request.axis))?;
        Ok(MovementResult {
            success: true,
            axis: self.request.axis,
            target_position: self.target_position,
            initial_position: self.initial_position,
            final_position,
            execution_time: seconds(elapsed),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn request(axis: u8, speed: f64, target: f64) -> MovementRequest {
        MovementRequest {
            movement: MovementType::Absolute,
            axis,
            target,
            speed,
        }
    }

    #[rstest]
    #[case(request(0, 10.0, 1.0), "axis")]
    #[case(request(13, 10.0, 1.0), "axis")]
    #[case(request(1, 0.0, 1.0), "speed")]
    #[case(request(1, -5.0, 1.0), "speed")]
    #[case(request(1, 10.0, f64::NAN), "target")]
    fn invalid_requests_are_rejected(#[case] request: MovementRequest, #[case] field: &str) {
        match request.validate() {
            Err(OperationError::Validation(message)) => assert!(message.starts_with(field)),
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn percent_tracks_distance_from_start() {
        let req = request(1, 10.0, 0.0);
        let axis_move = AxisMove {
            request: &req,
            initial_position: 100.0,
            target_position: 0.0,
        };
        assert_eq!(axis_move.percent(100.0), 0.0);
        assert_eq!(axis_move.percent(25.0), 75.0);
        assert_eq!(axis_move.percent(-10.0), 100.0);
    }
}
