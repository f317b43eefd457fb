/*
[INPUT]:  AngleAdjustmentParams (left or right stage)
[OUTPUT]: AngleAdjustmentOperation body, phase progress with percent, AngleAdjustmentResult
[POS]:    Operations layer - angle adjustment on the cancellable poll loop
[UPDATE]: When changing adjustment validation, progress keys or result fields
*/

use serde::{Deserialize, Serialize};
use serde_json::Value;
use stagectl_instrument::{
    AdjustingPhase, AdjustmentStage, AngleAdjustmentParams, AngleAdjustmentStatus, AngleProfile,
    Command, Instrument, ProfileSource, Readback, StatusCode, Subsystem,
};
use std::time::Duration;
use tracing::{info, warn};

use super::{check_axis, check_positive, seconds};
use crate::executor::error::Result;
use crate::executor::{
    CancellablePoll, Operation, OperationContext, OperationError, PolledOperation, Timing,
};
use crate::task::OperationKind;

pub const DEFAULT_TIMING: Timing = Timing {
    poll_interval_ms: 100,
    start_delay_ms: 200,
    settle_ms: 200,
    stop_settle_ms: 500,
    timeout_ms: 60_000,
};

pub(super) fn validate(params: &AngleAdjustmentParams) -> Result<()> {
    check_axis("signal_channel", params.signal_channel)?;
    check_positive("gap", params.gap)?;
    check_positive("contact_search_range", params.contact_search_range)?;
    check_positive("contact_search_speed", params.contact_search_speed)?;
    for (field, value) in [
        ("signal_lower_limit", params.signal_lower_limit),
        ("push_distance", params.push_distance),
        ("angle_search_range_tx", params.angle_search_range_tx),
        ("angle_search_range_ty", params.angle_search_range_ty),
        ("angle_search_speed_tx", params.angle_search_speed_tx),
        ("angle_search_speed_ty", params.angle_search_speed_ty),
    ] {
        if !value.is_finite() || value < 0.0 {
            return Err(OperationError::validation(format!(
                "{field} must not be negative, got {value}"
            )));
        }
    }
    for (field, axis) in [
        ("angle_axis_tx", params.angle_axis_tx),
        ("angle_axis_ty", params.angle_axis_ty),
    ] {
        if axis != 0 {
            check_axis(field, axis)?;
        }
    }
    Ok(())
}

/// Emitted once per phase change, and once more on completion.
#[derive(Debug, Clone, Serialize)]
pub struct AngleAdjustmentProgress {
    pub stage: AdjustmentStage,
    pub phase: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase_description: Option<String>,
    pub elapsed_time: f64,
    pub progress_percent: u8,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AngleAdjustmentResult {
    pub success: bool,
    pub stage: AdjustmentStage,
    pub status_code: String,
    pub status_value: i32,
    pub status_description: String,
    pub phase_code: Option<String>,
    pub phase_value: Option<i32>,
    pub phase_description: Option<String>,
    pub initial_signal: Option<f64>,
    pub final_signal: Option<f64>,
    pub signal_improvement: Option<f64>,
    pub execution_time: f64,
    pub contact_z_points: usize,
    pub adjusting_tx_points: usize,
    pub adjusting_ty_points: usize,
}

pub struct AngleAdjustmentOperation {
    params: AngleAdjustmentParams,
    timing: Timing,
}

impl AngleAdjustmentOperation {
    pub fn new(params: AngleAdjustmentParams, timing: Timing) -> Self {
        Self { params, timing }
    }
}

impl Operation for AngleAdjustmentOperation {
    fn kind(&self) -> OperationKind {
        OperationKind::AngleAdjustment
    }

    fn run(&self, ctx: &OperationContext, instrument: &dyn Instrument) -> Result<Value> {
        validate(&self.params)?;
        let initial_signal = instrument
            .read_value(Readback::AnalogInput(self.params.signal_channel))
            .map_err(|err| {
                warn!(
                    task_id = %ctx.task_id(),
                    error = %err,
                    "initial signal readback failed"
                )
            })
            .ok();

        let mut run = AdjustmentRun {
            params: &self.params,
            initial_signal,
            last_phase: None,
        };
        let result = CancellablePoll::new(ctx, instrument, self.timing).run(&mut run)?;
        info!(
            task_id = %ctx.task_id(),
            stage = %self.params.stage,
            improvement = ?result.signal_improvement,
            "angle adjustment finished"
        );
        serde_json::to_value(result).map_err(|err| OperationError::Measurement(err.to_string()))
    }
}

struct AdjustmentRun<'a> {
    params: &'a AngleAdjustmentParams,
    initial_signal: Option<f64>,
    last_phase: Option<StatusCode>,
}

fn phase_percent(phase: &StatusCode) -> u8 {
    AdjustingPhase::from_code(&phase.code).map_or(0, AdjustingPhase::progress_percent)
}

impl PolledOperation for AdjustmentRun<'_> {
    type Output = AngleAdjustmentResult;

    fn name(&self) -> &'static str {
        "Angle adjustment"
    }

    fn subsystem(&self) -> Subsystem {
        Subsystem::AngleAdjustment(self.params.stage)
    }

    fn initiate(&mut self, _ctx: &OperationContext, instrument: &dyn Instrument) -> Result<()> {
        instrument.initiate(&Command::AngleAdjustment(self.params.clone()))?;
        Ok(())
    }

    fn on_progress(
        &mut self,
        ctx: &OperationContext,
        _instrument: &dyn Instrument,
        phase: Option<&StatusCode>,
        elapsed: Duration,
    ) {
        let Some(phase) = phase else {
            return;
        };
        if self.last_phase.as_ref() == Some(phase) {
            return;
        }
        info!(
            task_id = %ctx.task_id(),
            stage = %self.params.stage,
            phase = %phase.code,
            "angle adjustment phase changed"
        );
        ctx.report(&AngleAdjustmentProgress {
            stage: self.params.stage,
            phase: phase.code.clone(),
            phase_description: Some(phase.description.clone()),
            elapsed_time: seconds(elapsed),
            progress_percent: phase_percent(phase),
            message: format!("Phase: {}", phase.code),
        });
        self.last_phase = Some(phase.clone());
    }

    fn finish(
        &mut self,
        ctx: &OperationContext,
        instrument: &dyn Instrument,
        phase: Option<StatusCode>,
        elapsed: Duration,
    ) -> Result<AngleAdjustmentResult> {
        let stage = self.params.stage;
        let final_signal = instrument
            .read_value(Readback::AnalogInput(self.params.signal_channel))
            .map_err(|err| {
                warn!(
                    task_id = %ctx.task_id(),
                    error = %err,
                    "final signal readback failed"
                )
            })
            .ok();
        let signal_improvement = self.initial_signal.zip(final_signal).map(|(a, b)| b - a);

        let count = |profile| -> Result<usize> {
            Ok(instrument.profile_data(ProfileSource::Angle(stage, profile))?.len())
        };
        let contact_z_points = count(AngleProfile::ContactZ)?;
        let adjusting_tx_points = count(AngleProfile::AdjustingTx)?;
        let adjusting_ty_points = count(AngleProfile::AdjustingTy)?;

        ctx.report(&AngleAdjustmentProgress {
            stage,
            phase: "Completed".to_string(),
            phase_description: None,
            elapsed_time: seconds(elapsed),
            progress_percent: 100,
            message: "Angle adjustment completed successfully".to_string(),
        });

        let status = AngleAdjustmentStatus::Success;
        let phase = phase.or_else(|| self.last_phase.clone());
        Ok(AngleAdjustmentResult {
            success: true,
            stage,
            status_code: status.code().to_string(),
            status_value: status.value(),
            status_description: status.description().to_string(),
            phase_code: phase.as_ref().map(|p| p.code.clone()),
            phase_value: phase.as_ref().map(|p| p.value),
            phase_description: phase.as_ref().map(|p| p.description.clone()),
            initial_signal: self.initial_signal,
            final_signal,
            signal_improvement,
            execution_time: seconds(elapsed),
            contact_z_points,
            adjusting_tx_points,
            adjusting_ty_points,
        })
    }
}
