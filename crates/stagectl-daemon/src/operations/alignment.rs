/*
[INPUT]:  AlignmentParams (flat) or FocusAlignmentParams (focus)
[OUTPUT]: AlignmentOperation body, phase-change progress, AlignmentResult
[POS]:    Operations layer - optical alignment on the cancellable poll loop
[UPDATE]: When changing alignment validation, progress keys or result fields
*/

use serde::{Deserialize, Serialize};
use serde_json::Value;
use stagectl_instrument::{
    AlignmentParams, AlignmentStatus, Command, FocusAlignmentParams, Instrument, ProfileAxis,
    ProfilePoint, ProfileSource, Readback, StatusCode, Subsystem, ZMode, find_peak,
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
    poll_interval_ms: 500,
    start_delay_ms: 100,
    settle_ms: 200,
    stop_settle_ms: 500,
    timeout_ms: 300_000,
};

pub(super) fn validate(params: &AlignmentParams) -> Result<()> {
    check_axis("main_stage_x", params.main_stage_x)?;
    check_axis("main_stage_y", params.main_stage_y)?;
    if params.main_stage_x == params.main_stage_y {
        return Err(OperationError::validation(format!(
            "main_stage_x and main_stage_y must differ, both are {}",
            params.main_stage_x
        )));
    }
    if params.sub_stage_xy != 0 {
        check_axis("sub_stage_xy", params.sub_stage_xy)?;
    }
    check_axis("pm_channel", params.pm_channel)?;
    check_axis("analog_channel", params.analog_channel)?;
    if params.wavelength == 0 {
        return Err(OperationError::validation("wavelength must be positive"));
    }
    if !(0.0..=99.99).contains(&params.peak_search_threshold) {
        return Err(OperationError::validation(format!(
            "peak_search_threshold must be between 0 and 99.99, got {}",
            params.peak_search_threshold
        )));
    }
    if params.field_search_threshold.is_nan() || params.field_search_threshold < 0.0 {
        return Err(OperationError::validation(
            "field_search_threshold must not be negative",
        ));
    }
    for (field, value) in [
        ("search_range_x", params.search_range_x),
        ("search_range_y", params.search_range_y),
        ("field_search_pitch_x", params.field_search_pitch_x),
        ("field_search_pitch_y", params.field_search_pitch_y),
        ("field_search_speed_x", params.field_search_speed_x),
        ("field_search_speed_y", params.field_search_speed_y),
        ("peak_search_speed_x", params.peak_search_speed_x),
        ("peak_search_speed_y", params.peak_search_speed_y),
    ] {
        check_positive(field, value)?;
    }
    if params.comparison_count == 0 {
        return Err(OperationError::validation("comparison_count must be at least 1"));
    }
    if !(1..=99).contains(&params.max_repeat_count) {
        return Err(OperationError::validation(format!(
            "max_repeat_count must be between 1 and 99, got {}",
            params.max_repeat_count
        )));
    }
    Ok(())
}

/// Emitted once per phase change.
#[derive(Debug, Clone, Serialize)]
pub struct AlignmentProgress {
    pub phase: String,
    pub phase_value: i32,
    pub phase_description: String,
    pub elapsed_time: f64,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlignmentResult {
    pub success: bool,
    pub status_code: String,
    pub status_value: i32,
    pub status_description: String,
    pub phase_code: Option<String>,
    pub phase_value: Option<i32>,
    pub phase_description: Option<String>,
    pub initial_power: Option<f64>,
    pub final_power: Option<f64>,
    pub power_improvement: Option<f64>,
    pub peak_position_x: Option<f64>,
    pub peak_position_y: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peak_position_z: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub z_mode: Option<ZMode>,
    pub execution_time: f64,
    pub profile_points_x: usize,
    pub profile_points_y: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile_points_z: Option<usize>,
}

/// Flat or focus optical alignment.
pub struct AlignmentOperation {
    params: AlignmentParams,
    z_mode: Option<ZMode>,
    timing: Timing,
}

impl AlignmentOperation {
    pub fn flat(params: AlignmentParams, timing: Timing) -> Self {
        Self {
            params,
            z_mode: None,
            timing,
        }
    }

    pub fn focus(params: FocusAlignmentParams, timing: Timing) -> Self {
        Self {
            params: params.alignment,
            z_mode: Some(params.z_mode),
            timing,
        }
    }

    fn is_focus(&self) -> bool {
        self.z_mode.is_some()
    }
}

impl Operation for AlignmentOperation {
    fn kind(&self) -> OperationKind {
        if self.is_focus() {
            OperationKind::FocusAlignment
        } else {
            OperationKind::FlatAlignment
        }
    }

    fn run(&self, ctx: &OperationContext, instrument: &dyn Instrument) -> Result<Value> {
        validate(&self.params)?;
        let readback = Readback::OpticalPower(self.params.pm_channel);
        let initial_power = match instrument.read_value(readback) {
            Ok(power) => Some(power),
            Err(err) => {
                warn!(task_id = %ctx.task_id(), error = %err, "initial power readback failed");
                None
            }
        };

        let mut run = AlignmentRun {
            operation: self,
            initial_power,
            last_phase: None,
        };
        let result = CancellablePoll::new(ctx, instrument, self.timing).run(&mut run)?;
        info!(
            task_id = %ctx.task_id(),
            kind = %self.kind(),
            improvement = ?result.power_improvement,
            "alignment finished"
        );
        serde_json::to_value(result).map_err(|err| OperationError::Measurement(err.to_string()))
    }
}

struct AlignmentRun<'a> {
    operation: &'a AlignmentOperation,
    initial_power: Option<f64>,
    last_phase: Option<StatusCode>,
}

fn peak_of(points: &[ProfilePoint]) -> Option<f64> {
    find_peak(points).map(|(_, point)| point.position)
}

impl PolledOperation for AlignmentRun<'_> {
    type Output = AlignmentResult;

    fn name(&self) -> &'static str {
        if self.operation.is_focus() {
            "Focus alignment"
        } else {
            "Flat alignment"
        }
    }

    fn subsystem(&self) -> Subsystem {
        Subsystem::Alignment
    }

    fn initiate(&mut self, _ctx: &OperationContext, instrument: &dyn Instrument) -> Result<()> {
        let command = match self.operation.z_mode {
            Some(z_mode) => Command::FocusAlignment(FocusAlignmentParams {
                z_mode,
                alignment: self.operation.params.clone(),
            }),
            None => Command::FlatAlignment(self.operation.params.clone()),
        };
        instrument.initiate(&command)?;
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
        info!(task_id = %ctx.task_id(), phase = %phase.code, "alignment phase changed");
        ctx.report(&AlignmentProgress {
            phase: phase.code.clone(),
            phase_value: phase.value,
            phase_description: phase.description.clone(),
            elapsed_time: seconds(elapsed),
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
    ) -> Result<AlignmentResult> {
        let params = &self.operation.params;
        let final_power = instrument
            .read_value(Readback::OpticalPower(params.pm_channel))
            .map_err(|err| {
                warn!(
                    task_id = %ctx.task_id(),
                    error = %err,
                    "final power readback failed"
                )
            })
            .ok();
        let power_improvement = self.initial_power.zip(final_power).map(|(a, b)| b - a);

        let x = instrument.profile_data(ProfileSource::Alignment(ProfileAxis::X))?;
        let y = instrument.profile_data(ProfileSource::Alignment(ProfileAxis::Y))?;
        let z = if self.operation.is_focus() {
            Some(instrument.profile_data(ProfileSource::Alignment(ProfileAxis::Z))?)
        } else {
            None
        };

        let status = AlignmentStatus::Success;
        let phase = phase.or_else(|| self.last_phase.clone());
        Ok(AlignmentResult {
            success: true,
            status_code: status.code().to_string(),
            status_value: status.value(),
            status_description: status.description().to_string(),
            phase_code: phase.as_ref().map(|p| p.code.clone()),
            phase_value: phase.as_ref().map(|p| p.value),
            phase_description: phase.as_ref().map(|p| p.description.clone()),
            initial_power: self.initial_power,
            final_power,
            power_improvement,
            peak_position_x: peak_of(&x),
            peak_position_y: peak_of(&y),
            peak_position_z: z.as_deref().and_then(peak_of),
            z_mode: self.operation.z_mode,
            execution_time: seconds(elapsed),
            profile_points_x: x.len(),
            profile_points_y: y.len(),
            profile_points_z: z.as_ref().map(Vec::len),
        })
    }
}
