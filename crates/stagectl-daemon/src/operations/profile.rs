/*
[INPUT]:  ProfileParams (single linear axis sweep)
[OUTPUT]: ProfileOperation body, scan position progress, ProfileResult with peak
[POS]:    Operations layer - profile measurement on the cancellable poll loop
[UPDATE]: When changing scan validation, peak extraction or result fields
*/

use serde::{Deserialize, Serialize};
use serde_json::Value;
use stagectl_instrument::{
    Command, Instrument, ProfileParams, ProfileSource, Readback, StatusCode, Subsystem, find_peak,
};
use std::time::Duration;
use tracing::info;

use super::{check_axis, check_positive, seconds};
use crate::executor::error::Result;
use crate::executor::{
    CancellablePoll, Operation, OperationContext, OperationError, PolledOperation, Timing,
};
use crate::task::OperationKind;

pub const DEFAULT_TIMING: Timing = Timing {
    poll_interval_ms: 100,
    start_delay_ms: 100,
    settle_ms: 200,
    stop_settle_ms: 200,
    timeout_ms: 120_000,
};

/// Axes that can be swept: main stage X/Y/Z on both sides.
pub const LINEAR_AXES: [u8; 6] = [1, 2, 3, 7, 8, 9];

pub(super) fn validate(params: &ProfileParams) -> Result<()> {
    if !LINEAR_AXES.contains(&params.scan_axis) {
        return Err(OperationError::validation(format!(
            "scan_axis must be one of {LINEAR_AXES:?}, got {}",
            params.scan_axis
        )));
    }
    check_positive("scan_range", params.scan_range)?;
    check_positive("scan_speed", params.scan_speed)?;
    check_axis("signal_ch1", params.signal_ch1)?;
    if params.signal_ch2 != 0 {
        check_axis("signal_ch2", params.signal_ch2)?;
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
pub struct ProfileProgress {
    pub scan_axis: u8,
    pub current_position: f64,
    pub progress_percent: f64,
    pub elapsed_time: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileResult {
    pub success: bool,
    pub total_points: usize,
    pub peak_position: f64,
    pub peak_value: f64,
    pub peak_index: usize,
    pub main_axis_number: u8,
    pub initial_position: f64,
    pub final_position: f64,
    pub signal_ch_number: u8,
    pub scan_range: f64,
    pub scan_speed: f64,
    pub execution_time: f64,
}

pub struct ProfileOperation {
    params: ProfileParams,
    timing: Timing,
}

impl ProfileOperation {
    pub fn new(params: ProfileParams, timing: Timing) -> Self {
        Self { params, timing }
    }
}

impl Operation for ProfileOperation {
    fn kind(&self) -> OperationKind {
        OperationKind::ProfileMeasurement
    }

    fn run(&self, ctx: &OperationContext, instrument: &dyn Instrument) -> Result<Value> {
        validate(&self.params)?;
        let initial_position =
            instrument.read_value(Readback::AxisPosition(self.params.scan_axis))?;
        ctx.report(&ProfileProgress {
            scan_axis: self.params.scan_axis,
            current_position: initial_position,
            progress_percent: 0.0,
            elapsed_time: 0.0,
            message: Some(format!(
                "Scanning axis {} over {} um at {} um/s",
                self.params.scan_axis, self.params.scan_range, self.params.scan_speed
            )),
        });

        let mut scan = Scan {
            params: &self.params,
            initial_position,
        };
        let result = CancellablePoll::new(ctx, instrument, self.timing).run(&mut scan)?;
        info!(
            task_id = %ctx.task_id(),
            axis = self.params.scan_axis,
            points = result.total_points,
            peak_position = result.peak_position,
            "profile measurement finished"
        );
        serde_json::to_value(result).map_err(|err| OperationError::Measurement(err.to_string()))
    }
}

struct Scan<'a> {
    params: &'a ProfileParams,
    initial_position: f64,
}

impl Scan<'_> {
    /// The sweep is centred on the starting position.
    fn percent(&self, position: f64) -> f64 {
        let start = self.initial_position - self.params.scan_range / 2.0;
        ((position - start) / self.params.scan_range * 100.0).clamp(0.0, 100.0)
    }
}

impl PolledOperation for Scan<'_> {
    type Output = ProfileResult;

    fn name(&self) -> &'static str {
        "Profile measurement"
    }

    fn subsystem(&self) -> Subsystem {
        Subsystem::Profile
    }

    fn initiate(&mut self, _ctx: &OperationContext, instrument: &dyn Instrument) -> Result<()> {
        instrument.initiate(&Command::ProfileMeasurement(self.params.clone()))?;
        Ok(())
    }

    fn on_progress(
        &mut self,
        ctx: &OperationContext,
        instrument: &dyn Instrument,
        _phase: Option<&StatusCode>,
        elapsed: Duration,
    ) {
        let readback = Readback::AxisPosition(self.params.scan_axis);
        let Ok(current_position) = instrument.read_value(readback) else {
            return;
        };
        ctx.report(&ProfileProgress {
            scan_axis: self.params.scan_axis,
            current_position,
            progress_percent: self.percent(current_position),
            elapsed_time: seconds(elapsed),
            message: None,
        });
    }

    fn finish(
        &mut self,
        _ctx: &OperationContext,
        instrument: &dyn Instrument,
        _phase: Option<StatusCode>,
        elapsed: Duration,
    ) -> Result<ProfileResult> {
        let points = instrument.profile_data(ProfileSource::Scan)?;
        let (peak_index, peak) = find_peak(&points).ok_or_else(|| {
            OperationError::Measurement("profile scan returned no data points".to_string())
        })?;
        let final_position =
            instrument.read_value(Readback::AxisPosition(self.params.scan_axis))?;

        Ok(ProfileResult {
            success: true,
            total_points: points.len(),
            peak_position: peak.position,
            peak_value: peak.signal,
            peak_index,
            main_axis_number: self.params.scan_axis,
            initial_position: self.initial_position,
            final_position,
            signal_ch_number: self.params.signal_ch1,
            scan_range: self.params.scan_range,
            scan_speed: self.params.scan_speed,
            execution_time: seconds(elapsed),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn default_params_are_valid() {
        assert!(validate(&ProfileParams::default()).is_ok());
    }

    #[rstest]
    #[case(ProfileParams { scan_axis: 4, ..ProfileParams::default() }, "scan_axis")]
    #[case(ProfileParams { scan_range: 0.0, ..ProfileParams::default() }, "scan_range")]
    #[case(ProfileParams { scan_speed: -1.0, ..ProfileParams::default() }, "scan_speed")]
    #[case(ProfileParams { signal_ch1: 0, ..ProfileParams::default() }, "signal_ch1")]
    fn invalid_params_are_rejected(#[case] params: ProfileParams, #[case] field: &str) {
        match validate(&params) {
            Err(OperationError::Validation(message)) => assert!(message.starts_with(field)),
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn percent_is_measured_from_sweep_start() {
        let params = ProfileParams {
            scan_range: 20.0,
            ..ProfileParams::default()
        };
        let scan = Scan {
            params: &params,
            initial_position: 100.0,
        };
        assert_eq!(scan.percent(90.0), 0.0);
        assert_eq!(scan.percent(100.0), 50.0);
        assert_eq!(scan.percent(115.0), 100.0);
    }
}
