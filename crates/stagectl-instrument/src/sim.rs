/*
[INPUT]:  SimulationConfig, Instrument calls from worker threads
[OUTPUT]: SimulatedInstrument - time-driven stand-in for the vendor controller
[POS]:    Boundary layer - mock backend used by the daemon and the tests
[UPDATE]: When the controller model or its timing changes
[UPDATE]: Compute motion and phase progress from Instant on each call (no background thread)
*/

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::error::{InstrumentError, Result};
use crate::instrument::Instrument;
use crate::types::{
    AdjustingPhase, AdjustmentStage, AligningPhase, AlignmentParams, AlignmentStatus,
    AngleAdjustmentParams, AngleAdjustmentStatus, AngleProfile, Command, PollStatus,
    ProfileAxis, ProfileParams, ProfilePoint, ProfileSource, ProfileStatus, Readback,
    StatusCode, Subsystem,
};

const ADJUSTED_SIGNAL_GAIN: f64 = 2.0;
const ANGLE_PROFILE_POINTS: usize = 50;

/// Tunables of the simulated controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub axis_count: u8,
    /// Servo state of every axis at start-up.
    pub servo_on: bool,
    /// Time spent in each alignment or adjustment phase.
    pub phase_duration_ms: u64,
    /// Uniform noise amplitude applied to optical and analog readings.
    pub noise: f64,
    /// Optical power at the optimum, in watts.
    pub peak_power: f64,
    /// Gaussian beam radius, in µm.
    pub beam_width: f64,
    /// Optimum position of the X and Y main stages.
    pub optimum_x: f64,
    pub optimum_y: f64,
    /// Axes whose positions drive the optical power reading.
    pub power_axis_x: u8,
    pub power_axis_y: u8,
    pub focus_axis_z: u8,
    /// Analog signal level before angle adjustment, in volts.
    pub analog_level: f64,
    pub profile_points: usize,
    /// Fixed seed for reproducible noise.
    pub seed: Option<u64>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            axis_count: 12,
            servo_on: true,
            phase_duration_ms: 400,
            noise: 0.01,
            peak_power: 1.0e-3,
            beam_width: 10.0,
            optimum_x: 3.0,
            optimum_y: -2.0,
            power_axis_x: 7,
            power_axis_y: 8,
            focus_axis_z: 9,
            analog_level: 1.2,
            profile_points: 200,
            seed: None,
        }
    }
}

#[derive(Debug, Clone)]
struct Motion {
    from: f64,
    to: f64,
    speed: f64,
    started: Instant,
}

impl Motion {
    fn travel_time(&self) -> Duration {
        Duration::from_secs_f64((self.to - self.from).abs() / self.speed)
    }

    fn position_at(&self, now: Instant) -> f64 {
        let travelled = self.speed * now.saturating_duration_since(self.started).as_secs_f64();
        let span = self.to - self.from;
        if travelled >= span.abs() {
            self.to
        } else {
            self.from + travelled.copysign(span)
        }
    }

    fn is_finished(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.started) >= self.travel_time()
    }
}

#[derive(Debug, Clone)]
struct Axis {
    servo_on: bool,
    position: f64,
    motion: Option<Motion>,
}

impl Axis {
    fn position_at(&self, now: Instant) -> f64 {
        self.motion
            .as_ref()
            .map_or(self.position, |motion| motion.position_at(now))
    }

    fn refresh(&mut self, now: Instant) {
        if let Some(motion) = &self.motion {
            if motion.is_finished(now) {
                self.position = motion.to;
                self.motion = None;
            }
        }
    }

    fn halt(&mut self, now: Instant) {
        self.position = self.position_at(now);
        self.motion = None;
    }
}

enum Step {
    Phase(usize),
    Succeeded,
    Failed(StatusCode),
}

/// Function that walks through a fixed list of phases, then succeeds.
#[derive(Debug, Clone)]
struct PhasedRun {
    started: Instant,
    phases: Vec<StatusCode>,
    phase_duration: Duration,
    /// Fail with the status once the run reaches the given phase index.
    fail_at: Option<(usize, StatusCode)>,
    outcome: Option<PollStatus>,
}

impl PhasedRun {
    fn new(phases: Vec<StatusCode>, phase_duration: Duration, now: Instant) -> Self {
        Self {
            started: now,
            phases,
            phase_duration,
            fail_at: None,
            outcome: None,
        }
    }

    fn step(&self, now: Instant) -> Step {
        let elapsed = now.saturating_duration_since(self.started).as_millis();
        let index = (elapsed / self.phase_duration.as_millis().max(1)) as usize;
        if let Some((at, code)) = &self.fail_at {
            if index >= *at {
                return Step::Failed(code.clone());
            }
        }
        if index >= self.phases.len() {
            Step::Succeeded
        } else {
            Step::Phase(index)
        }
    }

    fn last_phase(&self) -> Option<StatusCode> {
        self.phases.last().cloned()
    }

    fn is_active(&self) -> bool {
        self.outcome.is_none()
    }

    fn status(&self, now: Instant) -> PollStatus {
        if let Some(outcome) = &self.outcome {
            return outcome.clone();
        }
        match self.step(now) {
            Step::Phase(index) => PollStatus::InProgress {
                phase: self.phases.get(index).cloned(),
            },
            Step::Succeeded => PollStatus::Success {
                phase: self.last_phase(),
            },
            Step::Failed(code) => PollStatus::Failure(code),
        }
    }
}

#[derive(Debug, Clone)]
struct AlignmentRun {
    run: PhasedRun,
    focus: bool,
    params: AlignmentParams,
}

#[derive(Debug, Clone)]
struct AngleRun {
    run: PhasedRun,
    params: AngleAdjustmentParams,
}

#[derive(Debug, Clone)]
struct ScanRun {
    params: ProfileParams,
    start: f64,
    outcome: Option<PollStatus>,
}

struct SimState {
    axes: Vec<Axis>,
    alignment: Option<AlignmentRun>,
    angle: HashMap<AdjustmentStage, AngleRun>,
    scan: Option<ScanRun>,
    analog_level: f64,
    profiles: HashMap<ProfileSource, Vec<ProfilePoint>>,
    rng: StdRng,
}

/// In-process controller model.
///
/// All state lives behind one mutex and is advanced lazily from wall-clock
/// time, so calls from any thread observe a consistent instrument.
pub struct SimulatedInstrument {
    config: SimulationConfig,
    state: Mutex<SimState>,
}

impl SimulatedInstrument {
    pub fn new(config: SimulationConfig) -> Self {
        let axes = (0..config.axis_count)
            .map(|_| Axis {
                servo_on: config.servo_on,
                position: 0.0,
                motion: None,
            })
            .collect();
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let state = SimState {
            axes,
            alignment: None,
            angle: HashMap::new(),
            scan: None,
            analog_level: config.analog_level,
            profiles: HashMap::new(),
            rng,
        };
        Self {
            config,
            state: Mutex::new(state),
        }
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    pub fn set_servo(&self, axis: u8, on: bool) -> Result<()> {
        let mut state = self.lock();
        let index = self.axis_index(axis)?;
        state.axes[index].servo_on = on;
        Ok(())
    }

    /// Current position of an axis, including motion in flight.
    pub fn position(&self, axis: u8) -> Result<f64> {
        let state = self.lock();
        let index = self.axis_index(axis)?;
        Ok(state.axes[index].position_at(Instant::now()))
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn axis_index(&self, axis: u8) -> Result<usize> {
        if axis == 0 || axis > self.config.axis_count {
            return Err(InstrumentError::InvalidAxis {
                axis,
                max: self.config.axis_count,
            });
        }
        Ok(usize::from(axis - 1))
    }

    fn check_channel(&self, channel: u8) -> Result<()> {
        if channel == 0 || channel > 12 {
            return Err(InstrumentError::InvalidChannel { channel });
        }
        Ok(())
    }

    fn phase_duration(&self) -> Duration {
        Duration::from_millis(self.config.phase_duration_ms)
    }

    fn noise(&self, state: &mut SimState) -> f64 {
        if self.config.noise > 0.0 {
            state.rng.gen_range(-self.config.noise..=self.config.noise)
        } else {
            0.0
        }
    }

    fn optimum(&self, axis: u8) -> f64 {
        if axis == self.config.power_axis_x {
            self.config.optimum_x
        } else if axis == self.config.power_axis_y {
            self.config.optimum_y
        } else {
            0.0
        }
    }

    fn gaussian(&self, offset: f64) -> f64 {
        let width = self.config.beam_width.max(f64::EPSILON);
        (-(offset * offset) / (2.0 * width * width)).exp()
    }

    fn optical_power(&self, state: &mut SimState, now: Instant) -> f64 {
        let mut coupling = 1.0;
        for axis in [self.config.power_axis_x, self.config.power_axis_y] {
            if let Ok(index) = self.axis_index(axis) {
                coupling *= self.gaussian(state.axes[index].position_at(now) - self.optimum(axis));
            }
        }
        let noise = self.noise(state);
        (self.config.peak_power * coupling * (1.0 + noise)).max(0.0)
    }

    fn sweep(
        &self,
        state: &mut SimState,
        center: f64,
        range: f64,
        optimum: f64,
        amplitude: f64,
        points: usize,
    ) -> Vec<ProfilePoint> {
        let points = points.max(2);
        let start = center - range / 2.0;
        let pitch = range / (points - 1) as f64;
        (0..points)
            .map(|index| {
                let position = start + pitch * index as f64;
                let noise = self.noise(state);
                ProfilePoint {
                    position,
                    signal: (amplitude * self.gaussian(position - optimum) * (1.0 + noise))
                        .max(0.0),
                }
            })
            .collect()
    }

    fn start_motion(&self, state: &mut SimState, axis: u8, target: f64, speed: f64) -> Result<()> {
        let index = self.axis_index(axis)?;
        let now = Instant::now();
        let entry = &mut state.axes[index];
        entry.refresh(now);
        if !entry.servo_on {
            return Err(InstrumentError::ServoOff { axis });
        }
        if entry.motion.is_some() {
            return Err(InstrumentError::Busy(format!("axis {axis} is moving")));
        }
        if speed <= 0.0 {
            return Err(InstrumentError::Rejected {
                code: StatusCode::new("InvalidSpeed", -1, "Speed must be positive"),
            });
        }
        entry.motion = Some(Motion {
            from: entry.position,
            to: target,
            speed,
            started: now,
        });
        debug!(axis, from = entry.position, to = target, speed, "sim: axis move started");
        Ok(())
    }

    fn start_alignment(
        &self,
        state: &mut SimState,
        params: &AlignmentParams,
        focus: bool,
    ) -> Result<()> {
        if state.alignment.as_ref().is_some_and(|run| run.run.is_active()) {
            return Err(InstrumentError::Busy("alignment already running".to_string()));
        }
        let x = self.axis_index(params.main_stage_x)?;
        let y = self.axis_index(params.main_stage_y)?;
        self.check_channel(params.pm_channel)?;

        let mut phases = vec![
            AligningPhase::Initializing,
            AligningPhase::FieldSearching,
            AligningPhase::PeakSearchingX,
            AligningPhase::PeakSearchingY,
        ];
        if focus {
            phases.push(AligningPhase::PeakSearchingZ);
        }
        let mut run = PhasedRun::new(
            phases.into_iter().map(AligningPhase::to_status_code).collect(),
            self.phase_duration(),
            Instant::now(),
        );
        if !state.axes[x].servo_on || !state.axes[y].servo_on {
            run.fail_at = Some((1, AlignmentStatus::ServoIsNotReady.to_status_code()));
        }
        state.alignment = Some(AlignmentRun {
            run,
            focus,
            params: params.clone(),
        });
        debug!(focus, "sim: alignment started");
        Ok(())
    }

    fn start_angle(&self, state: &mut SimState, params: &AngleAdjustmentParams) -> Result<()> {
        if state.angle.get(&params.stage).is_some_and(|run| run.run.is_active()) {
            return Err(InstrumentError::Busy(format!(
                "{} angle adjustment already running",
                params.stage
            )));
        }
        self.check_channel(params.signal_channel)?;
        let phases = [
            AdjustingPhase::Initializing,
            AdjustingPhase::ContactingZ,
            AdjustingPhase::AdjustingTx,
            AdjustingPhase::AdjustingTy,
        ];
        let run = PhasedRun::new(
            phases.into_iter().map(AdjustingPhase::to_status_code).collect(),
            self.phase_duration(),
            Instant::now(),
        );
        state.angle.insert(
            params.stage,
            AngleRun {
                run,
                params: params.clone(),
            },
        );
        debug!(stage = %params.stage, "sim: angle adjustment started");
        Ok(())
    }

    fn start_scan(&self, state: &mut SimState, params: &ProfileParams) -> Result<()> {
        if state.scan.as_ref().is_some_and(|scan| scan.outcome.is_none()) {
            return Err(InstrumentError::Busy("profile scan already running".to_string()));
        }
        self.check_channel(params.signal_ch1)?;
        if params.scan_speed <= 0.0 || params.scan_range <= 0.0 {
            return Err(InstrumentError::Rejected {
                code: ProfileStatus::InvalidParameter.to_status_code(),
            });
        }
        let index = self.axis_index(params.scan_axis)?;
        let now = Instant::now();
        let axis = &mut state.axes[index];
        axis.refresh(now);
        if !axis.servo_on {
            return Err(InstrumentError::ServoOff {
                axis: params.scan_axis,
            });
        }
        let center = axis.position;
        let start = center - params.scan_range / 2.0;
        axis.position = start;
        axis.motion = Some(Motion {
            from: start,
            to: start + params.scan_range,
            speed: params.scan_speed,
            started: now,
        });
        state.scan = Some(ScanRun {
            params: params.clone(),
            start,
            outcome: None,
        });
        debug!(axis = params.scan_axis, range = params.scan_range, "sim: profile scan started");
        Ok(())
    }

    /// Settle finished functions: apply their end state and record profiles.
    fn refresh(&self, state: &mut SimState, now: Instant) {
        for axis in &mut state.axes {
            axis.refresh(now);
        }

        if let Some(mut alignment) = state.alignment.take() {
            if alignment.run.is_active() {
                match alignment.run.step(now) {
                    Step::Succeeded => {
                        self.finish_alignment(state, &alignment);
                        alignment.run.outcome = Some(PollStatus::Success {
                            phase: alignment.run.last_phase(),
                        });
                    }
                    Step::Failed(code) => alignment.run.outcome = Some(PollStatus::Failure(code)),
                    Step::Phase(_) => {}
                }
            }
            state.alignment = Some(alignment);
        }

        let stages: Vec<AdjustmentStage> = state.angle.keys().copied().collect();
        for stage in stages {
            let Some(mut adjustment) = state.angle.remove(&stage) else {
                continue;
            };
            if adjustment.run.is_active() {
                match adjustment.run.step(now) {
                    Step::Succeeded => {
                        self.finish_angle(state, &adjustment);
                        adjustment.run.outcome = Some(PollStatus::Success {
                            phase: adjustment.run.last_phase(),
                        });
                    }
                    Step::Failed(code) => adjustment.run.outcome = Some(PollStatus::Failure(code)),
                    Step::Phase(_) => {}
                }
            }
            state.angle.insert(stage, adjustment);
        }

        if let Some(mut scan) = state.scan.take() {
            if scan.outcome.is_none() {
                let moving = self
                    .axis_index(scan.params.scan_axis)
                    .map(|index| state.axes[index].motion.is_some())
                    .unwrap_or(false);
                if !moving {
                    self.finish_scan(state, &scan);
                    scan.outcome = Some(PollStatus::success());
                }
            }
            state.scan = Some(scan);
        }
    }

    fn finish_alignment(&self, state: &mut SimState, alignment: &AlignmentRun) {
        let params = &alignment.params;
        let amplitude = self.config.peak_power;
        let points = self.config.profile_points;
        let records = [
            (ProfileAxis::X, params.main_stage_x, params.search_range_x),
            (ProfileAxis::Y, params.main_stage_y, params.search_range_y),
        ];
        for (profile_axis, axis, range) in records {
            let Ok(index) = self.axis_index(axis) else {
                continue;
            };
            let center = state.axes[index].position;
            let optimum = self.optimum(axis);
            let sweep = self.sweep(state, center, range, optimum, amplitude, points);
            state.profiles.insert(ProfileSource::Alignment(profile_axis), sweep);
            state.axes[index].position = optimum;
        }
        if alignment.focus {
            if let Ok(index) = self.axis_index(self.config.focus_axis_z) {
                let center = state.axes[index].position;
                let sweep =
                    self.sweep(state, center, params.search_range_x, 0.0, amplitude, points);
                state.profiles.insert(ProfileSource::Alignment(ProfileAxis::Z), sweep);
                state.axes[index].position = 0.0;
            }
        } else {
            state.profiles.remove(&ProfileSource::Alignment(ProfileAxis::Z));
        }
    }

    fn finish_angle(&self, state: &mut SimState, adjustment: &AngleRun) {
        let params = &adjustment.params;
        let level = state.analog_level;
        let push = params.push_distance;
        let contact = self.sweep(state, push / 2.0, push, push, level, ANGLE_PROFILE_POINTS);
        let tx_range = params.angle_search_range_tx;
        let tx = self.sweep(state, 0.0, tx_range, 0.0, level, ANGLE_PROFILE_POINTS);
        let ty_range = params.angle_search_range_ty;
        let ty = self.sweep(state, 0.0, ty_range, 0.0, level, ANGLE_PROFILE_POINTS);
        state.profiles.insert(ProfileSource::Angle(params.stage, AngleProfile::ContactZ), contact);
        state.profiles.insert(ProfileSource::Angle(params.stage, AngleProfile::AdjustingTx), tx);
        state.profiles.insert(ProfileSource::Angle(params.stage, AngleProfile::AdjustingTy), ty);
        state.analog_level = self.config.analog_level * ADJUSTED_SIGNAL_GAIN;
    }

    fn finish_scan(&self, state: &mut SimState, scan: &ScanRun) {
        let params = &scan.params;
        let center = scan.start + params.scan_range / 2.0;
        let optimum = self.optimum(params.scan_axis);
        let amplitude = state.analog_level;
        let points = self.config.profile_points;
        let sweep = self.sweep(state, center, params.scan_range, optimum, amplitude, points);
        state.profiles.insert(ProfileSource::Scan, sweep);
    }
}

impl Default for SimulatedInstrument {
    fn default() -> Self {
        Self::new(SimulationConfig::default())
    }
}

impl Instrument for SimulatedInstrument {
    fn initiate(&self, command: &Command) -> Result<()> {
        let mut state = self.lock();
        self.refresh(&mut state, Instant::now());
        match command {
            Command::MoveAbsolute { axis, position, speed } => {
                self.start_motion(&mut state, *axis, *position, *speed)
            }
            Command::MoveRelative { axis, distance, speed } => {
                let index = self.axis_index(*axis)?;
                let target = state.axes[index].position + distance;
                self.start_motion(&mut state, *axis, target, *speed)
            }
            Command::FlatAlignment(params) => self.start_alignment(&mut state, params, false),
            Command::FocusAlignment(params) => {
                self.start_alignment(&mut state, &params.alignment, true)
            }
            Command::AngleAdjustment(params) => self.start_angle(&mut state, params),
            Command::ProfileMeasurement(params) => self.start_scan(&mut state, params),
        }
    }

    fn poll_status(&self, subsystem: Subsystem) -> Result<PollStatus> {
        let now = Instant::now();
        let mut state = self.lock();
        self.refresh(&mut state, now);
        let status = match subsystem {
            Subsystem::Axis(axis) => {
                let index = self.axis_index(axis)?;
                if state.axes[index].motion.is_some() {
                    PollStatus::in_progress()
                } else {
                    PollStatus::success()
                }
            }
            Subsystem::Alignment => state
                .alignment
                .as_ref()
                .map(|alignment| alignment.run.status(now))
                .unwrap_or_else(|| PollStatus::Failure(AlignmentStatus::Stopping.to_status_code())),
            Subsystem::AngleAdjustment(stage) => state
                .angle
                .get(&stage)
                .map(|adjustment| adjustment.run.status(now))
                .unwrap_or_else(|| {
                    PollStatus::Failure(AngleAdjustmentStatus::Stopping.to_status_code())
                }),
            Subsystem::Profile => match &state.scan {
                Some(ScanRun { outcome: Some(outcome), .. }) => outcome.clone(),
                Some(_) => PollStatus::InProgress {
                    phase: Some(ProfileStatus::Profiling.to_status_code()),
                },
                None => PollStatus::Failure(ProfileStatus::Stopping.to_status_code()),
            },
        };
        Ok(status)
    }

    fn read_value(&self, readback: Readback) -> Result<f64> {
        let now = Instant::now();
        let mut state = self.lock();
        self.refresh(&mut state, now);
        match readback {
            Readback::AxisPosition(axis) => {
                let index = self.axis_index(axis)?;
                Ok(state.axes[index].position_at(now))
            }
            Readback::OpticalPower(channel) => {
                self.check_channel(channel)?;
                Ok(self.optical_power(&mut state, now))
            }
            Readback::AnalogInput(channel) => {
                self.check_channel(channel)?;
                let noise = self.noise(&mut state);
                Ok(state.analog_level * (1.0 + noise))
            }
        }
    }

    fn stop(&self, subsystem: Subsystem) -> Result<()> {
        let now = Instant::now();
        let mut state = self.lock();
        self.refresh(&mut state, now);
        match subsystem {
            Subsystem::Axis(axis) => {
                let index = self.axis_index(axis)?;
                state.axes[index].halt(now);
            }
            Subsystem::Alignment => {
                let active = state.alignment.as_mut().filter(|run| run.run.is_active());
                if let Some(alignment) = active {
                    alignment.run.outcome =
                        Some(PollStatus::Failure(AlignmentStatus::Stopping.to_status_code()));
                }
            }
            Subsystem::AngleAdjustment(stage) => {
                let active = state.angle.get_mut(&stage).filter(|run| run.run.is_active());
                if let Some(adjustment) = active {
                    adjustment.run.outcome =
                        Some(PollStatus::Failure(AngleAdjustmentStatus::Stopping.to_status_code()));
                }
            }
            Subsystem::Profile => {
                let active_axis = state
                    .scan
                    .as_ref()
                    .filter(|scan| scan.outcome.is_none())
                    .map(|scan| scan.params.scan_axis);
                if let Some(axis) = active_axis {
                    let index = self.axis_index(axis)?;
                    state.axes[index].halt(now);
                    if let Some(scan) = state.scan.as_mut() {
                        let stopping = ProfileStatus::Stopping.to_status_code();
                        scan.outcome = Some(PollStatus::Failure(stopping));
                    }
                }
            }
        }
        debug!(%subsystem, "sim: stop");
        Ok(())
    }

    fn is_servo_on(&self, axis: u8) -> Result<bool> {
        let state = self.lock();
        let index = self.axis_index(axis)?;
        Ok(state.axes[index].servo_on)
    }

    fn profile_data(&self, source: ProfileSource) -> Result<Vec<ProfilePoint>> {
        let mut state = self.lock();
        self.refresh(&mut state, Instant::now());
        Ok(state.profiles.get(&source).cloned().unwrap_or_default())
    }
}
