/*
[INPUT]:  Instrument poll/readback vocabulary
[OUTPUT]: StatusCode, Subsystem, PollStatus, Readback, profile data types
[POS]:    Data layer - values exchanged across the Instrument trait
[UPDATE]: When the instrument boundary gains a new subsystem or readback
*/

use serde::{Deserialize, Serialize};
use std::fmt;

use super::enums::AdjustmentStage;

/// Structured vendor status: stable name, integer value and human description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCode {
    pub code: String,
    pub value: i32,
    pub description: String,
}

impl StatusCode {
    pub fn new(code: impl Into<String>, value: i32, description: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            value,
            description: description.into(),
        }
    }

    /// Every vendor table reports a normal stop as value 0.
    pub fn is_stopping(&self) -> bool {
        self.value == 0
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.code, self.value, self.description)
    }
}

/// Unit of the instrument that can be polled and stopped independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "unit", content = "id", rename_all = "snake_case")]
pub enum Subsystem {
    Axis(u8),
    Alignment,
    AngleAdjustment(AdjustmentStage),
    Profile,
}

impl fmt::Display for Subsystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Subsystem::Axis(axis) => write!(f, "axis {axis}"),
            Subsystem::Alignment => f.write_str("alignment"),
            Subsystem::AngleAdjustment(stage) => write!(f, "angle adjustment ({stage})"),
            Subsystem::Profile => f.write_str("profile"),
        }
    }
}

/// Result of a single status query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollStatus {
    InProgress { phase: Option<StatusCode> },
    Success { phase: Option<StatusCode> },
    Failure(StatusCode),
}

impl PollStatus {
    pub fn in_progress() -> Self {
        PollStatus::InProgress { phase: None }
    }

    pub fn success() -> Self {
        PollStatus::Success { phase: None }
    }

    pub fn is_in_progress(&self) -> bool {
        matches!(self, PollStatus::InProgress { .. })
    }
}

/// Best-effort numeric readback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Readback {
    AxisPosition(u8),
    /// Power meter channel, in watts.
    OpticalPower(u8),
    /// Analog input channel, in volts.
    AnalogInput(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProfilePoint {
    pub position: f64,
    pub signal: f64,
}

/// Axis of the alignment profile record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProfileAxis {
    X,
    Y,
    Z,
}

/// Profile record captured during one angle adjustment phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AngleProfile {
    ContactZ,
    AdjustingTx,
    AdjustingTy,
}

/// Which recorded profile to fetch after an operation finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProfileSource {
    Alignment(ProfileAxis),
    Angle(AdjustmentStage, AngleProfile),
    Scan,
}

/// Index and point with the highest signal. First occurrence wins on ties.
pub fn find_peak(points: &[ProfilePoint]) -> Option<(usize, ProfilePoint)> {
    points
        .iter()
        .copied()
        .enumerate()
        .fold(None, |best, (index, point)| match best {
            Some((_, current)) if current.signal >= point.signal => best,
            _ => Some((index, point)),
        })
}
