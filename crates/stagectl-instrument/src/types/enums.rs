/*
[INPUT]:  Vendor status/phase tables reported by the instrument library
[OUTPUT]: Typed status enums with stable code, integer value and description
[POS]:    Data layer - status vocabulary shared by the simulator and the daemon
[UPDATE]: When the vendor library adds or renumbers a status
*/

use serde::{Deserialize, Serialize};

use super::models::StatusCode;

macro_rules! status_table {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $($variant:ident = ($value:expr, $code:literal, $description:literal),)+
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant,)+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant,)+];

            /// Vendor name of the status, e.g. `"StageOnLimit"`.
            pub fn code(self) -> &'static str {
                match self {
                    $($name::$variant => $code,)+
                }
            }

            pub fn value(self) -> i32 {
                match self {
                    $($name::$variant => $value,)+
                }
            }

            pub fn description(self) -> &'static str {
                match self {
                    $($name::$variant => $description,)+
                }
            }

            pub fn from_value(value: i32) -> Option<Self> {
                Self::ALL.iter().copied().find(|status| status.value() == value)
            }

            pub fn from_code(code: &str) -> Option<Self> {
                Self::ALL.iter().copied().find(|status| status.code() == code)
            }

            pub fn to_status_code(self) -> StatusCode {
                StatusCode::new(self.code(), self.value(), self.description())
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.code())
            }
        }
    };
}

status_table! {
    /// Overall status of a flat or focus optical alignment.
    pub enum AlignmentStatus {
        Stopping = (0, "Stopping", "Alignment is stopping normally"),
        Success = (1, "Success", "Alignment completed successfully"),
        Aligning = (2, "Aligning", "Executing alignment"),
        FieldSearchRangeOver = (3, "FieldSearchRangeOver", "Failed for exceeding field search range"),
        ProfileDataOver = (4, "ProfileDataOver", "Exceed recording range of profile data"),
        PeakSearchCountOver = (5, "PeakSearchCountOver", "Failed for exceeding maximum number of peak search count"),
        PeakSearchRangeOver = (6, "PeakSearchRangeOver", "Failed for exceeding peak search range"),
        InvalidParameter = (7, "InvalidParameter", "Invalid parameter"),
        ServoIsNotReady = (8, "ServoIsNotReady", "Using axis is not turned on"),
        ServoIsAlarm = (9, "ServoIsAlarm", "Servo alarm is occurring for using axis"),
        StageOnLimit = (10, "StageOnLimit", "A position limit of using axis is detected"),
        VoltageLimit = (11, "VoltageLimit", "Signal voltage reached at maximum limit"),
        PmRangeLimit = (12, "PMRangeLimit", "Could not range up due to PM range limit"),
        PmInitRangeChangeFail = (13, "PMInitRangeChangeFail", "Power meter initial range setting failed"),
        PmDisconnected = (14, "PMDisconnected", "Power meter is not connected"),
        RotationAdjustmentFail = (15, "RotationAdjustmentFail", "Failed for rotation adjustment"),
        InPositionFail = (16, "InPositionFail", "Not reached to in-position state"),
        TorqueLimit = (17, "TorqueLimit", "Stopped by torque limit"),
        Interrupted = (18, "Interrupted", "Alignment interrupted"),
    }
}

status_table! {
    /// Sub-phase of a running alignment.
    pub enum AligningPhase {
        NotAligning = (0, "NotAligning", "Not aligning"),
        Initializing = (1, "Initializing", "Executing initializing process"),
        FieldSearching = (2, "FieldSearching", "Field searching"),
        PeakSearchingX = (3, "PeakSearchingX", "X-axis peak searching"),
        PeakSearchingY = (4, "PeakSearchingY", "Y-axis peak searching"),
        PeakSearchingZ = (5, "PeakSearchingZ", "Z-axis peak searching"),
        PeakSearchXCh2 = (6, "PeakSearchXCh2", "Ch2 X-axis peak searching"),
    }
}

status_table! {
    /// Overall status of an angle adjustment.
    pub enum AngleAdjustmentStatus {
        Stopping = (0, "Stopping", "Angle adjustment is stopping normally"),
        Success = (1, "Success", "Angle adjustment completed successfully"),
        Adjusting = (2, "Adjusting", "Executing angle adjustment"),
        ProfileDataOver = (3, "ProfileDataOver", "Exceeded recording range of profile data"),
        InvalidParameter = (4, "InvalidParameter", "Invalid parameter"),
        ServoIsNotReady = (5, "ServoIsNotReady", "Using axis is not turned on"),
        ServoIsAlarm = (6, "ServoIsAlarm", "Servo alarm is occurring for using axis"),
        StageOnLimit = (7, "StageOnLimit", "A position limit of using axis is detected"),
        SignalLowerLimit = (8, "SignalLowerLimit", "Signal reached lower limit"),
        CouldNotContact = (9, "CouldNotContact", "Failed for no contact detection"),
        AdjustCountOver = (10, "AdjustCountOver", "Failed for exceeding maximum number of retry count"),
        AngleAdjustRangeOver = (11, "AngleAdjustRangeOver", "Failed for exceeding angle adjustment range"),
        LostContact = (12, "LostContact", "Failed for lost contact detection while adjusting"),
    }
}

status_table! {
    /// Sub-phase of a running angle adjustment.
    pub enum AdjustingPhase {
        NotAdjusting = (0, "NotAdjusting", "Not adjusting"),
        Initializing = (1, "Initializing", "Executing initializing process"),
        ContactingZ = (2, "ContactingZ", "Detecting contact with Z-axis"),
        AdjustingTx = (3, "AdjustingTx", "Adjusting axis specified by angleAxisNumberTx"),
        AdjustingTy = (4, "AdjustingTy", "Adjusting axis specified by angleAxisNumberTy"),
    }
}

status_table! {
    /// Overall status of a single-axis profile scan.
    pub enum ProfileStatus {
        Stopping = (0, "Stopping", "Stopped"),
        Success = (1, "Success", "Normal termination"),
        Profiling = (2, "Profiling", "Executing profile measurement"),
        ProfileDataOver = (3, "ProfileDataOver", "Exceeded profile data store range"),
        InvalidParameter = (4, "InvalidParameter", "Invalid profile measurement parameters"),
        ServosNotReady = (5, "ServosNotReady", "Servo not in Ready state"),
        ServosAlarm = (6, "ServosAlarm", "Servo alarm"),
        StageOnLimit = (7, "StageOnLimit", "Stage reached at limit sensor"),
        TorqueLimit = (8, "TorqueLimit", "Stopped by torque limit"),
    }
}

impl AdjustingPhase {
    /// Nominal completion percentage while the adjustment is in this phase.
    pub fn progress_percent(self) -> u8 {
        match self {
            AdjustingPhase::NotAdjusting => 0,
            AdjustingPhase::Initializing => 20,
            AdjustingPhase::ContactingZ => 40,
            AdjustingPhase::AdjustingTx => 60,
            AdjustingPhase::AdjustingTy => 80,
        }
    }
}

/// Which side of the instrument an angle adjustment runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdjustmentStage {
    Left,
    Right,
}

impl AdjustmentStage {
    pub fn number(self) -> u8 {
        match self {
            AdjustmentStage::Left => 1,
            AdjustmentStage::Right => 2,
        }
    }
}

impl std::fmt::Display for AdjustmentStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AdjustmentStage::Left => f.write_str("left"),
            AdjustmentStage::Right => f.write_str("right"),
        }
    }
}

/// Z-axis search trajectory for focus alignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZMode {
    #[default]
    Round,
    Triangle,
    Linear,
}
