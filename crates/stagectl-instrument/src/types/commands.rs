/*
[INPUT]:  Operation parameters accepted by the vendor library
[OUTPUT]: Command enum and per-function parameter structs with serde defaults
[POS]:    Data layer - arguments of Instrument::initiate
[UPDATE]: When the vendor parameter contract changes
*/

use serde::{Deserialize, Serialize};

use super::enums::{AdjustmentStage, ZMode};

/// Initiating call for one long-running instrument function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    MoveAbsolute { axis: u8, position: f64, speed: f64 },
    MoveRelative { axis: u8, distance: f64, speed: f64 },
    FlatAlignment(AlignmentParams),
    FocusAlignment(FocusAlignmentParams),
    AngleAdjustment(AngleAdjustmentParams),
    ProfileMeasurement(ProfileParams),
}

/// Flat (two-axis) optical alignment parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlignmentParams {
    pub main_stage_x: u8,
    pub main_stage_y: u8,
    /// 0 when no sub stage is used.
    pub sub_stage_xy: u8,
    pub pm_channel: u8,
    pub analog_channel: u8,
    /// Measurement wavelength in nm.
    pub wavelength: u32,
    pub field_search_threshold: f64,
    /// Peak search threshold in percent.
    pub peak_search_threshold: f64,
    pub search_range_x: f64,
    pub search_range_y: f64,
    pub field_search_pitch_x: f64,
    pub field_search_pitch_y: f64,
    pub field_search_speed_x: f64,
    pub field_search_speed_y: f64,
    pub peak_search_speed_x: f64,
    pub peak_search_speed_y: f64,
    pub smoothing_range_x: u32,
    pub smoothing_range_y: u32,
    pub convergent_range_x: f64,
    pub convergent_range_y: f64,
    pub comparison_count: u32,
    pub max_repeat_count: u32,
}

impl Default for AlignmentParams {
    fn default() -> Self {
        Self {
            main_stage_x: 7,
            main_stage_y: 8,
            sub_stage_xy: 0,
            pm_channel: 1,
            analog_channel: 1,
            wavelength: 1310,
            field_search_threshold: 0.0,
            peak_search_threshold: 10.0,
            search_range_x: 15.0,
            search_range_y: 10.0,
            field_search_pitch_x: 1.0,
            field_search_pitch_y: 1.0,
            field_search_speed_x: 100.0,
            field_search_speed_y: 100.0,
            peak_search_speed_x: 10.0,
            peak_search_speed_y: 10.0,
            smoothing_range_x: 40,
            smoothing_range_y: 40,
            convergent_range_x: 0.5,
            convergent_range_y: 0.5,
            comparison_count: 2,
            max_repeat_count: 10,
        }
    }
}

/// Focus (three-axis) alignment: the flat parameter set plus a Z trajectory.
///
/// `Default` uses the wide focus search window; fields omitted when
/// deserializing fall back to the flat defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FocusAlignmentParams {
    #[serde(default)]
    pub z_mode: ZMode,
    #[serde(flatten)]
    pub alignment: AlignmentParams,
}

impl Default for FocusAlignmentParams {
    fn default() -> Self {
        Self {
            z_mode: ZMode::Round,
            alignment: AlignmentParams {
                field_search_threshold: 0.1,
                peak_search_threshold: 40.0,
                search_range_x: 500.0,
                search_range_y: 500.0,
                field_search_pitch_x: 5.0,
                field_search_pitch_y: 5.0,
                field_search_speed_x: 1000.0,
                field_search_speed_y: 1000.0,
                peak_search_speed_x: 5.0,
                peak_search_speed_y: 5.0,
                smoothing_range_x: 50,
                smoothing_range_y: 50,
                convergent_range_x: 1.0,
                convergent_range_y: 1.0,
                ..AlignmentParams::default()
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AngleAdjustmentParams {
    pub stage: AdjustmentStage,
    /// Analog input channel monitored during adjustment.
    pub signal_channel: u8,
    /// Gap left after adjustment, in µm.
    pub gap: f64,
    pub signal_lower_limit: f64,
    pub contact_search_range: f64,
    pub contact_search_speed: f64,
    pub push_distance: f64,
    /// 0 disables the Tx axis.
    pub angle_axis_tx: u8,
    /// 0 disables the Ty axis.
    pub angle_axis_ty: u8,
    pub angle_search_range_tx: f64,
    pub angle_search_range_ty: f64,
    pub angle_search_speed_tx: f64,
    pub angle_search_speed_ty: f64,
    pub angle_max_count: u32,
}

impl Default for AngleAdjustmentParams {
    fn default() -> Self {
        Self {
            stage: AdjustmentStage::Left,
            signal_channel: 1,
            gap: 4.0,
            signal_lower_limit: 0.4,
            contact_search_range: 5000.0,
            contact_search_speed: 100.0,
            push_distance: 20.0,
            angle_axis_tx: 0,
            angle_axis_ty: 0,
            angle_search_range_tx: 5.0,
            angle_search_range_ty: 5.0,
            angle_search_speed_tx: 1.0,
            angle_search_speed_ty: 1.0,
            angle_max_count: 5,
        }
    }
}

/// Single-axis profile scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileParams {
    pub scan_axis: u8,
    /// Scan range in µm, centred on the current position.
    pub scan_range: f64,
    /// Scan speed in µm/s.
    pub scan_speed: f64,
    pub signal_ch1: u8,
    /// 0 when unused.
    pub signal_ch2: u8,
    pub accel_rate: f64,
    pub decel_rate: f64,
    pub smoothing: u32,
}

impl Default for ProfileParams {
    fn default() -> Self {
        Self {
            scan_axis: 1,
            scan_range: 20.0,
            scan_speed: 25.0,
            signal_ch1: 1,
            signal_ch2: 0,
            accel_rate: 1000.0,
            decel_rate: 1000.0,
            smoothing: 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_params_fill_defaults() {
        let params: AlignmentParams =
            serde_json::from_value(serde_json::json!({"search_range_x": 30.0})).unwrap();
        assert_eq!(params.search_range_x, 30.0);
        assert_eq!(params.main_stage_x, 7);
        assert_eq!(params.wavelength, 1310);
    }

    #[test]
    fn focus_params_flatten_alignment_fields() {
        let params: FocusAlignmentParams = serde_json::from_value(serde_json::json!({
            "z_mode": "triangle",
            "pm_channel": 2,
        }))
        .unwrap();
        assert_eq!(params.z_mode, ZMode::Triangle);
        assert_eq!(params.alignment.pm_channel, 2);
        assert_eq!(FocusAlignmentParams::default().alignment.search_range_x, 500.0);
    }

    #[test]
    fn angle_params_parse_stage() {
        let params: AngleAdjustmentParams =
            serde_json::from_value(serde_json::json!({"stage": "right"})).unwrap();
        assert_eq!(params.stage, AdjustmentStage::Right);
        assert_eq!(params.gap, 4.0);
    }
}
