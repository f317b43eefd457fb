/*
[INPUT]:  SimulatedInstrument driven through the Instrument trait
[OUTPUT]: Behavioural tests of the mock controller
[POS]:    Integration tests - simulator contract
[UPDATE]: When the simulator model changes
*/

mod common;

use common::{quiet_config, wait_settled};
use stagectl_instrument::{
    AdjustmentStage, AngleAdjustmentParams, AngleProfile, Command, FocusAlignmentParams,
    Instrument, PollStatus, ProfileAxis, ProfileSource, Readback, SimulatedInstrument, Subsystem,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_test::assert_ok;

#[test]
fn test_move_from_another_thread_is_visible() {
    let sim: Arc<dyn Instrument> = Arc::new(SimulatedInstrument::new(quiet_config()));
    let worker = Arc::clone(&sim);
    let handle = std::thread::spawn(move || {
        worker.initiate(&Command::MoveAbsolute {
            axis: 4,
            position: 5.0,
            speed: 500.0,
        })
    });
    assert_ok!(handle.join().expect("worker thread panicked"));

    let status = wait_settled(sim.as_ref(), Subsystem::Axis(4), Duration::from_secs(1));
    assert_eq!(status, PollStatus::success());
    assert_eq!(assert_ok!(sim.read_value(Readback::AxisPosition(4))), 5.0);
}

#[test]
fn test_focus_alignment_records_z_profile() {
    let sim = SimulatedInstrument::new(quiet_config());
    assert_ok!(sim.initiate(&Command::FocusAlignment(FocusAlignmentParams::default())));

    let status = wait_settled(&sim, Subsystem::Alignment, Duration::from_secs(2));
    match status {
        PollStatus::Success { phase: Some(phase) } => assert_eq!(phase.code, "PeakSearchingZ"),
        other => panic!("unexpected status {other:?}"),
    }
    let z = assert_ok!(sim.profile_data(ProfileSource::Alignment(ProfileAxis::Z)));
    assert!(!z.is_empty());
}

#[test]
fn test_angle_adjustment_raises_signal() {
    let sim = SimulatedInstrument::new(quiet_config());
    let before = assert_ok!(sim.read_value(Readback::AnalogInput(1)));
    let params = AngleAdjustmentParams {
        stage: AdjustmentStage::Right,
        ..AngleAdjustmentParams::default()
    };
    assert_ok!(sim.initiate(&Command::AngleAdjustment(params)));

    let status = wait_settled(
        &sim,
        Subsystem::AngleAdjustment(AdjustmentStage::Right),
        Duration::from_secs(2),
    );
    assert!(matches!(status, PollStatus::Success { .. }));
    let after = assert_ok!(sim.read_value(Readback::AnalogInput(1)));
    assert!(after > before);

    let tx = assert_ok!(sim.profile_data(ProfileSource::Angle(
        AdjustmentStage::Right,
        AngleProfile::AdjustingTx
    )));
    assert!(!tx.is_empty());
    let left = assert_ok!(sim.profile_data(ProfileSource::Angle(
        AdjustmentStage::Left,
        AngleProfile::AdjustingTx
    )));
    assert!(left.is_empty());
}

#[test]
fn test_idle_subsystems_report_stopping() {
    let sim = SimulatedInstrument::new(quiet_config());
    match assert_ok!(sim.poll_status(Subsystem::Profile)) {
        PollStatus::Failure(code) => assert_eq!(code.value, 0),
        other => panic!("unexpected status {other:?}"),
    }
    assert_ok!(sim.stop(Subsystem::Profile));
    assert_ok!(sim.stop(Subsystem::AngleAdjustment(AdjustmentStage::Left)));
}
