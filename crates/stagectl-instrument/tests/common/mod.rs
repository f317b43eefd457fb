/*
[INPUT]:  Test configuration requirements for the simulated controller
[OUTPUT]: Shared test utilities and fixtures
[POS]:    Test infrastructure - shared across all test modules
[UPDATE]: When adding new test patterns or fixtures
*/

//! Common test utilities for stagectl-instrument tests

use stagectl_instrument::{Instrument, PollStatus, SimulationConfig, Subsystem};
use std::time::{Duration, Instant};

/// Noise-free simulator settings with short phases
pub fn quiet_config() -> SimulationConfig {
    SimulationConfig {
        noise: 0.0,
        phase_duration_ms: 20,
        seed: Some(42),
        ..SimulationConfig::default()
    }
}

/// Poll until the subsystem leaves the in-progress state or the deadline passes
pub fn wait_settled(
    instrument: &dyn Instrument,
    subsystem: Subsystem,
    within: Duration,
) -> PollStatus {
    let deadline = Instant::now() + within;
    loop {
        let status = instrument
            .poll_status(subsystem)
            .expect("poll_status should succeed");
        if !status.is_in_progress() || Instant::now() >= deadline {
            return status;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}
