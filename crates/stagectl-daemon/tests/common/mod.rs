/*
[INPUT]:  Test requirements for the orchestration core
[OUTPUT]: Scripted fake instrument, fast timings, polling helpers
[POS]:    Test infrastructure - shared across all test modules
[UPDATE]: When adding new test patterns or fixtures
[UPDATE]: Poll latency and post-stop status for cancel-during-poll cases
*/

//! Common test utilities for stagectl-daemon tests

#![allow(dead_code)]

use stagectl_daemon::executor::Timing;
use stagectl_daemon::config::TimingConfig;
use stagectl_daemon::{Task, TaskRegistry, TaskStatus};
use stagectl_instrument::{
    Command, Instrument, InstrumentError, PollStatus, ProfilePoint, ProfileSource, Readback,
    StatusCode, Subsystem,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use uuid::Uuid;

pub const FAST: Timing = Timing {
    poll_interval_ms: 5,
    start_delay_ms: 0,
    settle_ms: 0,
    stop_settle_ms: 10,
    timeout_ms: 5_000,
};

/// Same fast timing for every operation kind
pub fn fast_timings() -> TimingConfig {
    TimingConfig {
        axis_movement: FAST,
        alignment: FAST,
        angle_adjustment: FAST,
        profile_measurement: FAST,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Initiate(Command),
    Poll(Subsystem),
    Read(Readback),
    Stop(Subsystem),
}

type Hook = Box<dyn Fn(usize) + Send + Sync>;

/// Instrument fake that replays a poll script and records every call.
///
/// Polls pop the script front; once exhausted the fallback status repeats.
/// Axis readbacks return an increasing counter so progress is observable.
pub struct ScriptedInstrument {
    polls: Mutex<VecDeque<PollStatus>>,
    fallback: PollStatus,
    calls: Mutex<Vec<Call>>,
    reads: Mutex<f64>,
    on_poll: Mutex<Option<Hook>>,
    on_stop: Mutex<Option<Hook>>,
    poll_latency: Duration,
    after_stop: Option<StatusCode>,
    stopped: AtomicBool,
}

impl ScriptedInstrument {
    fn with_script(polls: Vec<PollStatus>, fallback: PollStatus) -> Self {
        Self {
            polls: Mutex::new(polls.into()),
            fallback,
            calls: Mutex::new(Vec::new()),
            reads: Mutex::new(0.0),
            on_poll: Mutex::new(None),
            on_stop: Mutex::new(None),
            poll_latency: Duration::ZERO,
            after_stop: None,
            stopped: AtomicBool::new(false),
        }
    }

    /// In progress for `polls - 1` polls, then success
    pub fn completes_after(polls: usize) -> Self {
        let script = vec![PollStatus::in_progress(); polls.saturating_sub(1)];
        Self::with_script(script, PollStatus::success())
    }

    /// In progress until the `poll`-th poll (1-based), which reports `code`
    pub fn fails_on_poll(poll: usize, code: StatusCode) -> Self {
        let script = vec![PollStatus::in_progress(); poll.saturating_sub(1)];
        Self::with_script(script, PollStatus::Failure(code))
    }

    pub fn never_completes() -> Self {
        Self::with_script(Vec::new(), PollStatus::in_progress())
    }

    /// Run `hook` with the 1-based poll number before each poll answers
    pub fn on_poll(self, hook: impl Fn(usize) + Send + Sync + 'static) -> Self {
        *self.on_poll.lock().unwrap() = Some(Box::new(hook));
        self
    }

    /// Run `hook` with the 1-based stop number when stop is called
    pub fn on_stop(self, hook: impl Fn(usize) + Send + Sync + 'static) -> Self {
        *self.on_stop.lock().unwrap() = Some(Box::new(hook));
        self
    }

    /// Hold every poll for `latency` after it is recorded
    pub fn with_poll_latency(mut self, latency: Duration) -> Self {
        self.poll_latency = latency;
        self
    }

    /// Once stopped, every poll answers `code` like a controller that halted
    pub fn reports_after_stop(mut self, code: StatusCode) -> Self {
        self.after_stop = Some(code);
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, predicate: impl Fn(&Call) -> bool) -> usize {
        self.calls().iter().filter(|call| predicate(call)).count()
    }

    pub fn initiated(&self) -> usize {
        self.count(|call| matches!(call, Call::Initiate(_)))
    }

    pub fn stops(&self) -> usize {
        self.count(|call| matches!(call, Call::Stop(_)))
    }

    fn record(&self, call: Call) -> usize {
        let kind = std::mem::discriminant(&call);
        let mut calls = self.calls.lock().unwrap();
        calls.push(call);
        calls
            .iter()
            .filter(|call| std::mem::discriminant(*call) == kind)
            .count()
    }
}

impl Instrument for ScriptedInstrument {
    fn initiate(&self, command: &Command) -> stagectl_instrument::Result<()> {
        self.record(Call::Initiate(command.clone()));
        Ok(())
    }

    fn poll_status(&self, subsystem: Subsystem) -> stagectl_instrument::Result<PollStatus> {
        let poll = self.record(Call::Poll(subsystem));
        if let Some(hook) = self.on_poll.lock().unwrap().as_ref() {
            hook(poll);
        }
        if !self.poll_latency.is_zero() {
            std::thread::sleep(self.poll_latency);
        }
        let halted = self.stopped.load(Ordering::SeqCst);
        if let Some(code) = self.after_stop.as_ref().filter(|_| halted) {
            return Ok(PollStatus::Failure(code.clone()));
        }
        let next = self.polls.lock().unwrap().pop_front();
        Ok(next.unwrap_or_else(|| self.fallback.clone()))
    }

    fn read_value(&self, readback: Readback) -> stagectl_instrument::Result<f64> {
        self.record(Call::Read(readback));
        let mut reads = self.reads.lock().unwrap();
        let value = *reads;
        *reads += 1.0;
        Ok(value)
    }

    fn stop(&self, subsystem: Subsystem) -> stagectl_instrument::Result<()> {
        let stop = self.record(Call::Stop(subsystem));
        self.stopped.store(true, Ordering::SeqCst);
        if let Some(hook) = self.on_stop.lock().unwrap().as_ref() {
            hook(stop);
        }
        Ok(())
    }

    fn is_servo_on(&self, axis: u8) -> stagectl_instrument::Result<bool> {
        if axis == 0 {
            return Err(InstrumentError::InvalidAxis { axis, max: 12 });
        }
        Ok(true)
    }

    fn profile_data(
        &self,
        _source: ProfileSource,
    ) -> stagectl_instrument::Result<Vec<ProfilePoint>> {
        Ok((0..5)
            .map(|i| ProfilePoint {
                position: f64::from(i),
                signal: if i == 2 { 1.0 } else { 0.1 },
            })
            .collect())
    }
}

/// Poll the registry until the task reaches `status` or `within` elapses
pub async fn wait_for_status(
    registry: &TaskRegistry,
    task_id: Uuid,
    status: TaskStatus,
    within: Duration,
) -> Task {
    let deadline = Instant::now() + within;
    loop {
        let task = registry.get(task_id).expect("task should exist");
        if task.status == status || Instant::now() >= deadline {
            return task;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

/// Poll the registry until the task is terminal or `within` elapses
pub async fn wait_terminal(registry: &TaskRegistry, task_id: Uuid, within: Duration) -> Task {
    let deadline = Instant::now() + within;
    loop {
        let task = registry.get(task_id).expect("task should exist");
        if task.is_terminal() || Instant::now() >= deadline {
            return task;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

pub fn shared<T>(value: T) -> Arc<Mutex<T>> {
    Arc::new(Mutex::new(value))
}
