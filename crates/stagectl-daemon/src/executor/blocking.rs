/*
[INPUT]:  A PolledOperation, its Timing, the Instrument, the task's OperationContext
[OUTPUT]: Blocking poll loop with cooperative cancellation, timeout and settle delays
[POS]:    Executor layer - shared shape of every operation body (runs on a worker thread)
[UPDATE]: When changing poll-loop ordering, cancellation latency or timeout handling
[UPDATE]: A normal-stop readback after cancellation settles as cancelled, not failed
*/

use serde::{Deserialize, Serialize};
use stagectl_instrument::{Instrument, PollStatus, StatusCode, Subsystem};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::OperationContext;
use super::error::{OperationError, Result};

/// Poll-loop timings of one operation kind, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timing {
    pub poll_interval_ms: u64,
    /// Wait between the initiating call and the first poll.
    pub start_delay_ms: u64,
    /// Wait after the instrument reports success, before final readback.
    pub settle_ms: u64,
    /// Wait after a stop issued for cancellation.
    pub stop_settle_ms: u64,
    pub timeout_ms: u64,
}

impl Timing {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn start_delay(&self) -> Duration {
        Duration::from_millis(self.start_delay_ms)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn stop_settle(&self) -> Duration {
        Duration::from_millis(self.stop_settle_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Hooks an operation body plugs into [`CancellablePoll`].
pub trait PolledOperation {
    type Output;

    /// Human name used in failure messages, e.g. "Flat alignment".
    fn name(&self) -> &'static str;

    fn subsystem(&self) -> Subsystem;

    /// Issue the initiating call. Must return as soon as the command is accepted.
    fn initiate(&mut self, ctx: &OperationContext, instrument: &dyn Instrument) -> Result<()>;

    /// Called for every in-progress poll.
    fn on_progress(
        &mut self,
        _ctx: &OperationContext,
        _instrument: &dyn Instrument,
        _phase: Option<&StatusCode>,
        _elapsed: Duration,
    ) {
    }

    /// Called after the stop issued for cancellation has settled.
    fn on_stopped(&mut self, _ctx: &OperationContext, _instrument: &dyn Instrument) {}

    /// Final readback once the instrument reported success and settled.
    fn finish(
        &mut self,
        ctx: &OperationContext,
        instrument: &dyn Instrument,
        phase: Option<StatusCode>,
        elapsed: Duration,
    ) -> Result<Self::Output>;
}

/// Blocking poll loop. Never call from the async scheduler.
pub struct CancellablePoll<'a> {
    ctx: &'a OperationContext,
    instrument: &'a dyn Instrument,
    timing: Timing,
}

impl<'a> CancellablePoll<'a> {
    pub fn new(ctx: &'a OperationContext, instrument: &'a dyn Instrument, timing: Timing) -> Self {
        Self {
            ctx,
            instrument,
            timing,
        }
    }

    pub fn run<P: PolledOperation>(&self, op: &mut P) -> Result<P::Output> {
        let subsystem = op.subsystem();
        let task_id = self.ctx.task_id();

        op.initiate(self.ctx, self.instrument)?;
        let started = Instant::now();
        let deadline = started + self.timing.timeout();
        debug!(task_id = %task_id, %subsystem, "operation initiated");
        thread::sleep(self.timing.start_delay());

        loop {
            // Cancellation is checked before the instrument is queried.
            if self.ctx.is_cancelled() {
                info!(task_id = %task_id, %subsystem, "cancellation observed; stopping instrument");
                self.stop_quietly(subsystem);
                return self.settle_cancelled(op);
            }

            let status = match self.instrument.poll_status(subsystem) {
                Ok(status) => status,
                Err(err) => {
                    self.stop_quietly(subsystem);
                    return Err(err.into());
                }
            };

            match status {
                PollStatus::InProgress { phase } => {
                    op.on_progress(self.ctx, self.instrument, phase.as_ref(), started.elapsed());
                }
                PollStatus::Success { phase } => {
                    thread::sleep(self.timing.settle());
                    return op.finish(self.ctx, self.instrument, phase, started.elapsed());
                }
                // A stop already in flight for this cancellation reads back as a normal stop.
                PollStatus::Failure(code) if code.is_stopping() && self.ctx.is_cancelled() => {
                    info!(task_id = %task_id, %subsystem, "instrument stopped for cancellation");
                    return self.settle_cancelled(op);
                }
                PollStatus::Failure(code) => {
                    warn!(
                        task_id = %task_id,
                        %subsystem,
                        status = %code,
                        "instrument reported failure"
                    );
                    return Err(OperationError::Hardware {
                        context: op.name().to_string(),
                        code,
                    });
                }
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(
                    task_id = %task_id,
                    %subsystem,
                    timeout_ms = self.timing.timeout_ms,
                    "operation timed out; stopping instrument"
                );
                self.stop_quietly(subsystem);
                return Err(OperationError::Timeout {
                    context: op.name().to_string(),
                    after: self.timing.timeout(),
                });
            }
            thread::sleep(self.timing.poll_interval().min(deadline - now));
        }
    }

    fn settle_cancelled<P: PolledOperation>(&self, op: &mut P) -> Result<P::Output> {
        thread::sleep(self.timing.stop_settle());
        op.on_stopped(self.ctx, self.instrument);
        Err(OperationError::Cancelled)
    }

    fn stop_quietly(&self, subsystem: Subsystem) {
        if let Err(err) = self.instrument.stop(subsystem) {
            warn!(
                task_id = %self.ctx.task_id(),
                %subsystem,
                error = %err,
                "best-effort stop failed"
            );
        }
    }
}
