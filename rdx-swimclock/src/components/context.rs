//! The handle a scheduled function receives on every call.

use crate::args::{Args, CallArgs, Value};
use crate::common::StateId;
use crate::components::io::{OutputSender, PatternParser};
use crate::components::runner::AsyncRunner;
use crate::error::Result;
use crate::scheduler::Scheduler;
use crate::time::{Clock, TimeShift};
use std::sync::Arc;

/// Everything a function body needs for one iteration.
///
/// The context carries its own [`TimeShift`], starting at zero (or at the
/// deferred-scheduling shift) on every iteration. [`sleep`](SwimCtx::sleep) moves
/// that shift instead of suspending, so output sent afterwards is stamped later
/// while the body keeps running.
#[derive(Clone)]
pub struct SwimCtx {
    runner: Arc<AsyncRunner>,
    state: StateId,
    args: Args,
    period: f64,
    deadline: f64,
    iter: u64,
    shift: TimeShift,
    lookahead: f64,
}

impl SwimCtx {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        runner: Arc<AsyncRunner>,
        state: StateId,
        args: Args,
        period: f64,
        deadline: f64,
        iter: u64,
        shift: TimeShift,
        lookahead: f64,
    ) -> Self {
        Self {
            runner,
            state,
            args,
            period,
            deadline,
            iter,
            shift,
            lookahead,
        }
    }

    /// Name of the runner calling this function.
    pub fn name(&self) -> &str {
        self.runner.name()
    }

    pub fn runner(&self) -> &Arc<AsyncRunner> {
        &self.runner
    }

    /// Iterations completed before this one.
    pub fn iter(&self) -> u64 {
        self.iter
    }

    /// The bound keyword arguments of this call.
    pub fn args(&self) -> &Args {
        &self.args
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.args.get(key)
    }

    /// Period of this call, in beats.
    pub fn period(&self) -> f64 {
        self.period
    }

    /// The clock time this iteration was scheduled for.
    pub fn deadline(&self) -> f64 {
        self.deadline
    }

    pub fn clock(&self) -> &Arc<Clock> {
        self.runner.clock()
    }

    pub fn scheduler(&self) -> Option<Arc<Scheduler>> {
        self.runner.scheduler()
    }

    // --- Time ---

    /// Clock time as seen by this call, shift included.
    pub fn time(&self) -> f64 {
        self.clock().shifted_time(&self.shift)
    }

    pub fn beat_duration(&self) -> f64 {
        self.clock().beat_duration()
    }

    pub fn shift(&self) -> TimeShift {
        self.shift
    }

    /// Moves this call's time forward by `beats` without suspending.
    pub fn sleep(&mut self, beats: f64) {
        let beat_duration = self.beat_duration();
        self.shift.add_beats(beats, beat_duration);
    }

    pub fn sleep_seconds(&mut self, seconds: f64) {
        self.shift.add_seconds(seconds);
    }

    // --- Continuation ---

    /// Asks for another iteration with updated arguments.
    ///
    /// Keywords left out keep their current values. If this function was
    /// replaced while it ran, the new version keeps its own arguments.
    pub fn again(&self, args: impl Into<CallArgs>) -> Result<()> {
        self.runner.update_state_for(self.state, args)?;
        self.runner.swim();
        Ok(())
    }

    /// Asks for another iteration with exactly `args`.
    ///
    /// Unlike [`again`](Self::again), keywords left out are dropped and fall back
    /// to the function's parameter defaults.
    pub fn again_only(&self, args: impl Into<CallArgs>) -> Result<()> {
        self.runner.replace_state_for(self.state, args)?;
        self.runner.swim();
        Ok(())
    }

    /// Asks for another iteration with the same arguments.
    pub fn swim(&self) {
        self.runner.swim();
    }

    /// Ends this runner after the current call.
    pub fn stop(&self) {
        match self.scheduler() {
            Some(scheduler) => scheduler.stop_runner_handle(&self.runner, true),
            None => self.runner.stop(),
        }
    }

    // --- Output ---

    /// The timestamp output should carry: shifted time plus look-ahead.
    pub fn output_deadline(&self) -> f64 {
        self.time() + self.lookahead
    }

    /// Hands `payload` to a sender, stamped with [`output_deadline`](Self::output_deadline).
    pub fn send(&self, sender: &dyn OutputSender, payload: &Args) -> anyhow::Result<()> {
        sender.send(self.output_deadline(), payload)
    }

    /// The pattern value for this iteration.
    pub fn pattern(&self, parser: &dyn PatternParser, expression: &str) -> anyhow::Result<Value> {
        let values = parser.parse(expression)?;
        if values.is_empty() {
            anyhow::bail!("pattern {expression:?} produced no values");
        }
        let index = (self.iter % values.len() as u64) as usize;
        Ok(values[index].clone())
    }
}
