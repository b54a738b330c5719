//! The per-function execution loop.
//!
//! An [`AsyncRunner`] owns a short history of function states and a queue of
//! deferred states. Its loop runs as one tokio task: pick the top state, compute
//! the next deadline from the function's period, sleep until then, call the
//! function, repeat. The function keeps the loop going by calling
//! [`SwimCtx::again`]; a function that does not ask for another iteration ends.
//!
//! All bookkeeping lives behind one mutex that is never held across an `.await`.

use crate::args::{Args, CallArgs};
use crate::common::StateId;
use crate::components::context::SwimCtx;
use crate::components::state::{period_of, DeferredState, FunctionState, SwimFn};
use crate::error::{Error, Result};
use crate::events::RunnerEvent;
use crate::scheduler::Scheduler;
use crate::time::{Clock, SleepOutcome, Sleeper, TimeShift};
use futures::FutureExt;
use std::any::Any;
use std::collections::{BinaryHeap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

/// Two intervals closer than this are considered equal.
const INTERVAL_EPSILON: f64 = 1e-9;

#[derive(Debug, Default)]
struct RunnerState {
    states: VecDeque<FunctionState>,
    deferred: BinaryHeap<DeferredState>,
    deferred_index: u64,
    interval_shift: f64,
    snap: Option<f64>,
    iter: u64,
    background_job: bool,

    swimming: bool,
    stop_requested: bool,
    running: bool,
    can_correct_interval: bool,
    has_reverted: bool,
    last_seen: Option<StateId>,
    last_interval: Option<f64>,
    last_deadline: Option<f64>,
    expected_time: Option<f64>,
    drift: f64,
}

impl RunnerState {
    fn push_state(&mut self, state: FunctionState, max_states: usize) {
        self.states.push_back(state);
        while self.states.len() > max_states {
            self.states.pop_front();
        }
    }

    /// Moves the earliest deferred state onto the stack and snaps to its deadline.
    fn promote_deferred(&mut self, max_states: usize) -> Option<f64> {
        let entry = self.deferred.pop()?;
        let mut state = entry.state;
        if let Some(top) = self.states.back() {
            state.args = state.args.inherit(&top.args);
        }
        self.push_state(state, max_states);
        self.snap = Some(entry.deadline);
        self.swimming = true;
        Some(entry.deadline)
    }
}

#[derive(Debug, Clone, Copy)]
enum Update {
    Merge,
    Replace,
}

/// What the loop should do after planning an iteration.
enum Plan {
    /// Nothing is active.
    Idle,
    /// State changed while planning; start over without sleeping.
    Restart,
    /// The top state cannot be called.
    Failed {
        state: StateId,
        error: crate::error::Error,
    },
    Ready(Iteration),
}

struct Iteration {
    state: FunctionState,
    bound: Args,
    period: f64,
    interval: f64,
    deadline: f64,
    wake_at: f64,
}

/// Runs one named function at beat-synchronized deadlines.
pub struct AsyncRunner {
    name: String,
    clock: Arc<Clock>,
    sleeper: Arc<Sleeper>,
    scheduler: Weak<Scheduler>,
    max_states: usize,
    lookahead: f64,
    state: Mutex<RunnerState>,
    reload: Notify,
}

impl AsyncRunner {
    pub(crate) fn new(
        name: impl Into<String>,
        clock: Arc<Clock>,
        sleeper: Arc<Sleeper>,
        scheduler: Weak<Scheduler>,
        max_states: usize,
        lookahead: f64,
    ) -> Self {
        Self {
            name: name.into(),
            clock,
            sleeper,
            scheduler,
            max_states: max_states.max(1),
            lookahead,
            state: Mutex::new(RunnerState::default()),
            reload: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RunnerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // --- State management ---

    /// Installs a new function state, taking effect on the next iteration.
    ///
    /// Keywords the call omits are inherited from the current top state.
    pub fn push(&self, func: SwimFn, args: impl Into<CallArgs>) -> Result<()> {
        func.validate()?;
        let args = args.into().into_keywords(func.name())?;
        let mut state = self.lock();
        let args = match state.states.back() {
            Some(top) => args.inherit(&top.args),
            None => args,
        };
        debug!(runner = %self.name, function = func.name(), %args, "Pushing state");
        state.push_state(FunctionState::new(func, args), self.max_states);
        state.has_reverted = false;
        Ok(())
    }

    /// Queues a function state that activates once the clock reaches `deadline`.
    pub fn push_deferred(&self, deadline: f64, func: SwimFn, args: impl Into<CallArgs>) -> Result<()> {
        func.validate()?;
        if !deadline.is_finite() {
            return Err(Error::BadArgument {
                function: func.name().to_string(),
                reason: format!("deadline must be a finite clock time, got {deadline}"),
            });
        }
        let args = args.into().into_keywords(func.name())?;
        let mut state = self.lock();
        let index = state.deferred_index;
        state.deferred_index += 1;
        debug!(runner = %self.name, function = func.name(), deadline, "Deferring state");
        state.deferred.push(DeferredState {
            deadline,
            index,
            state: FunctionState::new(func, args),
        });
        Ok(())
    }

    /// Updates the top state's arguments in place and allows one interval correction.
    ///
    /// The given keywords are merged over the current ones: a keyword left out
    /// keeps its value, so `again(args! {})` repeats the call unchanged. Use
    /// [`replace_state`](Self::replace_state) to drop keywords.
    pub fn update_state(&self, args: impl Into<CallArgs>) -> Result<()> {
        self.update_top(None, args, Update::Merge)
    }

    /// Like [`update_state`](Self::update_state), but only if `id` is still on top.
    ///
    /// A function that was replaced while it ran must not overwrite the
    /// arguments of its replacement.
    pub fn update_state_for(&self, id: StateId, args: impl Into<CallArgs>) -> Result<()> {
        self.update_top(Some(id), args, Update::Merge)
    }

    /// Overwrites the top state's arguments with exactly `args`.
    ///
    /// Keywords left out fall back to the function's parameter defaults.
    pub fn replace_state(&self, args: impl Into<CallArgs>) -> Result<()> {
        self.update_top(None, args, Update::Replace)
    }

    /// Like [`replace_state`](Self::replace_state), but only if `id` is still on top.
    pub fn replace_state_for(&self, id: StateId, args: impl Into<CallArgs>) -> Result<()> {
        self.update_top(Some(id), args, Update::Replace)
    }

    fn update_top(&self, id: Option<StateId>, args: impl Into<CallArgs>, update: Update) -> Result<()> {
        let args = args.into().into_keywords(&self.name)?;
        let mut guard = self.lock();
        let state = &mut *guard;
        if let Some(top) = state.states.back_mut() {
            if id.map_or(true, |id| id == top.id) {
                top.args = match update {
                    Update::Merge => args.inherit(&top.args),
                    Update::Replace => args,
                };
                state.can_correct_interval = true;
            }
        }
        Ok(())
    }

    /// Clears every state and deferred state. The loop exits on its next check.
    pub fn reset_states(&self) {
        {
            let mut state = self.lock();
            state.states.clear();
            state.deferred.clear();
            state.snap = None;
        }
        self.reload();
    }

    // --- Loop control ---

    /// Wakes the loop so it re-evaluates its deadline.
    pub fn reload(&self) {
        self.reload.notify_one();
    }

    /// Lets the loop run one more iteration.
    pub fn swim(&self) {
        self.lock().swimming = true;
    }

    /// Requests the loop to end. Takes precedence over [`swim`](Self::swim).
    pub fn stop(&self) {
        self.lock().stop_requested = true;
        self.reload();
    }

    /// Spawns the loop task unless it is already running.
    pub fn start(self: &Arc<Self>) -> bool {
        let mut state = self.lock();
        if state.running {
            return false;
        }
        self.spawn_locked(&mut state);
        true
    }

    /// Makes sure the loop picks up new states: swims and reloads a running loop,
    /// or starts a stopped one.
    pub(crate) fn wake(self: &Arc<Self>) {
        let mut state = self.lock();
        if state.running {
            state.swimming = true;
            state.stop_requested = false;
            drop(state);
            self.reload();
        } else {
            self.spawn_locked(&mut state);
        }
    }

    fn spawn_locked(self: &Arc<Self>, state: &mut RunnerState) {
        state.running = true;
        state.stop_requested = false;
        state.swimming = true;
        tokio::spawn(self.clone().run_loop());
    }

    // --- Accessors ---

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn clock(&self) -> &Arc<Clock> {
        &self.clock
    }

    pub(crate) fn scheduler(&self) -> Option<Arc<Scheduler>> {
        self.scheduler.upgrade()
    }

    /// Completed iterations.
    pub fn iter(&self) -> u64 {
        self.lock().iter
    }

    pub fn interval_shift(&self) -> f64 {
        self.lock().interval_shift
    }

    /// Rescales the interval shift after a tempo change and reloads.
    pub fn rescale_interval_shift(&self, ratio: f64) {
        {
            let mut state = self.lock();
            state.interval_shift *= ratio;
            state.can_correct_interval = true;
        }
        self.reload();
    }

    pub fn snap(&self) -> Option<f64> {
        self.lock().snap
    }

    pub fn set_snap(&self, snap: Option<f64>) {
        self.lock().snap = snap;
        self.reload();
    }

    pub fn is_background(&self) -> bool {
        self.lock().background_job
    }

    pub fn set_background(&self, background: bool) {
        self.lock().background_job = background;
    }

    pub fn is_running(&self) -> bool {
        self.lock().running
    }

    pub fn state_count(&self) -> usize {
        self.lock().states.len()
    }

    pub fn deferred_count(&self) -> usize {
        self.lock().deferred.len()
    }

    /// Name of the function on top of the stack.
    pub fn current_function(&self) -> Option<String> {
        self.lock()
            .states
            .back()
            .map(|state| state.func.name().to_string())
    }

    pub fn current_args(&self) -> Option<Args> {
        self.lock().states.back().map(|state| state.args.clone())
    }

    /// How late the last iteration woke up, in seconds.
    pub fn drift(&self) -> f64 {
        self.lock().drift
    }

    /// When the last iteration was due to wake up.
    pub fn expected_time(&self) -> Option<f64> {
        self.lock().expected_time
    }

    /// The deadline of the last executed iteration.
    pub fn last_deadline(&self) -> Option<f64> {
        self.lock().last_deadline
    }

    fn report(&self, event: RunnerEvent) {
        if let Some(scheduler) = self.scheduler.upgrade() {
            scheduler.report(event);
        }
    }

    // --- The loop ---

    async fn run_loop(self: Arc<Self>) {
        let mut exit = LoopExit {
            runner: self.clone(),
            completed: false,
        };
        info!(runner = %self.name, "Runner started");
        self.report(RunnerEvent::Started {
            name: self.name.clone(),
        });
        while self.begin_iteration() {
            self.run_once().await;
        }
        exit.completed = true;
    }

    /// The check at the top of every iteration. Returns `false` when the loop must
    /// exit, in which case the runner is marked as not running.
    fn begin_iteration(&self) -> bool {
        let mut state = self.lock();
        let proceed = if state.stop_requested {
            false
        } else if state.states.is_empty() && state.deferred.is_empty() {
            false
        } else if !state.swimming {
            if state.deferred.is_empty() {
                false
            } else {
                // The current function ended; keep waiting for the queued ones.
                state.states.clear();
                true
            }
        } else {
            true
        };
        state.swimming = false;
        if !proceed {
            state.running = false;
        }
        proceed
    }

    async fn run_once(self: &Arc<Self>) {
        let deferred_policy = self.scheduler.upgrade().is_some_and(|s| s.deferred());

        if let Some(earliest) = self.earliest_pending() {
            if self.sleep_until(earliest).await {
                let mut state = self.lock();
                if let Some(deadline) = state.promote_deferred(self.max_states) {
                    debug!(runner = %self.name, deadline, "Promoted deferred state");
                }
            }
            return;
        }

        let iteration = match self.plan(deferred_policy) {
            Plan::Idle | Plan::Restart => return,
            Plan::Failed { state, error } => {
                self.crash(state, error.into());
                return;
            }
            Plan::Ready(iteration) => iteration,
        };

        if !self.sleep_until(iteration.wake_at).await {
            return;
        }

        let ctx = self.enter(&iteration, deferred_policy);
        let result = AssertUnwindSafe(iteration.state.func.call(ctx))
            .catch_unwind()
            .await;
        let failure = match result {
            Ok(Ok(())) => None,
            Ok(Err(error)) => Some(error),
            Err(panic) => Some(anyhow::anyhow!("panicked: {}", panic_message(&*panic))),
        };
        match failure {
            None => self.lock().iter += 1,
            Some(error) => self.crash(iteration.state.id, error),
        }
    }

    /// With an empty stack, the deadline of the earliest deferred state.
    ///
    /// Due entries are promoted on the spot and `None` is returned.
    fn earliest_pending(&self) -> Option<f64> {
        let mut state = self.lock();
        if !state.states.is_empty() {
            return None;
        }
        let deadline = state.deferred.peek()?.deadline;
        if deadline <= self.clock.time() {
            state.promote_deferred(self.max_states);
            return None;
        }
        Some(deadline)
    }

    /// Picks the top state, reports swaps and computes the next deadline.
    fn plan(&self, deferred_policy: bool) -> Plan {
        let mut state = self.lock();
        let Some(top) = state.states.back().cloned() else {
            return Plan::Idle;
        };

        if state.last_seen != Some(top.id) {
            if state.last_seen.is_some() {
                let description = format!("{}({})", top.func.name(), top.args);
                if state.has_reverted {
                    warn!(runner = %self.name, state = %top.id, "Saving {} from crash", self.name);
                    self.report(RunnerEvent::SavedFromCrash {
                        name: self.name.clone(),
                        state: description,
                    });
                } else {
                    info!(runner = %self.name, state = %top.id, "Updating {}", self.name);
                    self.report(RunnerEvent::Updated {
                        name: self.name.clone(),
                        state: description,
                    });
                }
            }
            state.has_reverted = false;
            state.last_seen = Some(top.id);
        }

        let bound = match top.func.bind(&top.args) {
            Ok(bound) => bound,
            Err(error) => return Plan::Failed { state: top.id, error },
        };
        let period = match period_of(top.func.name(), &bound, &top.args) {
            Ok(period) => period,
            Err(error) => return Plan::Failed { state: top.id, error },
        };

        let now = self.clock.time();
        let interval = self.clock.get_beat_time(period, None, false);
        let interval_changed = state
            .last_interval
            .is_some_and(|last| (last - interval).abs() > INTERVAL_EPSILON);
        if state.can_correct_interval && interval_changed {
            let anchor = state.last_deadline.unwrap_or(now);
            state.interval_shift = anchor.rem_euclid(interval);
            debug!(runner = %self.name, shift = state.interval_shift, "Corrected interval");
        }
        state.can_correct_interval = false;
        state.last_interval = Some(interval);

        let deadline = match state.snap {
            Some(snap) => snap,
            None => {
                let basis = if deferred_policy { now + interval } else { now };
                basis + self
                    .clock
                    .get_beat_time(period, Some(basis - state.interval_shift), true)
            }
        };

        if state
            .deferred
            .peek()
            .is_some_and(|entry| entry.deadline <= deadline)
        {
            if let Some(promoted) = state.promote_deferred(self.max_states) {
                debug!(runner = %self.name, deadline = promoted, "Promoted deferred state");
            }
            return Plan::Restart;
        }

        let wake_at = if deferred_policy {
            deadline - interval
        } else {
            deadline
        };
        Plan::Ready(Iteration {
            state: top,
            bound,
            period,
            interval,
            deadline,
            wake_at,
        })
    }

    /// Sleeps until `deadline`, racing reloads. Returns `true` if the deadline was
    /// reached; otherwise the iteration must start over.
    async fn sleep_until(&self, deadline: f64) -> bool {
        let outcome = tokio::select! {
            outcome = self.sleeper.sleep_until(deadline) => Some(outcome),
            _ = self.reload.notified() => None,
        };
        match outcome {
            Some(SleepOutcome::Elapsed) => return true,
            Some(SleepOutcome::Interrupted) => {
                tokio::select! {
                    _ = self.clock.wait_until_running() => {}
                    _ = self.reload.notified() => {}
                }
            }
            None => {}
        }
        self.swim();
        false
    }

    /// Records the deadline about to be executed and builds the function's context.
    fn enter(self: &Arc<Self>, iteration: &Iteration, deferred_policy: bool) -> SwimCtx {
        let mut state = self.lock();
        if state.snap.take().is_some() {
            state.interval_shift = iteration.deadline.rem_euclid(iteration.interval);
        }
        let now = self.clock.time();
        state.expected_time = Some(iteration.wake_at);
        state.drift = now - iteration.wake_at;
        state.last_deadline = Some(iteration.deadline);
        let shift = if deferred_policy {
            TimeShift::new(iteration.deadline - now)
        } else {
            TimeShift::ZERO
        };
        SwimCtx::new(
            self.clone(),
            iteration.state.id,
            iteration.bound.clone(),
            iteration.period,
            iteration.deadline,
            state.iter,
            shift,
            self.lookahead,
        )
    }

    /// Reverts a failed state and keeps the loop alive.
    fn crash(&self, id: StateId, error: anyhow::Error) {
        error!(runner = %self.name, state = %id, "Function crashed: {error:#}");
        self.report(RunnerEvent::Crashed {
            name: self.name.clone(),
            error: format!("{error:#}"),
        });
        let mut state = self.lock();
        if state.states.back().is_some_and(|top| top.id == id) {
            state.states.pop_back();
        }
        state.has_reverted = true;
        state.swimming = true;
    }
}

/// Releases the runner however its loop task ends.
///
/// A loop that returns normally was already marked as not running by
/// `begin_iteration`. A loop that unwinds or is cancelled is marked here, so a
/// later push can spawn a fresh one.
struct LoopExit {
    runner: Arc<AsyncRunner>,
    completed: bool,
}

impl Drop for LoopExit {
    fn drop(&mut self) {
        let runner = &self.runner;
        if !self.completed {
            error!(runner = %runner.name, "Runner loop ended abnormally");
            runner.lock().running = false;
        }
        let iterations = runner.iter();
        if let Some(scheduler) = runner.scheduler.upgrade() {
            scheduler.release_runner(runner);
        }
        info!(runner = %runner.name, iterations, "Runner finished");
        runner.report(RunnerEvent::Finished {
            name: runner.name.clone(),
            iterations,
        });
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args;
    use crate::bus::{EventBus, Handler};
    use crate::events::Event;
    use crate::time::InternalSource;
    use std::time::Duration;

    fn runner() -> Arc<AsyncRunner> {
        let bus = Arc::new(EventBus::new());
        let clock = Arc::new(Clock::new(Arc::new(InternalSource::new(120.0)), bus, 4).unwrap());
        let sleeper = Arc::new(Sleeper::new(clock.clone(), Duration::from_millis(1)));
        Arc::new(AsyncRunner::new("f", clock, sleeper, Weak::new(), 3, 0.0))
    }

    fn noop(name: &str) -> SwimFn {
        SwimFn::new(name, |_ctx| async { Ok(()) })
    }

    #[test]
    fn pushes_inherit_omitted_keywords() {
        let runner = runner();
        runner.push(noop("f"), args! { a => 1, b => 2 }).unwrap();
        runner.push(noop("f2"), args! {}).unwrap();
        assert_eq!(runner.current_args(), Some(args! { a => 1, b => 2 }));
        runner.push(noop("f3"), args! { b => 5 }).unwrap();
        assert_eq!(runner.current_args(), Some(args! { a => 1, b => 5 }));
        assert_eq!(runner.current_function().as_deref(), Some("f3"));
    }

    #[test]
    fn history_is_bounded() {
        let runner = runner();
        for i in 0..10 {
            runner.push(noop("f"), args! { i => i }).unwrap();
        }
        assert_eq!(runner.state_count(), 3);
    }

    #[test]
    fn bad_pushes_are_rejected() {
        let runner = runner();
        assert!(runner.push(noop("not a name"), args! {}).is_err());
        assert!(runner.push(noop("f"), CallArgs::new().arg(1)).is_err());
        assert!(runner
            .push_deferred(1.0, noop("f"), CallArgs::new().arg(1))
            .is_err());
        for deadline in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let err = runner.push_deferred(deadline, noop("f"), args! {}).unwrap_err();
            assert!(matches!(err, Error::BadArgument { .. }), "{deadline}: {err}");
        }
        assert_eq!(runner.state_count(), 0);
        assert_eq!(runner.deferred_count(), 0);
    }

    #[test]
    fn update_state_merges_only_into_the_matching_top() {
        let runner = runner();
        runner.push(noop("f"), args! { a => 1 }).unwrap();
        let old = runner.lock().states.back().map(|s| s.id).unwrap();
        runner.push(noop("f"), args! { b => 2 }).unwrap();

        runner.update_state_for(old, args! { a => 9 }).unwrap();
        assert_eq!(runner.current_args(), Some(args! { a => 1, b => 2 }));

        runner.update_state(args! { a => 9 }).unwrap();
        assert_eq!(runner.current_args(), Some(args! { a => 9, b => 2 }));
    }

    #[test]
    fn replace_state_drops_omitted_keywords() {
        let runner = runner();
        runner.push(noop("f"), args! { a => 1 }).unwrap();
        let old = runner.lock().states.back().map(|s| s.id).unwrap();
        runner.push(noop("f"), args! { b => 2 }).unwrap();

        runner.replace_state_for(old, args! { c => 3 }).unwrap();
        assert_eq!(runner.current_args(), Some(args! { a => 1, b => 2 }));

        runner.replace_state(args! { b => 7 }).unwrap();
        assert_eq!(runner.current_args(), Some(args! { b => 7 }));
        runner.update_state(args! {}).unwrap();
        assert_eq!(runner.current_args(), Some(args! { b => 7 }));
    }

    #[test]
    fn loop_exits_without_a_swim_unless_deferred_states_wait() {
        let runner = runner();
        runner.push(noop("f"), args! {}).unwrap();
        runner.lock().swimming = true;
        assert!(runner.begin_iteration());
        assert!(!runner.begin_iteration());

        runner.push(noop("f"), args! {}).unwrap();
        runner.push_deferred(5.0, noop("g"), args! {}).unwrap();
        assert!(runner.begin_iteration());
        assert_eq!(runner.state_count(), 0);

        runner.stop();
        runner.swim();
        assert!(!runner.begin_iteration());
    }

    #[tokio::test(start_paused = true)]
    async fn crash_reverts_to_the_previous_state() {
        let runner = runner();
        runner.clock().hook(&Event::Start);
        let good = SwimFn::new("f", |ctx: SwimCtx| async move {
            ctx.again(args! {})?;
            Ok(())
        });
        let bad = SwimFn::new("f", |_ctx| async { anyhow::bail!("typo") });
        runner.push(good, args! {}).unwrap();
        runner.push(bad, args! {}).unwrap();
        runner.start();

        tokio::time::sleep(Duration::from_millis(1600)).await;
        assert!(runner.is_running());
        assert_eq!(runner.state_count(), 1);
        // 0.5 crashed, 1.0 and 1.5 ran the reverted state.
        assert_eq!(runner.iter(), 2);
        runner.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_loop_is_marked_as_not_running() {
        let runner = runner();
        runner.clock().hook(&Event::Start);
        let idle = SwimFn::new("f", |ctx: SwimCtx| async move {
            ctx.again(args! {})?;
            Ok(())
        });
        runner.push(idle, args! { p => 1e300 }).unwrap();
        runner.lock().running = true;
        runner.swim();
        let task = tokio::spawn(runner.clone().run_loop());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(runner.is_running());
        task.abort();
        let _ = task.await;
        assert!(!runner.is_running());
        assert!(runner.start());
        runner.stop();
    }
}
