//! The registry of named runners.
//!
//! Scheduling a function looks up (or creates) the runner named after it, pushes
//! the new state and makes sure the runner's loop picks it up. The scheduler is a
//! bus handler: tempo changes rescale every runner's interval shift, and a
//! transport stop stops every runner that is not a background job.

use crate::args::CallArgs;
use crate::bus::Handler;
use crate::components::runner::AsyncRunner;
use crate::components::state::SwimFn;
use crate::config::SchedulerConfig;
use crate::error::{Error, Result};
use crate::events::{Event, RunnerEvent};
use crate::time::{Clock, Sleeper};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::broadcast;
use tracing::{debug, info};

const REPORT_CAPACITY: usize = 64;

/// Where in musical time a scheduled function starts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Quant {
    /// At the current clock time.
    Now,
    /// At the next beat boundary.
    NextBeat,
    /// At the next bar boundary.
    NextBar,
    /// After this many beats, not aligned to the grid.
    Beats(f64),
    /// At an absolute clock time.
    At(f64),
}

/// Owns every runner, keyed by function name.
pub struct Scheduler {
    me: Weak<Scheduler>,
    clock: Arc<Clock>,
    sleeper: Arc<Sleeper>,
    config: SchedulerConfig,
    runners: Mutex<HashMap<String, Arc<AsyncRunner>>>,
    deferred: AtomicBool,
    reports: broadcast::Sender<RunnerEvent>,
}

impl Scheduler {
    pub fn new(clock: Arc<Clock>, sleeper: Arc<Sleeper>, config: SchedulerConfig) -> Arc<Self> {
        let (reports, _) = broadcast::channel(REPORT_CAPACITY);
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            clock,
            sleeper,
            deferred: AtomicBool::new(config.deferred),
            config,
            runners: Mutex::new(HashMap::new()),
            reports,
        })
    }

    fn lock_runners(&self) -> MutexGuard<'_, HashMap<String, Arc<AsyncRunner>>> {
        self.runners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn clock(&self) -> &Arc<Clock> {
        &self.clock
    }

    // --- Scheduling ---

    /// Plays `func` on the beat grid, hot-swapping any function of the same name.
    pub fn schedule_func(&self, func: SwimFn, args: impl Into<CallArgs>) -> Result<Arc<AsyncRunner>> {
        self.schedule(func, args.into(), None, false)
    }

    /// Plays `func` starting at a quantized point in time.
    pub fn schedule_at(
        &self,
        func: SwimFn,
        args: impl Into<CallArgs>,
        quant: Quant,
    ) -> Result<Arc<AsyncRunner>> {
        let deadline = self.quantize(quant);
        if !deadline.is_finite() {
            return Err(Error::BadArgument {
                function: func.name().to_string(),
                reason: format!("{quant:?} does not resolve to a finite clock time"),
            });
        }
        self.schedule(func, args.into(), Some(deadline), false)
    }

    /// Plays `func` as a background job, which survives [`reset`](Self::reset).
    pub fn schedule_background(
        &self,
        func: SwimFn,
        args: impl Into<CallArgs>,
    ) -> Result<Arc<AsyncRunner>> {
        self.schedule(func, args.into(), None, true)
    }

    /// The clock time a quantization target refers to.
    pub fn quantize(&self, quant: Quant) -> f64 {
        let now = self.clock.time();
        match quant {
            Quant::Now => now,
            Quant::NextBeat => now + self.clock.get_beat_time(1.0, Some(now), true),
            Quant::NextBar => now + self.clock.get_bar_time(1.0, Some(now), true),
            Quant::Beats(beats) => now + self.clock.get_beat_time(beats, Some(now), false),
            Quant::At(time) => time,
        }
    }

    fn schedule(
        &self,
        func: SwimFn,
        args: CallArgs,
        deadline: Option<f64>,
        background: bool,
    ) -> Result<Arc<AsyncRunner>> {
        func.validate()?;
        let name = func.name().to_string();
        // The registry stays locked until the runner is awake, so a loop that is
        // exiting cannot release the runner in between.
        let mut runners = self.lock_runners();
        let (runner, created) = match runners.get(&name) {
            Some(runner) => (runner.clone(), false),
            None => {
                let runner = Arc::new(AsyncRunner::new(
                    name.clone(),
                    self.clock.clone(),
                    self.sleeper.clone(),
                    self.me.clone(),
                    self.config.max_states,
                    self.config.lookahead(),
                ));
                runners.insert(name.clone(), runner.clone());
                (runner, true)
            }
        };
        let pushed = match deadline {
            Some(deadline) => runner.push_deferred(deadline, func, args),
            None => runner.push(func, args),
        };
        if let Err(error) = pushed {
            if created {
                runners.remove(&name);
            }
            return Err(error);
        }
        if background {
            runner.set_background(true);
        }
        runner.wake();
        debug!(runner = %name, ?deadline, background, "Scheduled function");
        Ok(runner)
    }

    // --- Registry ---

    pub fn runner(&self, name: &str) -> Option<Arc<AsyncRunner>> {
        self.lock_runners().get(name).cloned()
    }

    /// Every registered runner, sorted by name.
    pub fn runners(&self) -> Vec<Arc<AsyncRunner>> {
        let mut runners: Vec<_> = self.lock_runners().values().cloned().collect();
        runners.sort_by(|a, b| a.name().cmp(b.name()));
        runners
    }

    /// Stops the runner called `name`. Returns `false` if there was none.
    pub fn stop_runner(&self, name: &str, reset_states: bool) -> bool {
        let removed = self.lock_runners().remove(name);
        match removed {
            Some(runner) => {
                Self::halt(&runner, reset_states);
                true
            }
            None => false,
        }
    }

    /// Stops a runner given by handle. Safe to call any number of times.
    pub fn stop_runner_handle(&self, runner: &Arc<AsyncRunner>, reset_states: bool) {
        {
            let mut runners = self.lock_runners();
            if runners
                .get(runner.name())
                .is_some_and(|registered| Arc::ptr_eq(registered, runner))
            {
                runners.remove(runner.name());
            }
        }
        Self::halt(runner, reset_states);
    }

    fn halt(runner: &AsyncRunner, reset_states: bool) {
        info!(runner = runner.name(), "Stopping runner");
        runner.stop();
        if reset_states {
            runner.reset_states();
        }
    }

    /// Stops every runner except background jobs.
    pub fn reset(&self) {
        let stopped: Vec<_> = {
            let mut runners = self.lock_runners();
            let names: Vec<String> = runners
                .iter()
                .filter(|(_, runner)| !runner.is_background())
                .map(|(name, _)| name.clone())
                .collect();
            names
                .into_iter()
                .filter_map(|name| runners.remove(&name))
                .collect()
        };
        for runner in &stopped {
            Self::halt(runner, true);
        }
    }

    /// Stops every runner, background jobs included.
    pub fn shutdown(&self) {
        let stopped: Vec<_> = self.lock_runners().drain().map(|(_, runner)| runner).collect();
        for runner in &stopped {
            Self::halt(runner, true);
        }
    }

    /// Called by a runner whose loop exited.
    pub(crate) fn release_runner(&self, runner: &Arc<AsyncRunner>) {
        let mut runners = self.lock_runners();
        let registered = runners
            .get(runner.name())
            .is_some_and(|registered| Arc::ptr_eq(registered, runner));
        if registered && !runner.is_running() {
            runners.remove(runner.name());
        }
    }

    // --- Policy and reports ---

    /// Whether functions run one period early with their time shifted forward.
    pub fn deferred(&self) -> bool {
        self.deferred.load(Ordering::Relaxed)
    }

    pub fn set_deferred(&self, deferred: bool) {
        self.deferred.store(deferred, Ordering::Relaxed);
    }

    /// Subscribes to runner reports (swaps, crashes, exits).
    pub fn subscribe_reports(&self) -> broadcast::Receiver<RunnerEvent> {
        self.reports.subscribe()
    }

    pub(crate) fn report(&self, event: RunnerEvent) {
        self.reports.send(event).ok();
    }
}

impl Handler for Scheduler {
    fn hook(&self, event: &Event) {
        match event {
            Event::TempoChange { old, new } => {
                let ratio = old / new;
                for runner in self.runners() {
                    runner.rescale_interval_shift(ratio);
                }
            }
            Event::Stop => self.reset(),
            _ => {}
        }
    }
}
