//! Cancellable sleeping in clock time.

use super::Clock;
use crate::bus::Handler;
use crate::events::Event;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::trace;

/// A deadline closer than this counts as reached.
const REACHED_TOLERANCE: f64 = 1e-6;
/// Lower bound for a single poll so that a tiny remainder never busy-spins.
const MIN_POLL: Duration = Duration::from_micros(1);
/// Longest single wait in seconds. Far or unbounded deadlines are slept in chunks.
const MAX_STEP: f64 = 3600.0;

/// How a sleep ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepOutcome {
    /// The clock reached the deadline.
    Elapsed,
    /// The transport paused or stopped first. Callers must re-check state.
    Interrupted,
}

/// Sleeps until absolute clock deadlines.
///
/// Uses the clock source's native sleep when it has one and otherwise polls the
/// clock. Every outstanding sleep is cut short when the transport pauses or
/// stops. Any number of tasks may sleep at once.
pub struct Sleeper {
    clock: Arc<Clock>,
    resolution: Duration,
    interrupts: watch::Sender<u64>,
}

impl Sleeper {
    pub fn new(clock: Arc<Clock>, resolution: Duration) -> Self {
        let (interrupts, _) = watch::channel(0);
        Self {
            clock,
            resolution,
            interrupts,
        }
    }

    pub fn clock(&self) -> &Arc<Clock> {
        &self.clock
    }

    pub fn resolution(&self) -> Duration {
        self.resolution
    }

    /// Sleeps until the clock reads `deadline`.
    ///
    /// Returns [`SleepOutcome::Interrupted`] right away if the clock is not running.
    pub async fn sleep_until(&self, deadline: f64) -> SleepOutcome {
        let mut interrupted = self.interrupts.subscribe();
        if !self.clock.is_running() {
            return SleepOutcome::Interrupted;
        }
        tokio::select! {
            _ = self.wait(deadline) => SleepOutcome::Elapsed,
            _ = interrupted.changed() => SleepOutcome::Interrupted,
        }
    }

    async fn wait(&self, deadline: f64) {
        loop {
            let remaining = deadline - self.clock.time();
            if remaining <= REACHED_TOLERANCE {
                return;
            }
            // `min` also maps a NaN remainder to a full step.
            let step = remaining.min(MAX_STEP);
            match self.clock.native_sleep(step) {
                Some(sleep) => sleep.await,
                None => {
                    let poll = Duration::try_from_secs_f64(step)
                        .map_or(self.resolution, |step| self.resolution.min(step))
                        .max(MIN_POLL);
                    tokio::time::sleep(poll).await;
                }
            }
        }
    }

    /// Cuts every outstanding sleep short.
    pub fn interrupt(&self) {
        trace!("Interrupting sleepers");
        self.interrupts.send_modify(|generation| *generation = generation.wrapping_add(1));
    }
}

impl Handler for Sleeper {
    fn hook(&self, event: &Event) {
        if matches!(event, Event::Pause | Event::Stop) {
            self.interrupt();
        }
    }
}
