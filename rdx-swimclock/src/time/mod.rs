//! Musical time.
//!
//! The [`Clock`] is the single source of truth for tempo, beats, bars and phase.
//! It reads raw time from a [`ClockSource`] and adds transport state on top: time
//! only advances while the transport is running, and freezes on pause or stop.
//!
//! The clock is a bus [`Handler`] for the transport events, and its driver task
//! ([`Clock::run`]) refreshes external sources and emits [`Event::Tick`].

pub mod shift;
pub mod sleeper;
pub mod source;
pub mod synced;

pub use shift::TimeShift;
pub use sleeper::{SleepOutcome, Sleeper};
pub use source::{ClockSource, InternalSource};
pub use synced::{SessionClock, SessionSnapshot, SharedSession, SyncedSource};

use crate::bus::{EventBus, Handler};
use crate::error::{Error, Result};
use crate::events::Event;
use futures::future::BoxFuture;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

/// Slowest accepted tempo in BPM.
pub const MIN_TEMPO: f64 = 1.0;
/// Fastest accepted tempo in BPM.
pub const MAX_TEMPO: f64 = 999.0;

/// Waits this close to a boundary are treated as landing on it.
const SNAP_TOLERANCE: f64 = 1e-8;

/// Whether the clock is advancing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Stopped,
    Running,
    Paused,
}

#[derive(Debug)]
struct ClockState {
    /// Source time at the last start or resume.
    origin: f64,
    /// Clock time accumulated before the last pause or stop.
    elapsed: f64,
    beats_per_bar: u32,
    last_tick: Option<i64>,
}

/// The musical clock.
pub struct Clock {
    source: Arc<dyn ClockSource>,
    bus: Arc<EventBus>,
    state: Mutex<ClockState>,
    transport: watch::Sender<TransportState>,
}

impl Clock {
    pub fn new(source: Arc<dyn ClockSource>, bus: Arc<EventBus>, beats_per_bar: u32) -> Result<Self> {
        if beats_per_bar == 0 {
            return Err(Error::InvalidBeatsPerBar(beats_per_bar));
        }
        let tempo = source.tempo();
        if !(MIN_TEMPO..=MAX_TEMPO).contains(&tempo) {
            return Err(Error::InvalidTempo {
                tempo,
                min: MIN_TEMPO,
                max: MAX_TEMPO,
            });
        }
        let (transport, _) = watch::channel(TransportState::Stopped);
        Ok(Self {
            source,
            bus,
            state: Mutex::new(ClockState {
                origin: 0.0,
                elapsed: 0.0,
                beats_per_bar,
                last_tick: None,
            }),
            transport,
        })
    }

    fn lock(&self) -> MutexGuard<'_, ClockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn time_locked(&self, state: &ClockState) -> f64 {
        if *self.transport.borrow() == TransportState::Running {
            state.elapsed + (self.source.internal_time() - state.origin)
        } else {
            state.elapsed
        }
    }

    pub fn source_name(&self) -> &'static str {
        self.source.name()
    }

    /// Seconds of musical time since the transport started.
    pub fn time(&self) -> f64 {
        let state = self.lock();
        self.time_locked(&state)
    }

    /// The clock time as seen through a time-shift.
    pub fn shifted_time(&self, shift: &TimeShift) -> f64 {
        shift.apply(self.time())
    }

    // --- Transport ---

    pub fn transport(&self) -> TransportState {
        *self.transport.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.transport() == TransportState::Running
    }

    /// Subscribes to transport changes.
    pub fn watch_transport(&self) -> watch::Receiver<TransportState> {
        self.transport.subscribe()
    }

    /// Completes once the transport is running.
    pub async fn wait_until_running(&self) {
        let mut rx = self.transport.subscribe();
        rx.wait_for(|state| *state == TransportState::Running).await.ok();
    }

    // --- Tempo and meter ---

    pub fn tempo(&self) -> f64 {
        self.source.tempo()
    }

    /// Sets the tempo and announces the change on the bus.
    pub fn set_tempo(&self, bpm: f64) -> Result<()> {
        if !(MIN_TEMPO..=MAX_TEMPO).contains(&bpm) {
            return Err(Error::InvalidTempo {
                tempo: bpm,
                min: MIN_TEMPO,
                max: MAX_TEMPO,
            });
        }
        let old = self.source.tempo();
        self.source.set_tempo(bpm);
        if old != bpm {
            info!(old, new = bpm, "Tempo changed");
            self.bus.dispatch(Event::TempoChange { old, new: bpm });
        }
        Ok(())
    }

    pub fn beats_per_bar(&self) -> u32 {
        self.lock().beats_per_bar
    }

    pub fn set_beats_per_bar(&self, beats: u32) -> Result<()> {
        if beats == 0 {
            return Err(Error::InvalidBeatsPerBar(beats));
        }
        self.lock().beats_per_bar = beats;
        Ok(())
    }

    /// Seconds per beat at the current tempo.
    pub fn beat_duration(&self) -> f64 {
        60.0 / self.tempo()
    }

    pub fn bar_duration(&self) -> f64 {
        self.beat_duration() * self.beats_per_bar() as f64
    }

    // --- Position ---

    pub fn beat(&self) -> i64 {
        (self.time() / self.beat_duration()).floor() as i64
    }

    pub fn bar(&self) -> i64 {
        self.beat().div_euclid(self.beats_per_bar() as i64)
    }

    /// Seconds into the current beat, in `[0, beat_duration)`.
    pub fn phase(&self) -> f64 {
        self.time().rem_euclid(self.beat_duration())
    }

    /// Seconds to wait for `n_beats` to pass.
    ///
    /// With `sync`, the wait lands on a multiple of the interval counted from the
    /// clock origin, measured at `time` (the current time when `None`). Without it,
    /// the raw interval is returned.
    pub fn get_beat_time(&self, n_beats: f64, time: Option<f64>, sync: bool) -> f64 {
        let interval = n_beats * self.beat_duration();
        if interval <= 0.0 {
            return 0.0;
        }
        if !sync {
            return interval;
        }
        let time = time.unwrap_or_else(|| self.time());
        let wait = interval - time.rem_euclid(interval);
        if interval - wait < SNAP_TOLERANCE || wait < SNAP_TOLERANCE {
            interval
        } else {
            wait
        }
    }

    pub fn get_bar_time(&self, n_bars: f64, time: Option<f64>, sync: bool) -> f64 {
        self.get_beat_time(n_bars * self.beats_per_bar() as f64, time, sync)
    }

    // --- Sleeping ---

    pub fn can_sleep(&self) -> bool {
        self.source.can_sleep()
    }

    /// The source's own sleep for `seconds` of clock time, if it has one.
    pub fn native_sleep(&self, seconds: f64) -> Option<BoxFuture<'static, ()>> {
        self.source.native_sleep(seconds)
    }

    // --- Driver ---

    /// Refreshes the source and emits a tick when the integer beat changed.
    pub fn poll(&self) {
        if let Some((old, new)) = self.source.refresh() {
            info!(old, new, source = self.source.name(), "Tempo changed by clock source");
            self.bus.dispatch(Event::TempoChange { old, new });
        }
        if !self.is_running() {
            return;
        }
        let beat = self.beat();
        let changed = {
            let mut state = self.lock();
            let changed = state.last_tick != Some(beat);
            state.last_tick = Some(beat);
            changed
        };
        if changed {
            let bar = beat.div_euclid(self.beats_per_bar() as i64);
            self.bus.dispatch(Event::Tick { beat, bar });
        }
    }

    /// Runs the clock driver until a shutdown signal is received.
    pub async fn run(self: Arc<Self>, resolution: Duration, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(resolution);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        debug!(?resolution, source = self.source.name(), "Clock driver started");
        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => break,
                _ = interval.tick() => self.poll(),
            }
        }
        debug!("Clock driver stopped");
    }
}

impl Handler for Clock {
    fn hook(&self, event: &Event) {
        let mut state = self.lock();
        match event {
            Event::Start => {
                state.origin = self.source.internal_time() - self.source.start_offset();
                state.elapsed = 0.0;
                state.last_tick = None;
                self.transport.send_replace(TransportState::Running);
            }
            Event::Resume => {
                if *self.transport.borrow() == TransportState::Paused {
                    state.origin = self.source.internal_time();
                    self.transport.send_replace(TransportState::Running);
                }
            }
            Event::Pause => {
                if *self.transport.borrow() == TransportState::Running {
                    state.elapsed = self.time_locked(&state);
                    self.transport.send_replace(TransportState::Paused);
                }
            }
            Event::Stop => {
                state.elapsed = self.time_locked(&state);
                self.transport.send_replace(TransportState::Stopped);
            }
            Event::Tick { .. } | Event::TempoChange { .. } => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clock(tempo: f64) -> Arc<Clock> {
        let bus = Arc::new(EventBus::new());
        Arc::new(Clock::new(Arc::new(InternalSource::new(tempo)), bus, 4).unwrap())
    }

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn beat_time_lands_on_the_grid() {
        let clock = clock(120.0);
        assert!(approx(clock.get_beat_time(1.0, Some(0.2), true), 0.3));
        assert_eq!(clock.get_beat_time(1.0, Some(0.2), false), 0.5);
        assert_eq!(clock.get_beat_time(0.0, Some(0.2), true), 0.0);
        assert_eq!(clock.get_beat_time(-1.0, Some(0.2), true), 0.0);
        assert_eq!(clock.get_bar_time(1.0, Some(1.0), true), 1.0);
    }

    #[test]
    fn near_boundary_waits_snap_to_a_full_interval() {
        let clock = clock(120.0);
        assert_eq!(clock.get_beat_time(1.0, Some(1.0), true), 0.5);
        assert_eq!(clock.get_beat_time(1.0, Some(1.0 + 1e-10), true), 0.5);
        assert_eq!(clock.get_beat_time(1.0, Some(1.0 - 1e-10), true), 0.5);
    }

    #[test]
    fn repeated_waits_do_not_drift() {
        let clock = clock(133.0);
        for n_beats in [0.25, 1.0 / 3.0, 0.75, 1.5] {
            let interval = n_beats * clock.beat_duration();
            let mut t = 0.0123;
            for _ in 0..100 {
                t += clock.get_beat_time(n_beats, Some(t), true);
                let k = (t / interval).round();
                assert!((t - k * interval).abs() < 1e-6, "{t} is off the grid");
            }
            let first = (0.0123 / interval).ceil();
            assert!(((t / interval).round() - (first + 99.0)).abs() < 0.5);
        }
    }

    #[test]
    fn tempo_is_validated_and_announced() {
        let clock = clock(120.0);
        let mut rx = clock.bus.subscribe();
        assert!(matches!(clock.set_tempo(0.5), Err(Error::InvalidTempo { .. })));
        assert!(matches!(clock.set_tempo(1200.0), Err(Error::InvalidTempo { .. })));
        clock.set_tempo(90.0).unwrap();
        assert_eq!(clock.tempo(), 90.0);
        assert_eq!(rx.try_recv().unwrap(), Event::TempoChange { old: 120.0, new: 90.0 });
        assert!(clock.set_beats_per_bar(0).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn pause_freezes_time() {
        let clock = clock(120.0);
        assert_eq!(clock.time(), 0.0);
        clock.hook(&Event::Start);
        tokio::time::advance(Duration::from_millis(1500)).await;
        assert!((clock.time() - 1.5).abs() < 1e-9);
        assert_eq!(clock.beat(), 3);
        assert_eq!(clock.bar(), 0);
        assert!((clock.phase() - 0.0).abs() < 1e-9);

        clock.hook(&Event::Pause);
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!((clock.time() - 1.5).abs() < 1e-9);

        clock.hook(&Event::Resume);
        tokio::time::advance(Duration::from_millis(700)).await;
        assert!((clock.time() - 2.2).abs() < 1e-9);
        assert_eq!(clock.bar(), 1);

        clock.hook(&Event::Stop);
        assert_eq!(clock.transport(), TransportState::Stopped);
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!((clock.time() - 2.2).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn tempo_change_keeps_time_continuous() {
        let clock = clock(120.0);
        clock.hook(&Event::Start);
        tokio::time::advance(Duration::from_secs(1)).await;
        clock.set_tempo(60.0).unwrap();
        assert!((clock.time() - 1.0).abs() < 1e-9);
        assert_eq!(clock.beat(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn synced_clock_starts_on_the_session_grid() {
        let session = SharedSession::new(120.0);
        tokio::time::advance(Duration::from_millis(1100)).await;
        let bus = Arc::new(EventBus::new());
        let clock = Clock::new(Arc::new(SyncedSource::new(session)), bus, 4).unwrap();
        clock.hook(&Event::Start);
        assert!((clock.phase() - 0.1).abs() < 1e-9);
        assert!(!clock.can_sleep());
    }
}
