//! A clock backend that follows a shared session timeline.
//!
//! Peers in a session agree on one beat grid: a beat position anchored at an
//! instant, advancing at the session tempo. A tempo change re-anchors the grid at
//! the current beat so no peer sees the beat jump. [`SharedSession`] is an
//! in-process session that several engines can join. Anything else that can
//! report a beat grid (a network link, a hardware clock) plugs in through
//! [`SessionClock`].

use super::source::ClockSource;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::time::Instant;
use tracing::debug;

/// One observation of the session timeline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionSnapshot {
    /// Session time in seconds.
    pub time: f64,
    pub tempo: f64,
    /// Beat position at `time`.
    pub beat: f64,
}

/// A shared timeline that can be observed and whose tempo can be proposed.
pub trait SessionClock: Send + Sync + 'static {
    fn capture(&self) -> SessionSnapshot;
    fn propose_tempo(&self, bpm: f64);
}

#[derive(Debug)]
struct Timeline {
    anchor_time: f64,
    anchor_beat: f64,
    tempo: f64,
}

impl Timeline {
    fn beat_at(&self, time: f64) -> f64 {
        self.anchor_beat + (time - self.anchor_time) * self.tempo / 60.0
    }
}

/// An in-process session timeline.
#[derive(Debug)]
pub struct SharedSession {
    epoch: Instant,
    timeline: Mutex<Timeline>,
}

impl SharedSession {
    pub fn new(tempo: f64) -> Arc<Self> {
        Arc::new(Self {
            epoch: Instant::now(),
            timeline: Mutex::new(Timeline {
                anchor_time: 0.0,
                anchor_beat: 0.0,
                tempo,
            }),
        })
    }

    fn now(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }

    fn lock(&self) -> MutexGuard<'_, Timeline> {
        self.timeline.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SessionClock for SharedSession {
    fn capture(&self) -> SessionSnapshot {
        let time = self.now();
        let timeline = self.lock();
        SessionSnapshot {
            time,
            tempo: timeline.tempo,
            beat: timeline.beat_at(time),
        }
    }

    fn propose_tempo(&self, bpm: f64) {
        let time = self.now();
        let mut timeline = self.lock();
        let beat = timeline.beat_at(time);
        timeline.anchor_time = time;
        timeline.anchor_beat = beat;
        timeline.tempo = bpm;
    }
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    snapshot: SessionSnapshot,
    captured_at: Instant,
}

impl Sample {
    fn take(session: &dyn SessionClock) -> Self {
        Self {
            snapshot: session.capture(),
            captured_at: Instant::now(),
        }
    }

    fn since(&self) -> f64 {
        self.captured_at.elapsed().as_secs_f64()
    }
}

/// A [`ClockSource`] that samples a [`SessionClock`] on every driver tick and
/// extrapolates between samples.
///
/// It has no native sleep, so the sleeper polls it.
pub struct SyncedSource {
    session: Arc<dyn SessionClock>,
    sample: Mutex<Sample>,
}

impl SyncedSource {
    pub fn new(session: Arc<dyn SessionClock>) -> Self {
        let sample = Sample::take(session.as_ref());
        Self {
            session,
            sample: Mutex::new(sample),
        }
    }

    fn sample(&self) -> Sample {
        *self.sample.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ClockSource for SyncedSource {
    fn name(&self) -> &'static str {
        "synced"
    }

    fn internal_time(&self) -> f64 {
        let sample = self.sample();
        sample.snapshot.time + sample.since()
    }

    fn tempo(&self) -> f64 {
        self.sample().snapshot.tempo
    }

    fn set_tempo(&self, bpm: f64) {
        self.session.propose_tempo(bpm);
        *self.sample.lock().unwrap_or_else(PoisonError::into_inner) =
            Sample::take(self.session.as_ref());
    }

    fn refresh(&self) -> Option<(f64, f64)> {
        let fresh = Sample::take(self.session.as_ref());
        let mut sample = self.sample.lock().unwrap_or_else(PoisonError::into_inner);
        let old = sample.snapshot.tempo;
        *sample = fresh;
        let new = fresh.snapshot.tempo;
        if old != new {
            debug!(old, new, "Session tempo changed by a peer");
            Some((old, new))
        } else {
            None
        }
    }

    fn start_offset(&self) -> f64 {
        let sample = self.sample();
        let tempo = sample.snapshot.tempo;
        let beat = sample.snapshot.beat + sample.since() * tempo / 60.0;
        beat.rem_euclid(1.0) * 60.0 / tempo
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn tempo_change_keeps_the_beat_continuous() {
        let session = SharedSession::new(120.0);
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!((session.capture().beat - 2.0).abs() < 1e-9);

        session.propose_tempo(60.0);
        tokio::time::advance(Duration::from_secs(1)).await;
        let snapshot = session.capture();
        assert_eq!(snapshot.tempo, 60.0);
        assert!((snapshot.beat - 3.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn peer_tempo_changes_are_reported_once() {
        let session = SharedSession::new(120.0);
        let source = SyncedSource::new(session.clone());
        let peer = SyncedSource::new(session.clone());

        peer.set_tempo(140.0);
        assert_eq!(peer.refresh(), None);
        assert_eq!(source.refresh(), Some((120.0, 140.0)));
        assert_eq!(source.refresh(), None);
        assert_eq!(source.tempo(), 140.0);
    }

    #[tokio::test(start_paused = true)]
    async fn start_offset_is_the_position_inside_the_session_beat() {
        let session = SharedSession::new(120.0);
        tokio::time::advance(Duration::from_millis(1100)).await;
        let source = SyncedSource::new(session);
        assert!((source.start_offset() - 0.1).abs() < 1e-9);
        assert!((source.internal_time() - 1.1).abs() < 1e-9);
    }
}
