//! Clock backends.
//!
//! A [`ClockSource`] owns the raw time reference and the tempo. The [`Clock`](super::Clock)
//! layers transport state (start, pause, resume, stop) on top of it, so sources
//! never need to know whether the performance is running.

use futures::future::BoxFuture;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// A pluggable time reference.
pub trait ClockSource: Send + Sync + 'static {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Monotonic seconds since some fixed point of the source.
    fn internal_time(&self) -> f64;

    /// Current tempo in beats per minute.
    fn tempo(&self) -> f64;

    /// Sets the tempo. The value has already been validated by the clock.
    fn set_tempo(&self, bpm: f64);

    /// Re-samples the underlying reference. Returns `(old, new)` when the tempo was
    /// changed from outside this process.
    fn refresh(&self) -> Option<(f64, f64)> {
        None
    }

    /// Seconds elapsed since the source's own last beat boundary.
    ///
    /// Used when the transport starts so that local beats line up with the source.
    fn start_offset(&self) -> f64 {
        0.0
    }

    /// Whether [`native_sleep`](ClockSource::native_sleep) returns a future.
    fn can_sleep(&self) -> bool {
        false
    }

    /// A future that completes after `seconds`, if the source can sleep on its own.
    fn native_sleep(&self, _seconds: f64) -> Option<BoxFuture<'static, ()>> {
        None
    }
}

/// A monotonic wall-clock reference owned by this process.
pub struct InternalSource {
    epoch: Instant,
    tempo: AtomicU64,
}

impl InternalSource {
    pub fn new(tempo: f64) -> Self {
        Self {
            epoch: Instant::now(),
            tempo: AtomicU64::new(tempo.to_bits()),
        }
    }
}

impl ClockSource for InternalSource {
    fn name(&self) -> &'static str {
        "internal"
    }

    fn internal_time(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }

    fn tempo(&self) -> f64 {
        f64::from_bits(self.tempo.load(Ordering::Acquire))
    }

    fn set_tempo(&self, bpm: f64) {
        self.tempo.store(bpm.to_bits(), Ordering::Release);
    }

    fn can_sleep(&self) -> bool {
        true
    }

    fn native_sleep(&self, seconds: f64) -> Option<BoxFuture<'static, ()>> {
        // `tokio` caps a `Duration::MAX` sleep at its far-future instant.
        let duration = Duration::try_from_secs_f64(seconds.max(0.0)).unwrap_or(Duration::MAX);
        Some(Box::pin(tokio::time::sleep(duration)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn internal_source_follows_tokio_time() {
        let source = InternalSource::new(120.0);
        assert_eq!(source.internal_time(), 0.0);
        tokio::time::advance(Duration::from_millis(250)).await;
        assert!((source.internal_time() - 0.25).abs() < 1e-9);

        source.set_tempo(90.0);
        assert_eq!(source.tempo(), 90.0);
        assert!(source.refresh().is_none());
        assert!(source.can_sleep());
    }

    #[tokio::test(start_paused = true)]
    async fn native_sleep_accepts_any_length() {
        let source = InternalSource::new(120.0);
        for seconds in [f64::INFINITY, f64::NAN, 1e300, -1.0] {
            let sleep = source.native_sleep(seconds).unwrap();
            let _ = tokio::time::timeout(Duration::from_secs(1), sleep).await;
        }
    }
}
