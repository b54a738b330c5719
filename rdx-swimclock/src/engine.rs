//! The engine that wires the whole Swimclock system together.

use crate::bus::EventBus;
use crate::config::{ClockSourceKind, EngineConfig};
use crate::error::Result;
use crate::events::{Event, EventKind};
use crate::scheduler::Scheduler;
use crate::time::{
    Clock, ClockSource, InternalSource, SessionClock, SharedSession, Sleeper, SyncedSource,
    TransportState,
};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;
use tracing::{error, info};

/// The main Swimclock engine.
///
/// This struct is the environment of a performance. It owns the event bus, the
/// clock, the sleeper and the scheduler, registers them on the bus (in that
/// order), and drives the transport. Components get what they need at
/// construction time; nothing is global.
pub struct SwimEngine {
    config: Arc<EngineConfig>,
    bus: Arc<EventBus>,
    clock: Arc<Clock>,
    sleeper: Arc<Sleeper>,
    scheduler: Arc<Scheduler>,
    driver: Mutex<Option<broadcast::Sender<()>>>,
}

impl SwimEngine {
    /// Creates an engine with the clock backend named in the configuration.
    ///
    /// A `synced` backend gets a fresh [`SharedSession`]; use
    /// [`with_session`](Self::with_session) to join an existing one.
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let tempo = config.clock.tempo;
        let source: Arc<dyn ClockSource> = match config.clock.source {
            ClockSourceKind::Internal => Arc::new(InternalSource::new(tempo)),
            ClockSourceKind::Synced => Arc::new(SyncedSource::new(SharedSession::new(tempo))),
        };
        Self::with_source(config, source)
    }

    /// Creates an engine that follows a shared session. The session's tempo wins
    /// over the configured one.
    pub fn with_session(config: EngineConfig, session: Arc<dyn SessionClock>) -> Result<Self> {
        Self::with_source(config, Arc::new(SyncedSource::new(session)))
    }

    /// Creates an engine around any clock backend.
    pub fn with_source(config: EngineConfig, source: Arc<dyn ClockSource>) -> Result<Self> {
        config.validate()?;
        let bus = Arc::new(EventBus::new());
        let clock = Arc::new(Clock::new(source, bus.clone(), config.clock.beats_per_bar)?);
        let sleeper = Arc::new(Sleeper::new(
            clock.clone(),
            config.scheduler.sleep_resolution(),
        ));
        let scheduler = Scheduler::new(clock.clone(), sleeper.clone(), config.scheduler.clone());

        let clock_id = bus.add_handler(clock.clone());
        for kind in EventKind::TRANSPORT {
            bus.register(clock_id, kind);
        }
        let sleeper_id = bus.add_handler(sleeper.clone());
        bus.register(sleeper_id, EventKind::Pause);
        bus.register(sleeper_id, EventKind::Stop);
        let scheduler_id = bus.add_handler(scheduler.clone());
        bus.register(scheduler_id, EventKind::TempoChange);
        bus.register(scheduler_id, EventKind::Stop);

        info!(
            source = clock.source_name(),
            tempo = clock.tempo(),
            beats_per_bar = clock.beats_per_bar(),
            "{} ready",
            crate::ENGINE_NAME
        );
        Ok(Self {
            config: Arc::new(config),
            bus,
            clock,
            sleeper,
            scheduler,
            driver: Mutex::new(None),
        })
    }

    // --- Transport ---

    /// Starts the transport, or resumes it if paused. Spawns the clock driver the
    /// first time.
    pub fn start(&self) {
        self.spawn_driver();
        match self.clock.transport() {
            TransportState::Stopped => {
                info!("Transport started");
                self.bus.dispatch(Event::Start);
            }
            TransportState::Paused => self.resume(),
            TransportState::Running => {}
        }
    }

    pub fn pause(&self) {
        if self.clock.transport() == TransportState::Running {
            info!(time = self.clock.time(), "Transport paused");
            self.bus.dispatch(Event::Pause);
        }
    }

    pub fn resume(&self) {
        if self.clock.transport() == TransportState::Paused {
            info!(time = self.clock.time(), "Transport resumed");
            self.bus.dispatch(Event::Resume);
        }
    }

    /// Stops the transport and every runner that is not a background job.
    pub fn stop(&self) {
        info!(time = self.clock.time(), "Transport stopped");
        self.bus.dispatch(Event::Stop);
    }

    pub fn set_tempo(&self, bpm: f64) -> Result<()> {
        self.clock.set_tempo(bpm)
    }

    fn spawn_driver(&self) {
        let mut driver = self.driver.lock().unwrap_or_else(PoisonError::into_inner);
        if driver.is_some() {
            return;
        }
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let resolution = self.config.clock.resolution.tick_interval();
        tokio::spawn(self.clock.clone().run(resolution, shutdown_rx));
        *driver = Some(shutdown_tx);
    }

    // --- Accessors ---

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn clock(&self) -> &Arc<Clock> {
        &self.clock
    }

    pub fn sleeper(&self) -> &Arc<Sleeper> {
        &self.sleeper
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }
}

impl Drop for SwimEngine {
    fn drop(&mut self) {
        let driver = self
            .driver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(shutdown_tx) = driver {
            if shutdown_tx.send(()).is_err() {
                error!("Failed to send shutdown signal to the clock driver.");
            }
        }
        self.scheduler.shutdown();
        self.bus.clear();
        info!("{} has shut down.", crate::ENGINE_NAME);
    }
}
