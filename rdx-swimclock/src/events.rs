//! Defines all public event types of the Swimclock engine.
//!
//! [`Event`] is what travels over the [`EventBus`](crate::bus::EventBus): transport
//! changes, beat ticks and tempo changes. [`RunnerEvent`] is the scheduler's report
//! stream, which tells a front-end when functions start, get swapped, crash or
//! finish.

use std::fmt;

/// An event dispatched on the bus.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// The transport started from zero.
    Start,
    /// The transport stopped. Non-background runners are stopped too.
    Stop,
    /// Time freezes until `Resume`.
    Pause,
    Resume,
    /// Fired by the clock driver whenever the integer beat changes.
    Tick { beat: i64, bar: i64 },
    /// The tempo changed from `old` to `new` BPM.
    TempoChange { old: f64, new: f64 },
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Start => EventKind::Start,
            Event::Stop => EventKind::Stop,
            Event::Pause => EventKind::Pause,
            Event::Resume => EventKind::Resume,
            Event::Tick { .. } => EventKind::Tick,
            Event::TempoChange { .. } => EventKind::TempoChange,
        }
    }
}

/// The payload-free discriminant of an [`Event`], used for subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Start,
    Stop,
    Pause,
    Resume,
    Tick,
    TempoChange,
}

impl EventKind {
    /// The four events that make up the transport.
    pub const TRANSPORT: [EventKind; 4] = [
        EventKind::Start,
        EventKind::Stop,
        EventKind::Pause,
        EventKind::Resume,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            EventKind::Start => "start",
            EventKind::Stop => "stop",
            EventKind::Pause => "pause",
            EventKind::Resume => "resume",
            EventKind::Tick => "tick",
            EventKind::TempoChange => "tempo_change",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What a handler listens to: one kind of event, or all of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Subscription {
    AllEvents,
    Only(EventKind),
}

impl From<EventKind> for Subscription {
    fn from(kind: EventKind) -> Self {
        Subscription::Only(kind)
    }
}

/// Reports emitted by runners through the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub enum RunnerEvent {
    /// A runner's loop task started.
    Started { name: String },
    /// A new version of the function took over.
    Updated { name: String, state: String },
    /// The previous version took over again after the newer one failed.
    SavedFromCrash { name: String, state: String },
    /// The function failed. The message includes the error chain.
    Crashed { name: String, error: String },
    /// The loop exited.
    Finished { name: String, iterations: u64 },
}

impl RunnerEvent {
    pub fn runner(&self) -> &str {
        match self {
            RunnerEvent::Started { name }
            | RunnerEvent::Updated { name, .. }
            | RunnerEvent::SavedFromCrash { name, .. }
            | RunnerEvent::Crashed { name, .. }
            | RunnerEvent::Finished { name, .. } => name,
        }
    }
}
