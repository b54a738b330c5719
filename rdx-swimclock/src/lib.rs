//! # Swimclock
//!
//! A beat-synchronized scheduling engine for live-coded music.
//!
//! Swimclock keeps musical time and repeatedly re-invokes user functions at
//! deadlines computed from that time. Functions can be replaced while they are
//! running, quantized to the next beat or bar, and a function that fails is
//! rolled back to its previous version without disturbing the rest of the
//! performance.
//!
//! ## Core Concepts
//!
//! - **Clock**: The single source of musical time (tempo, beats, bars, phase).
//!   It is backed by a pluggable [`ClockSource`](time::ClockSource), either an
//!   internal monotonic reference or an external shared session.
//! - **Runner**: One [`AsyncRunner`](components::runner::AsyncRunner) per function
//!   name. It holds a small history of function states and loops: compute the next
//!   deadline, sleep, run the function.
//! - **Swimming**: A function asks for its next iteration by calling
//!   [`SwimCtx::again`](components::context::SwimCtx::again). A function that does
//!   not ask stops.
//! - **Event-Driven**: Transport and tempo changes travel through an
//!   [`EventBus`](bus::EventBus) that the clock, sleeper and scheduler subscribe to.
//! - **Configuration-Driven**: Tempo, clock backend and scheduling policy come from
//!   an [`EngineConfig`](config::EngineConfig), often loaded from a file.
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use swimclock::prelude::*;
//! use std::sync::atomic::{AtomicU64, Ordering};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let engine = SwimEngine::new(EngineConfig::default())?;
//!     engine.start();
//!
//!     let hits = Arc::new(AtomicU64::new(0));
//!     let kick = SwimFn::new("kick", move |ctx: SwimCtx| {
//!         let hits = hits.clone();
//!         async move {
//!             hits.fetch_add(1, Ordering::Relaxed);
//!             ctx.again(args! { p => 0.5 })?;
//!             Ok(())
//!         }
//!     })
//!     .param("p", 0.5);
//!
//!     engine.scheduler().schedule_func(kick, args! {})?;
//!     tokio::signal::ctrl_c().await?;
//!     engine.stop();
//!     Ok(())
//! }
//! ```

pub const ENGINE_NAME: &str = "Swim Engine";
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod args;
pub mod bus;
pub mod common;
pub mod components;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod scheduler;
pub mod time;

pub use error::{Error, Result};

/// A prelude module for easy importing of the most common Swimclock types.
pub mod prelude {
    pub use crate::args;
    pub use crate::args::{Args, CallArgs, Value};
    pub use crate::bus::{EventBus, Handler};
    pub use crate::common::{HandlerId, StateId};
    pub use crate::components::context::SwimCtx;
    pub use crate::components::io::{LogSender, OutputSender, PatternParser, WordParser};
    pub use crate::components::runner::AsyncRunner;
    pub use crate::components::state::SwimFn;
    pub use crate::config::{ClockResolution, ClockSourceKind, EngineConfig};
    pub use crate::engine::SwimEngine;
    pub use crate::error::{Error, Result};
    pub use crate::events::{Event, EventKind, RunnerEvent, Subscription};
    pub use crate::scheduler::{Quant, Scheduler};
    pub use crate::time::{Clock, TimeShift, TransportState};
}
