//! Contains the building blocks that turn functions into running loops.
//!
//! A [`SwimFn`](state::SwimFn) is pushed onto an [`AsyncRunner`](runner::AsyncRunner),
//! which calls it with a fresh [`SwimCtx`](context::SwimCtx) on every iteration. The
//! [`io`] traits are how function bodies reach the outside world.

pub mod context;
pub mod io;
pub mod runner;
pub mod state;
