//! Error types for the scheduling engine.
//!
//! `BadFunction` and `BadArgument` are returned synchronously to whoever called the
//! scheduling API. `BadPeriod` is raised inside a runner's loop and handled there.
//! Errors from user function bodies are plain `anyhow::Error`s and never leave the
//! runner that produced them.

use thiserror::Error;

/// Result type alias for swimclock operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while scheduling or keeping time.
#[derive(Debug, Error)]
pub enum Error {
    /// A function without a usable name was given to the scheduler.
    #[error("{0:?} is not a schedulable function, functions need an identifier name")]
    BadFunction(String),

    /// Positional arguments were used, or a required keyword was missing.
    #[error("bad arguments for {function}: {reason}")]
    BadArgument { function: String, reason: String },

    /// The period keyword was non-numeric or not strictly positive.
    #[error("bad period for {function}: {reason}")]
    BadPeriod { function: String, reason: String },

    /// Tempo outside the accepted range.
    #[error("tempo must be within {min}..={max} BPM, got {tempo}")]
    InvalidTempo { tempo: f64, min: f64, max: f64 },

    /// A bar needs at least one beat.
    #[error("beats per bar must be at least 1, got {0}")]
    InvalidBeatsPerBar(u32),

    /// Output look-ahead must be a finite, non-negative number of milliseconds.
    #[error("lookahead_ms must be finite and not negative, got {0}")]
    InvalidLookahead(f64),

    /// Configuration file or environment error.
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
}
