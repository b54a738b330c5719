//! Defines all configuration structures for the Swimclock engine.
//!
//! These structs are deserialized with `serde` through the `config` crate, from a
//! TOML file layered under `SWIMCLOCK__*` environment variables. Every field has a
//! default, so an empty file (or no file at all) yields a usable engine.

use crate::error::{Error, Result};
use crate::time::{MAX_TEMPO, MIN_TEMPO};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// The top-level configuration for the `SwimEngine`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EngineConfig {
    /// Tempo, meter and time source.
    #[serde(default)]
    pub clock: ClockConfig,

    /// Runner and scheduling policy.
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

/// Clock settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ClockConfig {
    /// Initial tempo in beats per minute.
    #[serde(default = "default_tempo")]
    pub tempo: f64,

    #[serde(default = "default_beats_per_bar")]
    pub beats_per_bar: u32,

    /// Which backend keeps time.
    #[serde(default)]
    pub source: ClockSourceKind,

    /// Rate of the clock driver, which refreshes external sources and emits ticks.
    #[serde(default)]
    pub resolution: ClockResolution,
}

/// Selects the clock backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClockSourceKind {
    /// Monotonic wall-clock reference owned by this process.
    #[default]
    Internal,
    /// A shared session clock sampled in the background.
    Synced,
}

/// Defines the operational speed of the clock driver.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClockResolution {
    /// ~60 ticks per second. Suitable for beat-accurate tick events.
    #[default]
    High,
    /// ~30 ticks per second.
    Medium,
    /// ~1 tick per second. Too coarse for tick events at most tempos.
    Low,
    /// A user-defined speed in ticks per second.
    Custom { ticks_per_second: u64 },
}

impl ClockResolution {
    /// The interval between two driver ticks.
    pub fn tick_interval(&self) -> Duration {
        let per_second = match self {
            ClockResolution::High => 60,
            ClockResolution::Medium => 30,
            ClockResolution::Low => 1,
            ClockResolution::Custom { ticks_per_second } => (*ticks_per_second).max(1),
        };
        Duration::from_secs_f64(1.0 / per_second as f64)
    }
}

/// Scheduling policy.
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Run functions one period early and shift their perceived time forward.
    #[serde(default)]
    pub deferred: bool,

    /// How many function states each runner remembers for crash recovery.
    #[serde(default = "default_max_states")]
    pub max_states: usize,

    /// Poll interval of the sleeper when the clock cannot sleep natively.
    #[serde(default = "default_sleep_resolution_ms")]
    pub sleep_resolution_ms: u64,

    /// Added to output deadlines so transports receive messages ahead of time.
    #[serde(default = "default_lookahead_ms")]
    pub lookahead_ms: f64,
}

impl SchedulerConfig {
    pub fn sleep_resolution(&self) -> Duration {
        Duration::from_millis(self.sleep_resolution_ms.max(1))
    }

    pub fn lookahead(&self) -> f64 {
        self.lookahead_ms / 1000.0
    }
}

impl EngineConfig {
    /// Loads the configuration from an optional TOML file and `SWIMCLOCK__*` variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }
        let config: EngineConfig = builder
            .add_source(
                config::Environment::with_prefix("SWIMCLOCK")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parses a configuration from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: EngineConfig = config::Config::builder()
            .add_source(config::File::from_str(text, config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects values the clock would refuse at runtime.
    pub fn validate(&self) -> Result<()> {
        let tempo = self.clock.tempo;
        if !(MIN_TEMPO..=MAX_TEMPO).contains(&tempo) {
            return Err(Error::InvalidTempo {
                tempo,
                min: MIN_TEMPO,
                max: MAX_TEMPO,
            });
        }
        if self.clock.beats_per_bar == 0 {
            return Err(Error::InvalidBeatsPerBar(0));
        }
        let lookahead = self.scheduler.lookahead_ms;
        if !lookahead.is_finite() || lookahead < 0.0 {
            return Err(Error::InvalidLookahead(lookahead));
        }
        Ok(())
    }
}

// --- Default value functions for serde ---

fn default_tempo() -> f64 {
    120.0
}

fn default_beats_per_bar() -> u32 {
    4
}

fn default_max_states() -> usize {
    3
}

fn default_sleep_resolution_ms() -> u64 {
    1
}

fn default_lookahead_ms() -> f64 {
    100.0
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            tempo: default_tempo(),
            beats_per_bar: default_beats_per_bar(),
            source: ClockSourceKind::default(),
            resolution: ClockResolution::default(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            deferred: false,
            max_states: default_max_states(),
            sleep_resolution_ms: default_sleep_resolution_ms(),
            lookahead_ms: default_lookahead_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_uses_defaults() {
        let config = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(config.clock.tempo, 120.0);
        assert_eq!(config.clock.beats_per_bar, 4);
        assert_eq!(config.clock.source, ClockSourceKind::Internal);
        assert_eq!(config.scheduler.max_states, 3);
        assert!(!config.scheduler.deferred);
    }

    #[test]
    fn toml_overrides_fields() {
        let config = EngineConfig::from_toml_str(
            r#"
            [clock]
            tempo = 90.0
            beats_per_bar = 3
            source = "synced"
            resolution = { custom = { ticks_per_second = 240 } }

            [scheduler]
            deferred = true
            lookahead_ms = 50.0
            "#,
        )
        .unwrap();
        assert_eq!(config.clock.tempo, 90.0);
        assert_eq!(config.clock.beats_per_bar, 3);
        assert_eq!(config.clock.source, ClockSourceKind::Synced);
        assert_eq!(
            config.clock.resolution.tick_interval(),
            Duration::from_secs_f64(1.0 / 240.0)
        );
        assert!(config.scheduler.deferred);
        assert!((config.scheduler.lookahead() - 0.05).abs() < 1e-12);
    }

    #[test]
    fn out_of_range_tempo_is_rejected() {
        let err = EngineConfig::from_toml_str("[clock]\ntempo = 2000.0").unwrap_err();
        assert!(matches!(err, Error::InvalidTempo { .. }));
    }

    #[test]
    fn unusable_lookahead_is_rejected() {
        for value in ["nan", "inf", "-inf", "-5.0"] {
            let toml = format!("[scheduler]\nlookahead_ms = {value}");
            let err = EngineConfig::from_toml_str(&toml).unwrap_err();
            assert!(matches!(err, Error::InvalidLookahead(_)), "{value}: {err}");
        }
        let config = EngineConfig::from_toml_str("[scheduler]\nlookahead_ms = 0.0").unwrap();
        assert_eq!(config.scheduler.lookahead(), 0.0);
    }
}
