//! Interfaces to the collaborators that turn scheduled calls into sound.
//!
//! The engine never encodes MIDI, OSC or sound-server messages itself. It only
//! computes when a message is due and hands it to an [`OutputSender`], which is
//! responsible for holding it until that deadline. Patterns are parsed by a
//! [`PatternParser`] whose output the engine indexes but never interprets.

use crate::args::{Args, Value};
use std::sync::{Mutex, PoisonError};
use tracing::info;

/// A transport that delivers timed messages.
pub trait OutputSender: Send + Sync {
    fn name(&self) -> &str;

    /// Queues `payload` for delivery at clock time `deadline`.
    fn send(&self, deadline: f64, payload: &Args) -> anyhow::Result<()>;
}

/// Turns a pattern expression into a sequence of values.
pub trait PatternParser: Send + Sync {
    fn parse(&self, expression: &str) -> anyhow::Result<Vec<Value>>;
}

/// Writes every message to the log. Useful for dry runs.
#[derive(Debug, Default)]
pub struct LogSender;

impl OutputSender for LogSender {
    fn name(&self) -> &str {
        "log"
    }

    fn send(&self, deadline: f64, payload: &Args) -> anyhow::Result<()> {
        info!(target: "swimclock::output", deadline, "{payload}");
        Ok(())
    }
}

/// Keeps every message in memory.
#[derive(Debug, Default)]
pub struct RecordingSender {
    messages: Mutex<Vec<(f64, Args)>>,
}

impl RecordingSender {
    pub fn new() -> Self {
        Self::default()
    }

    /// The messages received so far, as `(deadline, payload)`.
    pub fn messages(&self) -> Vec<(f64, Args)> {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn clear(&self) {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl OutputSender for RecordingSender {
    fn name(&self) -> &str {
        "recording"
    }

    fn send(&self, deadline: f64, payload: &Args) -> anyhow::Result<()> {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((deadline, payload.clone()));
        Ok(())
    }
}

/// Splits an expression on whitespace and reads each word as a literal.
///
/// `"60 . 64 67"` becomes `[60, ".", 64, 67]`. Real pattern languages plug in
/// through [`PatternParser`].
#[derive(Debug, Default)]
pub struct WordParser;

impl PatternParser for WordParser {
    fn parse(&self, expression: &str) -> anyhow::Result<Vec<Value>> {
        let values: Vec<Value> = expression
            .split_whitespace()
            .map(Value::parse_literal)
            .collect();
        if values.is_empty() {
            anyhow::bail!("empty pattern");
        }
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args;

    #[test]
    fn word_parser_reads_literals() {
        let values = WordParser.parse("60 . 64.5 bd").unwrap();
        assert_eq!(
            values,
            vec![
                Value::Int(60),
                Value::Str(".".into()),
                Value::Float(64.5),
                Value::Str("bd".into())
            ]
        );
        assert!(WordParser.parse("   ").is_err());
    }

    #[test]
    fn recording_sender_keeps_messages_in_order() {
        let sender = RecordingSender::new();
        sender.send(1.0, &args! { note => 60 }).unwrap();
        sender.send(1.5, &args! { note => 62 }).unwrap();
        let messages = sender.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1], (1.5, args! { note => 62 }));
        sender.clear();
        assert!(sender.messages().is_empty());
    }
}
