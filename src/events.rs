//! Messages carried on the console channel.
//!
//! Relays and supervisor components never print directly; they send an
//! `Event` to the console task, which owns stdout.

use crate::output::StreamKind;

/// Severity of a supervisor notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Info,
    Success,
    Warn,
    Error,
}

/// One decoded line of child output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    /// Name of the owning process.
    pub process: String,
    /// Display tag (color) of the owning process.
    pub tag: Option<String>,
    /// Decoded text, without the line terminator.
    pub text: String,
    /// Pipe the line was read from.
    pub stream: StreamKind,
}

/// An entry for the console sink.
#[derive(Debug, Clone)]
pub enum Event {
    /// A line of child output.
    Output(OutputLine),
    /// A message from the supervisor itself.
    Notice { level: Level, text: String },
}

/// Sends notices to the console channel from sync and async contexts.
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: tokio::sync::mpsc::UnboundedSender<Event>,
}

impl Notifier {
    pub fn new(tx: tokio::sync::mpsc::UnboundedSender<Event>) -> Self {
        Self { tx }
    }

    pub fn sender(&self) -> tokio::sync::mpsc::UnboundedSender<Event> {
        self.tx.clone()
    }

    pub fn notice(&self, level: Level, text: impl Into<String>) {
        let _ = self.tx.send(Event::Notice {
            level,
            text: text.into(),
        });
    }

    pub fn info(&self, text: impl Into<String>) {
        self.notice(Level::Info, text);
    }

    pub fn success(&self, text: impl Into<String>) {
        self.notice(Level::Success, text);
    }

    pub fn warn(&self, text: impl Into<String>) {
        self.notice(Level::Warn, text);
    }

    pub fn error(&self, text: impl Into<String>) {
        self.notice(Level::Error, text);
    }
}
