//! Console sink and line decoding.
//!
//! All relays and supervisor notices funnel into one console task that owns
//! the terminal. This module formats those events (prefix, color, optional
//! timestamp) and decodes raw child output into text.

use std::io::Write;
use std::time::Instant;

use encoding_rs::WINDOWS_1254;
use strip_ansi_escapes::strip;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::events::{Event, Level, OutputLine};

/// Indicates the source stream of a log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// Standard Output.
    Stdout,
    /// Standard Error.
    Stderr,
}

/// Formatting options for the console sink.
#[derive(Debug, Clone)]
pub struct ConsoleSettings {
    /// Prepend elapsed session time to each line.
    pub timestamp: bool,
    /// Pad or truncate the `[name]` prefix to this length.
    pub prefix_length: Option<usize>,
    /// Remove ANSI escape codes from child output.
    pub strip_ansi: bool,
    /// Colorize prefixes and notices.
    pub colors: bool,
}

impl Default for ConsoleSettings {
    fn default() -> Self {
        Self {
            timestamp: false,
            prefix_length: None,
            strip_ansi: false,
            colors: true,
        }
    }
}

/// Decodes one raw output line, UTF-8 first and Windows-1254 second.
///
/// Never fails: bytes the fallback cannot map become U+FFFD.
pub fn decode_line(raw: &[u8]) -> String {
    let trimmed = trim_line_ending(raw);
    match std::str::from_utf8(trimmed) {
        Ok(text) => text.to_string(),
        Err(_) => {
            let (text, _had_errors) = WINDOWS_1254.decode_without_bom_handling(trimmed);
            text.into_owned()
        }
    }
}

fn trim_line_ending(raw: &[u8]) -> &[u8] {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    raw.strip_suffix(b"\r").unwrap_or(raw)
}

/// Sanitizes text for display, optionally stripping ANSI escape codes.
pub fn sanitize_text(text: &str, strip_ansi: bool) -> String {
    if !strip_ansi {
        return text.to_string();
    }
    let stripped = strip(text.as_bytes());
    String::from_utf8_lossy(&stripped).to_string()
}

/// Formats console events into terminal lines.
pub struct Console {
    settings: ConsoleSettings,
    start: Instant,
}

impl Console {
    pub fn new(settings: ConsoleSettings) -> Self {
        Self {
            settings,
            start: Instant::now(),
        }
    }

    pub fn format_event(&self, event: &Event) -> String {
        match event {
            Event::Output(line) => self.format_output(line),
            Event::Notice { level, text } => self.format_notice(*level, text),
        }
    }

    fn format_output(&self, line: &OutputLine) -> String {
        let text = sanitize_text(&line.text, self.settings.strip_ansi);
        let cleaned = strip_existing_prefix(&line.process, &text);
        let mut prefix = apply_prefix_length(format!("[{}]", line.process), self.settings.prefix_length);
        if self.settings.colors {
            prefix = apply_color(&prefix, line.tag.as_deref());
        }
        format!("{}{} {}", self.stamp(), prefix, cleaned)
    }

    fn format_notice(&self, level: Level, text: &str) -> String {
        let line = format!("{}[devrack] {}", self.stamp(), text);
        if !self.settings.colors {
            return line;
        }
        let color = match level {
            Level::Info => "cyan",
            Level::Success => "green",
            Level::Warn => "yellow",
            Level::Error => "red",
        };
        apply_color(&line, Some(color))
    }

    fn stamp(&self) -> String {
        if !self.settings.timestamp {
            return String::new();
        }
        let secs = self.start.elapsed().as_secs();
        format!("{:02}:{:02} ", secs / 60, secs % 60)
    }
}

/// Spawns the console task that drains `rx` into `writer` until every sender is gone.
pub fn spawn_console<W>(
    mut rx: mpsc::UnboundedReceiver<Event>,
    settings: ConsoleSettings,
    mut writer: W,
) -> JoinHandle<()>
where
    W: Write + Send + 'static,
{
    tokio::spawn(async move {
        let console = Console::new(settings);
        while let Some(event) = rx.recv().await {
            let line = console.format_event(&event);
            let _ = writeln!(writer, "{}", line);
            let _ = writer.flush();
        }
    })
}

fn apply_prefix_length(prefix: String, length: Option<usize>) -> String {
    let Some(length) = length else { return prefix };
    let mut out = prefix;
    if out.len() > length {
        let mut cut = length;
        while !out.is_char_boundary(cut) {
            cut -= 1;
        }
        out.truncate(cut);
    } else if out.len() < length {
        out.push_str(&" ".repeat(length - out.len()));
    }
    out
}

/// Wraps `text` in the ANSI code for a named color; unknown names leave it plain.
pub fn apply_color(text: &str, color: Option<&str>) -> String {
    let code = match color.unwrap_or("").to_lowercase().as_str() {
        "black" => "30",
        "red" => "31",
        "green" => "32",
        "yellow" => "33",
        "blue" => "34",
        "magenta" => "35",
        "cyan" => "36",
        "gray" | "grey" => "90",
        "bright-red" => "91",
        "bright-green" => "92",
        "bright-yellow" => "93",
        "bright-blue" => "94",
        "bright-magenta" => "95",
        "bright-cyan" => "96",
        _ => "0",
    };
    if code == "0" {
        text.to_string()
    } else {
        format!("\u{1b}[{}m{}\u{1b}[0m", code, text)
    }
}

// Dev servers often tag their own output with the name we use as a prefix.
fn strip_existing_prefix(name: &str, text: &str) -> String {
    let candidates = [
        format!("[{}] ", name),
        format!("[{}]", name),
        format!("{}: ", name),
        format!("{} - ", name),
    ];
    for candidate in candidates {
        if let Some(rest) = text.strip_prefix(&candidate) {
            return rest.trim_start().to_string();
        }
    }
    text.to_string()
}
