//! Data structures describing managed processes.
//!
//! `ProcessSpec` is the resolved launch description of one server, and
//! `SlotState` is the lifecycle state of its slot in the process table.

use std::collections::HashMap;
use std::path::PathBuf;

/// Resolved launch description for a managed process.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    /// Unique label used for log tags and table lookup.
    pub name: String,
    /// The command executable.
    pub cmd: String,
    /// Arguments for the command.
    pub args: Vec<String>,
    /// Working directory.
    pub cwd: Option<PathBuf>,
    /// Color used for the process name in console output.
    pub color: Option<String>,
    /// Environment variables layered over the inherited environment.
    pub env: HashMap<String, String>,
    /// TCP port the process listens on, reclaimed before launch.
    pub port: Option<u16>,
    /// Optional command to run before the main process.
    pub pre_cmd: Option<String>,
    /// When set, `pre_cmd` only runs if this path does not exist.
    pub pre_if_missing: Option<PathBuf>,
}

impl ProcessSpec {
    /// Builds a spec with only a name and command line; the rest is empty.
    pub fn new(name: impl Into<String>, cmd: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            cmd: cmd.into(),
            args,
            cwd: None,
            color: None,
            env: HashMap::new(),
            port: None,
            pre_cmd: None,
            pre_if_missing: None,
        }
    }

    /// Renders the command line for display.
    pub fn command_line(&self) -> String {
        let mut parts = Vec::with_capacity(1 + self.args.len());
        parts.push(self.cmd.clone());
        parts.extend(self.args.iter().cloned());
        shell_words::join(parts)
    }
}

/// Lifecycle state of a slot in the process table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Intentionally not running (restart window, or a failed respawn).
    Absent,
    /// Spawn in progress.
    Starting,
    /// Process handle present and expected to be alive.
    Running,
    /// Being torn down by the supervisor.
    Exiting,
}

impl SlotState {
    /// Whether the liveness loop should inspect this slot.
    pub fn is_supervised(self) -> bool {
        matches!(self, SlotState::Running)
    }
}
