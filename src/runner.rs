//! Spawning and terminating child processes.
//!
//! Every child is started in its own process group so that a stop signal
//! reaches the whole tree a dev server tends to fork (npm → node → workers).
//! Termination is graceful-then-forced: a polite signal, a bounded wait, then
//! an unconditional kill.

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::sync::watch;

use crate::process::ProcessSpec;

/// The polite stop signal sent before escalating to a kill.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessSignal {
    SigInt,
    SigTerm,
}

impl ProcessSignal {
    pub fn label(self) -> &'static str {
        match self {
            ProcessSignal::SigInt => "SIGINT",
            ProcessSignal::SigTerm => "SIGTERM",
        }
    }
}

/// Grace periods for the three situations that stop a process.
#[derive(Debug, Clone, Copy)]
pub struct ShutdownConfig {
    pub signal: ProcessSignal,
    /// Wait per process during interrupt-driven shutdown.
    pub interrupt_grace: Duration,
    /// Wait per process when tearing down after a crash.
    pub crash_grace: Duration,
    /// Wait for the target process of a regenerate-and-restart cycle.
    pub restart_grace: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            signal: ProcessSignal::SigTerm,
            interrupt_grace: Duration::from_secs(5),
            crash_grace: Duration::from_secs(3),
            restart_grace: Duration::from_secs(5),
        }
    }
}

/// Session-wide shutdown flag, observable from tasks and threads.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn channel() -> (watch::Sender<bool>, ShutdownSignal) {
        let (tx, rx) = watch::channel(false);
        (tx, ShutdownSignal { rx })
    }

    pub fn is_set(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown has begun; never resolves if the sender is gone unset.
    pub async fn wait(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|set| *set).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("failed to spawn {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum TerminateError {
    #[error("failed to kill pid {pid}: {source}")]
    Kill {
        pid: u32,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to wait for pid {pid}: {source}")]
    Wait {
        pid: u32,
        #[source]
        source: std::io::Error,
    },
}

/// How a process ended when the supervisor asked it to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationOutcome {
    /// It was already gone before any signal was sent.
    AlreadyExited { code: Option<i32> },
    /// It exited within the grace period.
    Graceful { code: Option<i32> },
    /// It had to be killed.
    Forced { code: Option<i32> },
}

/// Puts the command in a new process group so signals reach its descendants.
pub fn detach_group(command: &mut Command) {
    #[cfg(windows)]
    {
        const CREATE_NEW_PROCESS_GROUP: u32 = 0x00000200;
        command.creation_flags(CREATE_NEW_PROCESS_GROUP);
    }

    #[cfg(unix)]
    unsafe {
        command.pre_exec(|| {
            let _ = libc::setpgid(0, 0);
            Ok(())
        });
    }
}

/// Builds the launch command for a managed process with piped output.
pub fn build_command(spec: &ProcessSpec) -> Command {
    let mut command = Command::new(&spec.cmd);
    command.args(&spec.args);
    if let Some(cwd) = &spec.cwd {
        command.current_dir(cwd);
    }
    if !spec.env.is_empty() {
        command.envs(&spec.env);
    }
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    command.kill_on_drop(true);
    detach_group(&mut command);
    command
}

/// Spawns a managed process.
pub fn spawn(spec: &ProcessSpec) -> Result<Child, SpawnError> {
    let child = build_command(spec).spawn().map_err(|source| SpawnError::Spawn {
        name: spec.name.clone(),
        source,
    })?;
    tracing::debug!(process = %spec.name, pid = ?child.id(), cmd = %spec.command_line(), "spawned");
    Ok(child)
}

/// Stops a child: `signal` first, `grace` to comply, then a forced kill.
pub async fn terminate(
    child: &mut Child,
    signal: ProcessSignal,
    grace: Duration,
) -> Result<TerminationOutcome, TerminateError> {
    let pid = child.id().unwrap_or(0);
    match child.try_wait() {
        Ok(Some(status)) => return Ok(TerminationOutcome::AlreadyExited { code: status.code() }),
        Ok(None) => {}
        Err(source) => return Err(TerminateError::Wait { pid, source }),
    }

    if pid != 0 {
        tracing::debug!(pid, signal = signal.label(), "sending stop signal");
        send_os_signal(pid, signal);
    }
    match wait_for_exit(child, grace).await {
        Ok(Some(status)) => return Ok(TerminationOutcome::Graceful { code: status.code() }),
        Ok(None) => {}
        Err(source) => return Err(TerminateError::Wait { pid, source }),
    }

    tracing::debug!(pid, grace_ms = grace.as_millis() as u64, "grace period elapsed, killing");
    kill_group(pid);
    if let Err(source) = child.kill().await {
        // Losing the race against a natural exit is not a failure.
        if let Ok(Some(status)) = child.try_wait() {
            return Ok(TerminationOutcome::Forced { code: status.code() });
        }
        return Err(TerminateError::Kill { pid, source });
    }
    let status = child
        .wait()
        .await
        .map_err(|source| TerminateError::Wait { pid, source })?;
    Ok(TerminationOutcome::Forced { code: status.code() })
}

/// Waits up to `timeout` for the child to exit.
pub async fn wait_for_exit(child: &mut Child, timeout: Duration) -> std::io::Result<Option<ExitStatus>> {
    if timeout.is_zero() {
        return child.try_wait();
    }
    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => Ok(Some(status)),
        Ok(Err(err)) => Err(err),
        Err(_) => Ok(None),
    }
}

#[cfg(unix)]
pub fn send_os_signal(pid: u32, signal: ProcessSignal) {
    unsafe {
        let sig = match signal {
            ProcessSignal::SigInt => libc::SIGINT,
            ProcessSignal::SigTerm => libc::SIGTERM,
        };
        let pid = pid as i32;
        let _ = libc::kill(-pid, sig);
        let _ = libc::kill(pid, sig);
    }
}

#[cfg(not(unix))]
pub fn send_os_signal(pid: u32, signal: ProcessSignal) {
    send_ctrl_break(pid, signal);
}

#[cfg(all(not(unix), windows))]
fn send_ctrl_break(pid: u32, signal: ProcessSignal) {
    use windows_sys::Win32::System::Console::GenerateConsoleCtrlEvent;
    use windows_sys::Win32::System::Console::CTRL_BREAK_EVENT;
    // Windows has no SIGTERM/SIGINT; CTRL_BREAK is the closest console signal we can emit.
    let _ = signal;
    unsafe {
        let _ = GenerateConsoleCtrlEvent(CTRL_BREAK_EVENT, pid);
    }
}

#[cfg(all(not(unix), not(windows)))]
fn send_ctrl_break(_pid: u32, _signal: ProcessSignal) {}

/// Kills the process group led by `pid`; the leader itself is killed separately.
#[cfg(unix)]
pub fn kill_group(pid: u32) {
    if pid == 0 {
        return;
    }
    unsafe {
        let _ = libc::kill(-(pid as i32), libc::SIGKILL);
    }
}

#[cfg(not(unix))]
pub fn kill_group(pid: u32) {
    if pid == 0 {
        return;
    }
    // taskkill /T walks the child tree, which is what a group kill means here.
    let _ = std::process::Command::new("taskkill")
        .args(["/F", "/T", "/PID", &pid.to_string()])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
}
