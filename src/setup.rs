//! Session setup: tool checks, install-if-missing pre-commands, the initial
//! schema sync and the startup banner.

use std::net::{IpAddr, UdpSocket};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use tokio::sync::mpsc;

use crate::command::{self, CommandError};
use crate::config::{PreflightCheck, WatchSettings};
use crate::events::{Event, Notifier};
use crate::process::ProcessSpec;
use crate::relay;
use crate::runner::{self, ShutdownSignal};

const FAILURE_EXCERPT: usize = 500;

/// Fails when a process's working directory does not exist.
pub fn check_directories(specs: &[ProcessSpec]) -> Result<()> {
    for spec in specs {
        if let Some(cwd) = &spec.cwd {
            if !cwd.is_dir() {
                bail!("working directory for {} not found: {}", spec.name, cwd.display());
            }
        }
    }
    Ok(())
}

/// Runs each preflight command; the first one that fails aborts the session.
pub async fn run_preflight(checks: &[PreflightCheck], notifier: &Notifier, shutdown: &ShutdownSignal) -> Result<()> {
    for check in checks {
        let env = Default::default();
        match command::run_once(&check.command, None, &env, shutdown).await {
            Ok(output) => {
                let version = output.stdout.lines().next().unwrap_or("").trim().to_string();
                if version.is_empty() {
                    notifier.success(format!("{}: found", check.name));
                } else {
                    notifier.success(format!("{}: {}", check.name, version));
                }
            }
            Err(err) => {
                notifier.error(format!("{} is not available: {}", check.name, err));
                return Err(anyhow!("preflight check {} failed", check.name));
            }
        }
    }
    Ok(())
}

/// What happened to a process's pre-command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreCommand {
    NotConfigured,
    /// The marker path exists, so the command was not needed.
    Skipped { present: PathBuf },
    Ran { elapsed: Duration },
}

/// Runs `spec.pre_cmd` in the process's directory, relaying its output.
///
/// With `pre_if_missing` set, the command only runs when that path is absent.
pub async fn run_pre_command(
    spec: &ProcessSpec,
    tx: mpsc::UnboundedSender<Event>,
    shutdown: &ShutdownSignal,
) -> Result<PreCommand> {
    let Some(pre_cmd) = &spec.pre_cmd else {
        return Ok(PreCommand::NotConfigured);
    };
    if let Some(marker) = &spec.pre_if_missing {
        if marker.exists() {
            return Ok(PreCommand::Skipped {
                present: marker.clone(),
            });
        }
    }
    let mut parts = shell_words::split(pre_cmd)
        .with_context(|| format!("failed to parse pre_cmd for {}", spec.name))?;
    if parts.is_empty() {
        return Ok(PreCommand::NotConfigured);
    }
    let cmd = parts.remove(0);
    let mut pre = spec.clone();
    pre.name = format!("{}:pre", spec.name);
    pre.cmd = cmd;
    pre.args = parts;

    let started = Instant::now();
    let mut child = runner::spawn(&pre)?;
    let pid = child.id().unwrap_or(0);
    let relay = relay::attach(&pre.name, pre.color.clone(), child.stdout.take(), child.stderr.take(), tx);
    let status = tokio::select! {
        status = child.wait() => status.with_context(|| format!("failed to wait for pre_cmd of {}", spec.name))?,
        _ = shutdown.wait() => {
            runner::kill_group(pid);
            let _ = child.kill().await;
            relay.abort();
            bail!("pre_cmd for {} cancelled", spec.name);
        }
    };
    // Flush the tail of the install log before reporting.
    let _ = tokio::time::timeout(Duration::from_secs(2), relay).await;
    if !status.success() {
        bail!("pre_cmd for {} failed with {}", spec.name, status);
    }
    Ok(PreCommand::Ran {
        elapsed: started.elapsed(),
    })
}

/// Runs every process's pre-command in order; the first failure is fatal.
pub async fn prepare_processes(specs: &[ProcessSpec], notifier: &Notifier, shutdown: &ShutdownSignal) -> Result<()> {
    for spec in specs {
        match run_pre_command(spec, notifier.sender(), shutdown).await? {
            PreCommand::Ran { elapsed } => notifier.success(format!(
                "{}: pre_cmd finished in {:.1}s",
                spec.name,
                elapsed.as_secs_f64()
            )),
            PreCommand::Skipped { present } => {
                tracing::debug!(process = %spec.name, marker = %present.display(), "pre_cmd not needed");
            }
            PreCommand::NotConfigured => {}
        }
    }
    Ok(())
}

/// Syncs the schema and regenerates the client once before launch.
///
/// Failures are warnings: a stale client or an unreachable database should
/// not keep the servers from starting.
pub async fn initial_sync(watch: &WatchSettings, target: &ProcessSpec, notifier: &Notifier, shutdown: &ShutdownSignal) {
    let steps = [watch.sequence.sync.as_ref(), watch.sequence.regenerate.as_ref()];
    for tool in steps.into_iter().flatten() {
        notifier.info(format!("running {}: {}", tool.label, tool.command_line()));
        let report = command::run_with_retries(tool, target.cwd.as_deref(), &target.env, shutdown).await;
        match report.result {
            Ok(output) if output.reclassified => notifier.success(format!("{}: already up to date", tool.label)),
            Ok(_) => notifier.success(format!("{} done", tool.label)),
            Err(CommandError::Cancelled { .. }) => return,
            Err(err) => {
                notifier.warn(format!("{}, continuing", err));
                if let Some(output) = err.output() {
                    let text = command::excerpt(&format!("{}\n{}", output.stderr, output.stdout), FAILURE_EXCERPT);
                    if !text.is_empty() {
                        notifier.warn(text);
                    }
                }
            }
        }
    }
}

/// URL lines for every process with a port, plus LAN addresses when known.
pub fn banner_lines(specs: &[ProcessSpec], lan: Option<IpAddr>) -> Vec<String> {
    let mut lines = Vec::new();
    for spec in specs {
        let Some(port) = spec.port else { continue };
        lines.push(format!("{}: http://localhost:{}", spec.name, port));
    }
    if let Some(ip) = lan {
        for spec in specs {
            let Some(port) = spec.port else { continue };
            lines.push(format!("{} (network): http://{}:{}", spec.name, ip, port));
        }
    }
    lines
}

pub fn print_banner(specs: &[ProcessSpec], notifier: &Notifier) {
    for line in banner_lines(specs, local_ip()) {
        notifier.info(line);
    }
}

/// The address other devices on the LAN can reach us at.
///
/// Connecting a UDP socket sends nothing; it only selects the outbound interface.
pub fn local_ip() -> Option<IpAddr> {
    let socket = UdpSocket::bind(("0.0.0.0", 0)).ok()?;
    socket.connect(("8.8.8.8", 80)).ok()?;
    let ip = socket.local_addr().ok()?.ip();
    if ip.is_loopback() || ip.is_unspecified() {
        None
    } else {
        Some(ip)
    }
}
