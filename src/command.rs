//! External tool invocation with timeouts.
//!
//! The regeneration and sync tools are opaque commands: we run them in the
//! target's working directory with its environment, capture their output,
//! and kill them when they exceed their time budget or the session shuts
//! down.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use regex::{Regex, RegexBuilder};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use crate::runner::{detach_group, kill_group, ShutdownSignal};

/// Cap on captured output kept per stream for diagnostics.
const CAPTURE_LIMIT: usize = 64 * 1024;

/// A configured external tool invocation.
#[derive(Debug, Clone)]
pub struct ExternalCommand {
    /// Short label for notices ("regenerate", "sync").
    pub label: String,
    pub cmd: String,
    pub args: Vec<String>,
    pub timeout: Duration,
    /// Total attempts; values below one are treated as one.
    pub attempts: u32,
    pub retry_delay: Duration,
    /// Output patterns that turn a non-zero exit into a success.
    pub success_patterns: Vec<Regex>,
}

impl ExternalCommand {
    /// Parses a shell-style command line.
    pub fn parse(label: &str, line: &str, timeout: Duration) -> Result<Self> {
        let mut parts = shell_words::split(line)
            .with_context(|| format!("failed to parse {} command", label))?;
        if parts.is_empty() {
            return Err(anyhow!("empty {} command", label));
        }
        let cmd = parts.remove(0);
        Ok(Self {
            label: label.to_string(),
            cmd,
            args: parts,
            timeout,
            attempts: 1,
            retry_delay: Duration::ZERO,
            success_patterns: Vec::new(),
        })
    }

    pub fn with_attempts(mut self, attempts: u32, retry_delay: Duration) -> Self {
        self.attempts = attempts;
        self.retry_delay = retry_delay;
        self
    }

    pub fn with_success_patterns(mut self, patterns: &[String]) -> Result<Self> {
        self.success_patterns = patterns
            .iter()
            .map(|p| {
                RegexBuilder::new(p)
                    .case_insensitive(true)
                    .build()
                    .with_context(|| format!("invalid success pattern {:?} for {}", p, self.label))
            })
            .collect::<Result<_>>()?;
        Ok(self)
    }

    pub fn command_line(&self) -> String {
        let mut parts = Vec::with_capacity(1 + self.args.len());
        parts.push(self.cmd.clone());
        parts.extend(self.args.iter().cloned());
        shell_words::join(parts)
    }

    fn matches_success(&self, output: &CommandOutput) -> bool {
        self.success_patterns
            .iter()
            .any(|re| re.is_match(&output.stdout) || re.is_match(&output.stderr))
    }
}

/// Captured result of a finished invocation.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
    /// Exit was non-zero but the output matched a success pattern.
    pub reclassified: bool,
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("{label}: failed to start `{cmd}`: {source}")]
    Spawn {
        label: String,
        cmd: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{label}: timed out after {}s and was killed", .timeout.as_secs())]
    TimedOut { label: String, timeout: Duration },
    #[error("{label}: exited with code {}", .code.map(|c| c.to_string()).unwrap_or_else(|| "none".into()))]
    Failed { label: String, code: Option<i32>, output: CommandOutput },
    #[error("{label}: cancelled by shutdown")]
    Cancelled { label: String },
    #[error("{label}: {source}")]
    Io {
        label: String,
        #[source]
        source: std::io::Error,
    },
}

impl CommandError {
    /// Captured output, when the command ran to completion.
    pub fn output(&self) -> Option<&CommandOutput> {
        match self {
            CommandError::Failed { output, .. } => Some(output),
            _ => None,
        }
    }
}

/// Outcome of all attempts of one command.
#[derive(Debug)]
pub struct CommandReport {
    pub attempts: u32,
    pub result: Result<CommandOutput, CommandError>,
}

impl CommandReport {
    pub fn succeeded(&self) -> bool {
        self.result.is_ok()
    }
}

/// Runs `command`, retrying on failure up to its attempt budget.
///
/// Timeouts and cancellation are not retried.
pub async fn run_with_retries(
    command: &ExternalCommand,
    cwd: Option<&Path>,
    env: &HashMap<String, String>,
    shutdown: &ShutdownSignal,
) -> CommandReport {
    let total = command.attempts.max(1);
    let mut attempt = 1;
    loop {
        let result = run_once(command, cwd, env, shutdown).await;
        let retryable = matches!(result, Err(CommandError::Failed { .. }) | Err(CommandError::Io { .. }));
        if result.is_ok() || !retryable || attempt >= total {
            return CommandReport {
                attempts: attempt,
                result,
            };
        }
        tracing::debug!(label = %command.label, attempt, total, "command failed, retrying");
        tokio::select! {
            _ = tokio::time::sleep(command.retry_delay) => {}
            _ = shutdown.wait() => {
                return CommandReport {
                    attempts: attempt,
                    result: Err(CommandError::Cancelled { label: command.label.clone() }),
                };
            }
        }
        attempt += 1;
    }
}

/// Runs `command` once with its timeout.
pub async fn run_once(
    command: &ExternalCommand,
    cwd: Option<&Path>,
    env: &HashMap<String, String>,
    shutdown: &ShutdownSignal,
) -> Result<CommandOutput, CommandError> {
    if shutdown.is_set() {
        return Err(CommandError::Cancelled {
            label: command.label.clone(),
        });
    }
    let started = Instant::now();
    let mut process = Command::new(&command.cmd);
    process.args(&command.args);
    if let Some(cwd) = cwd {
        process.current_dir(cwd);
    }
    process
        .envs(env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    detach_group(&mut process);

    let mut child = process.spawn().map_err(|source| CommandError::Spawn {
        label: command.label.clone(),
        cmd: command.command_line(),
        source,
    })?;
    let pid = child.id().unwrap_or(0);
    tracing::debug!(label = %command.label, pid, cmd = %command.command_line(), "running external command");

    let stdout = child.stdout.take().map(|r| tokio::spawn(capture(r)));
    let stderr = child.stderr.take().map(|r| tokio::spawn(capture(r)));

    let status = tokio::select! {
        status = child.wait() => Some(status),
        _ = tokio::time::sleep(command.timeout) => None,
        _ = shutdown.wait() => {
            kill_group(pid);
            let _ = child.kill().await;
            return Err(CommandError::Cancelled { label: command.label.clone() });
        }
    };

    let Some(status) = status else {
        kill_group(pid);
        let _ = child.kill().await;
        tracing::debug!(label = %command.label, pid, "external command timed out");
        return Err(CommandError::TimedOut {
            label: command.label.clone(),
            timeout: command.timeout,
        });
    };
    let status = status.map_err(|source| CommandError::Io {
        label: command.label.clone(),
        source,
    })?;

    let mut output = CommandOutput {
        code: status.code(),
        stdout: collect(stdout).await,
        stderr: collect(stderr).await,
        elapsed: started.elapsed(),
        reclassified: false,
    };
    if status.success() {
        return Ok(output);
    }
    if command.matches_success(&output) {
        output.reclassified = true;
        return Ok(output);
    }
    Err(CommandError::Failed {
        label: command.label.clone(),
        code: output.code,
        output,
    })
}

async fn capture<R>(mut reader: R) -> Vec<u8>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                // Keep draining past the cap so the child never blocks on a full pipe.
                let room = CAPTURE_LIMIT.saturating_sub(buf.len());
                buf.extend_from_slice(&chunk[..n.min(room)]);
            }
        }
    }
    buf
}

async fn collect(handle: Option<tokio::task::JoinHandle<Vec<u8>>>) -> String {
    let Some(mut handle) = handle else {
        return String::new();
    };
    // A surviving grandchild can hold the pipe open; don't wait on it forever.
    match tokio::time::timeout(Duration::from_secs(2), &mut handle).await {
        Ok(Ok(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
        _ => {
            handle.abort();
            String::new()
        }
    }
}

/// First `limit` characters of `text`, trimmed, for notices.
pub fn excerpt(text: &str, limit: usize) -> String {
    let trimmed = text.trim();
    match trimmed.char_indices().nth(limit) {
        Some((idx, _)) => format!("{}…", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_shutdown() -> (tokio::sync::watch::Sender<bool>, ShutdownSignal) {
        ShutdownSignal::channel()
    }

    #[test]
    fn parse_splits_command_line() {
        let cmd = ExternalCommand::parse("sync", "npx prisma db push --accept-data-loss", Duration::from_secs(1)).unwrap();
        assert_eq!(cmd.cmd, "npx");
        assert_eq!(cmd.args, vec!["prisma", "db", "push", "--accept-data-loss"]);
        assert!(ExternalCommand::parse("sync", "  ", Duration::from_secs(1)).is_err());
    }

    #[test]
    fn invalid_pattern_is_rejected() {
        let cmd = ExternalCommand::parse("sync", "true", Duration::from_secs(1)).unwrap();
        assert!(cmd.with_success_patterns(&["(".to_string()]).is_err());
    }

    #[test]
    fn excerpt_truncates_on_char_boundary() {
        assert_eq!(excerpt("  short  ", 10), "short");
        assert_eq!(excerpt("şəhərlər", 3), "şəh…");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn captures_output_of_successful_command() {
        let (_tx, shutdown) = no_shutdown();
        let cmd = ExternalCommand::parse("gen", "sh -c 'echo generated; echo warn >&2'", Duration::from_secs(5)).unwrap();
        let out = run_once(&cmd, None, &HashMap::new(), &shutdown).await.unwrap();
        assert_eq!(out.code, Some(0));
        assert_eq!(out.stdout.trim(), "generated");
        assert_eq!(out.stderr.trim(), "warn");
        assert!(!out.reclassified);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn passes_environment_and_cwd() {
        let (_tx, shutdown) = no_shutdown();
        let dir = tempfile::tempdir().unwrap();
        let cmd = ExternalCommand::parse("gen", "sh -c 'echo $DATABASE_URL; pwd'", Duration::from_secs(5)).unwrap();
        let env = HashMap::from([("DATABASE_URL".to_string(), "postgres://dev".to_string())]);
        let out = run_once(&cmd, Some(dir.path()), &env, &shutdown).await.unwrap();
        let mut lines = out.stdout.lines();
        assert_eq!(lines.next(), Some("postgres://dev"));
        let pwd = std::fs::canonicalize(lines.next().unwrap()).unwrap();
        assert_eq!(pwd, std::fs::canonicalize(dir.path()).unwrap());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn times_out_and_kills() {
        let (_tx, shutdown) = no_shutdown();
        let cmd = ExternalCommand::parse("gen", "sleep 30", Duration::from_millis(200)).unwrap();
        let started = Instant::now();
        let err = run_once(&cmd, None, &HashMap::new(), &shutdown).await.unwrap_err();
        assert!(matches!(err, CommandError::TimedOut { .. }));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn reclassifies_already_in_sync() {
        let (_tx, shutdown) = no_shutdown();
        let cmd = ExternalCommand::parse(
            "sync",
            "sh -c 'echo The database is already in sync with the schema >&2; exit 1'",
            Duration::from_secs(5),
        )
        .unwrap()
        .with_success_patterns(&["already in sync".to_string()])
        .unwrap();
        let out = run_once(&cmd, None, &HashMap::new(), &shutdown).await.unwrap();
        assert_eq!(out.code, Some(1));
        assert!(out.reclassified);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn non_matching_failure_keeps_output() {
        let (_tx, shutdown) = no_shutdown();
        let cmd = ExternalCommand::parse("sync", "sh -c 'echo boom >&2; exit 4'", Duration::from_secs(5))
            .unwrap()
            .with_success_patterns(&["already in sync".to_string()])
            .unwrap();
        let err = run_once(&cmd, None, &HashMap::new(), &shutdown).await.unwrap_err();
        assert_eq!(err.output().map(|o| o.stderr.trim().to_string()), Some("boom".to_string()));
        assert!(err.to_string().contains("code 4"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn retries_until_budget_spent() {
        let (_tx, shutdown) = no_shutdown();
        let dir = tempfile::tempdir().unwrap();
        let cmd = ExternalCommand::parse("gen", "sh -c 'echo x >> attempts; exit 1'", Duration::from_secs(5))
            .unwrap()
            .with_attempts(3, Duration::from_millis(10));
        let report = run_with_retries(&cmd, Some(dir.path()), &HashMap::new(), &shutdown).await;
        assert_eq!(report.attempts, 3);
        assert!(!report.succeeded());
        let written = std::fs::read_to_string(dir.path().join("attempts")).unwrap();
        assert_eq!(written.lines().count(), 3);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn shutdown_cancels_running_command() {
        let (tx, shutdown) = no_shutdown();
        let cmd = ExternalCommand::parse("sync", "sleep 30", Duration::from_secs(60)).unwrap();
        let task = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { run_once(&cmd, None, &HashMap::new(), &shutdown).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert!(matches!(result, Err(CommandError::Cancelled { .. })));
    }
}
