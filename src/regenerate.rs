//! The regenerate-and-restart sequence.
//!
//! When the watched schema changes, exactly one managed process (the target)
//! is stopped, its generated code is rebuilt and the database synced, and a
//! fresh instance is started in the same table slot. Siblings keep running.
//! No step aborts the sequence: failures are reported and the target is
//! respawned regardless, unless the session is shutting down.

use std::time::{Duration, Instant};

use crate::command::{self, CommandError, ExternalCommand};
use crate::events::Notifier;
use crate::process::ProcessSpec;
use crate::runner::{self, ProcessSignal, ShutdownSignal, TerminationOutcome};
use crate::strays;
use crate::table::ProcessTable;

/// Characters of tool output quoted in a failure notice.
const EXCERPT_LIMIT: usize = 500;
/// How long an old relay may keep flushing after its process was stopped.
const RELAY_DRAIN: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct SequenceConfig {
    /// Grace period for stopping the target.
    pub grace: Duration,
    /// Pause after the target is gone, before regenerating.
    pub settle: Duration,
    pub regenerate: Option<ExternalCommand>,
    pub sync: Option<ExternalCommand>,
}

/// Result of one external tool step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    NotConfigured,
    Succeeded { attempts: u32 },
    /// Non-zero exit whose output matched a success pattern.
    Reclassified,
    Failed { reason: String },
    Cancelled,
}

/// What became of the target at the end of the sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespawnOutcome {
    Restarted { pid: Option<u32>, generation: u64 },
    /// The replacement could not be spawned; the slot stays `Absent`.
    Failed { reason: String },
    /// Shutdown began mid-sequence.
    Skipped,
    UnknownTarget,
}

#[derive(Debug, Clone)]
pub struct SequenceReport {
    pub target: String,
    pub stopped: Option<TerminationOutcome>,
    pub strays: Vec<u32>,
    pub regenerate: StepOutcome,
    pub sync: StepOutcome,
    pub respawn: RespawnOutcome,
    pub elapsed: Duration,
}

impl SequenceReport {
    fn new(target: &str) -> Self {
        Self {
            target: target.to_string(),
            stopped: None,
            strays: Vec::new(),
            regenerate: StepOutcome::NotConfigured,
            sync: StepOutcome::NotConfigured,
            respawn: RespawnOutcome::Skipped,
            elapsed: Duration::ZERO,
        }
    }
}

/// Runs the stop → cleanup → settle → regenerate → sync → respawn cycle.
#[derive(Clone)]
pub struct RestartSequence {
    table: ProcessTable,
    config: SequenceConfig,
    signal: ProcessSignal,
    notifier: Notifier,
    shutdown: ShutdownSignal,
}

impl RestartSequence {
    pub fn new(
        table: ProcessTable,
        config: SequenceConfig,
        signal: ProcessSignal,
        notifier: Notifier,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            table,
            config,
            signal,
            notifier,
            shutdown,
        }
    }

    /// Restarts `target`. Never fails; every step is recorded in the report.
    pub async fn execute(&self, target: &str) -> SequenceReport {
        let started = Instant::now();
        let mut report = SequenceReport::new(target);
        let Some(spec) = self.table.spec(target).await else {
            self.notifier.error(format!("restart target {} is not managed", target));
            report.respawn = RespawnOutcome::UnknownTarget;
            return report;
        };
        self.notifier.info(format!("schema change detected, restarting {}", target));

        let (leader, lineage) = self.stop_target(&spec, &mut report).await;
        if let Some(cwd) = &spec.cwd {
            match strays::kill_strays(cwd, leader, &lineage).await {
                Ok(pids) => report.strays = pids,
                Err(err) => tracing::warn!(process = %target, error = %err, "stray cleanup failed"),
            }
        }

        report.regenerate = StepOutcome::Cancelled;
        report.sync = StepOutcome::Cancelled;
        if self.pause(self.config.settle).await {
            report.regenerate = self.run_tool(self.config.regenerate.as_ref(), &spec).await;
            if !self.shutdown.is_set() {
                report.sync = self.run_tool(self.config.sync.as_ref(), &spec).await;
            }
        }

        report.respawn = if self.shutdown.is_set() {
            tracing::debug!(process = %target, "shutdown in progress, not respawning");
            RespawnOutcome::Skipped
        } else {
            self.respawn(&spec).await
        };
        report.elapsed = started.elapsed();
        tracing::debug!(
            process = %target,
            elapsed_ms = report.elapsed.as_millis() as u64,
            respawn = ?report.respawn,
            "restart sequence finished"
        );
        report
    }

    /// Takes the target out of the table and stops it.
    ///
    /// Returns its pid and the descendants it had just before it was stopped.
    async fn stop_target(&self, spec: &ProcessSpec, report: &mut SequenceReport) -> (Option<u32>, Vec<u32>) {
        let detached = match self.table.detach_for_restart(&spec.name).await {
            Ok(Some(detached)) => detached,
            Ok(None) => {
                tracing::debug!(process = %spec.name, "target was not running");
                return (None, Vec::new());
            }
            Err(err) => {
                tracing::warn!(error = %err, "could not detach restart target");
                return (None, Vec::new());
            }
        };
        let lineage = match detached.pid {
            Some(pid) => strays::descendants(pid).await.unwrap_or_else(|err| {
                tracing::warn!(process = %spec.name, error = %err, "could not record process tree");
                Vec::new()
            }),
            None => Vec::new(),
        };
        let mut child = detached.child;
        match runner::terminate(&mut child, self.signal, self.config.grace).await {
            Ok(outcome) => {
                if matches!(outcome, TerminationOutcome::Forced { .. }) {
                    self.notifier.warn(format!("{} did not stop in time, killed", spec.name));
                } else {
                    self.notifier.info(format!("{} stopped", spec.name));
                }
                report.stopped = Some(outcome);
            }
            Err(err) => self.notifier.warn(format!("failed to stop {}: {}", spec.name, err)),
        }
        if let Some(mut relay) = detached.relay {
            if tokio::time::timeout(RELAY_DRAIN, &mut relay).await.is_err() {
                relay.abort();
            }
        }
        (detached.pid, lineage)
    }

    async fn run_tool(&self, command: Option<&ExternalCommand>, spec: &ProcessSpec) -> StepOutcome {
        let Some(command) = command else {
            return StepOutcome::NotConfigured;
        };
        self.notifier.info(format!("running {}: {}", command.label, command.command_line()));
        let report = command::run_with_retries(command, spec.cwd.as_deref(), &spec.env, &self.shutdown).await;
        match report.result {
            Ok(output) if output.reclassified => {
                self.notifier.success(format!("{}: already up to date", command.label));
                StepOutcome::Reclassified
            }
            Ok(output) => {
                self.notifier.success(format!(
                    "{} finished in {:.1}s",
                    command.label,
                    output.elapsed.as_secs_f64()
                ));
                StepOutcome::Succeeded {
                    attempts: report.attempts,
                }
            }
            Err(CommandError::Cancelled { .. }) => StepOutcome::Cancelled,
            Err(err) => {
                self.notifier.warn(format!("{} (attempts: {})", err, report.attempts));
                if let Some(output) = err.output() {
                    let text = if output.stderr.trim().is_empty() {
                        &output.stdout
                    } else {
                        &output.stderr
                    };
                    let text = command::excerpt(text, EXCERPT_LIMIT);
                    if !text.is_empty() {
                        self.notifier.warn(text);
                    }
                }
                StepOutcome::Failed {
                    reason: err.to_string(),
                }
            }
        }
    }

    async fn respawn(&self, spec: &ProcessSpec) -> RespawnOutcome {
        match self.table.launch(spec, self.notifier.sender()).await {
            Ok(launched) => {
                self.notifier.success(format!("{} restarted", spec.name));
                RespawnOutcome::Restarted {
                    pid: launched.pid,
                    generation: launched.generation,
                }
            }
            Err(err) => {
                self.notifier
                    .warn(format!("{} could not be restarted and remains down: {}", spec.name, err));
                RespawnOutcome::Failed {
                    reason: err.to_string(),
                }
            }
        }
    }

    /// Sleeps for `duration`; false when shutdown cut it short.
    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = self.shutdown.wait() => false,
        }
    }
}
