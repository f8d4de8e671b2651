//! The process supervisor.
//!
//! Starts every managed process in order, watches them with a periodic
//! liveness check, and ends the session on the first unexpected exit or on
//! an interrupt. A slot that a restart sequence has marked `Absent` is not
//! watched, so an intentional restart never looks like a crash.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::config::WatchSettings;
use crate::events::Notifier;
use crate::process::ProcessSpec;
use crate::reclaim::{self, ReclaimOutcome};
use crate::regenerate::RestartSequence;
use crate::runner::{self, ShutdownConfig, ShutdownSignal, TerminationOutcome};
use crate::table::{ExitedProcess, ProcessTable};
use crate::watch::{ChangeWatcher, WatchOptions};

/// How long a stopped process's relay may keep flushing output.
const RELAY_FLUSH: Duration = Duration::from_secs(1);

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Ctrl-C or SIGTERM.
    Interrupted,
    /// A process exited with code 0 on its own.
    UnexpectedExit { name: String },
    /// A process exited with a failure code or was killed by a signal.
    Crashed { name: String, code: Option<i32> },
    StartupFailed { reason: String },
}

impl SessionOutcome {
    pub fn exit_code(&self) -> u8 {
        match self {
            SessionOutcome::Interrupted => 0,
            SessionOutcome::UnexpectedExit { .. } => 1,
            SessionOutcome::Crashed { .. } => 2,
            SessionOutcome::StartupFailed { .. } => 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// Kill whatever holds a process's port before starting it.
    pub reclaim: bool,
    pub reclaim_settle: Duration,
    pub poll_interval: Duration,
    pub shutdown: ShutdownConfig,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            reclaim: true,
            reclaim_settle: Duration::from_secs(1),
            poll_interval: Duration::from_secs(1),
            shutdown: ShutdownConfig::default(),
        }
    }
}

/// Requests an interrupt-driven shutdown from anywhere.
#[derive(Debug, Clone)]
pub struct Interrupt {
    tx: Arc<watch::Sender<bool>>,
}

impl Interrupt {
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }
}

pub struct Supervisor {
    table: ProcessTable,
    notifier: Notifier,
    options: SupervisorOptions,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown: ShutdownSignal,
    /// Set once a crash, rather than an interrupt, started the shutdown.
    crashed: bool,
    watcher: Option<ChangeWatcher>,
}

impl Supervisor {
    pub fn new(options: SupervisorOptions, notifier: Notifier) -> Self {
        let (tx, shutdown) = ShutdownSignal::channel();
        Self {
            table: ProcessTable::new(),
            notifier,
            options,
            shutdown_tx: Arc::new(tx),
            shutdown,
            crashed: false,
            watcher: None,
        }
    }

    pub fn interrupt(&self) -> Interrupt {
        Interrupt {
            tx: self.shutdown_tx.clone(),
        }
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    #[cfg(test)]
    pub fn table(&self) -> ProcessTable {
        self.table.clone()
    }

    /// Starts `specs` in order. Any failure to launch is fatal for the session.
    pub async fn start(&mut self, specs: &[ProcessSpec]) -> Result<()> {
        for spec in specs {
            self.table.insert(spec.clone()).await?;
        }
        for spec in specs {
            if self.shutdown.is_set() {
                anyhow::bail!("interrupted during startup");
            }
            if self.options.reclaim {
                if let Some(port) = spec.port {
                    self.reclaim_port(&spec.name, port).await;
                }
            }
            let launched = self
                .table
                .launch(spec, self.notifier.sender())
                .await
                .with_context(|| format!("failed to start {}", spec.name))?;
            match launched.pid {
                Some(pid) => self.notifier.success(format!("{} started (pid {})", spec.name, pid)),
                None => self.notifier.success(format!("{} started", spec.name)),
            }
        }
        Ok(())
    }

    async fn reclaim_port(&self, name: &str, port: u16) {
        match reclaim::reclaim(port, self.options.reclaim_settle).await {
            Ok(ReclaimOutcome::Free) => {}
            Ok(ReclaimOutcome::Reclaimed { pids }) => self.notifier.warn(format!(
                "port {} for {} was in use, killed {}",
                port,
                name,
                pids.iter().map(|p| p.to_string()).collect::<Vec<_>>().join(", ")
            )),
            Err(err) => self.notifier.warn(format!("{}, starting {} anyway", err, name)),
        }
    }

    /// Watches the schema and restarts `settings.target` on change.
    ///
    /// A watcher that cannot start is reported and the session goes on without it.
    pub fn watch(&mut self, settings: &WatchSettings) {
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(err) => {
                self.notifier.warn(format!("file watcher unavailable: {}", err));
                return;
            }
        };
        let sequence = RestartSequence::new(
            self.table.clone(),
            settings.sequence.clone(),
            self.options.shutdown.signal,
            self.notifier.clone(),
            self.shutdown.clone(),
        );
        let target = settings.target.clone();
        let shutdown = self.shutdown.clone();
        let options = WatchOptions {
            dir: settings.dir.clone(),
            file: settings.file.clone(),
            rule: settings.rule,
            debounce: settings.debounce,
        };
        let started = ChangeWatcher::start(&options, move || {
            // A change that lands after an interrupt must not touch the target.
            if shutdown.is_set() {
                tracing::debug!(process = %target, "shutting down, ignoring schema change");
                return;
            }
            handle.block_on(sequence.execute(&target));
        });
        match started {
            Ok(watcher) => {
                self.notifier.info(format!(
                    "watching {} in {}",
                    settings.file,
                    settings.dir.display()
                ));
                self.watcher = Some(watcher);
            }
            Err(err) => self.notifier.warn(format!("file watcher unavailable: {:#}", err)),
        }
    }

    /// Runs the liveness loop until a process exits or an interrupt arrives.
    pub async fn supervise(self) -> SessionOutcome {
        let mut ticker = tokio::time::interval(self.options.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = self.shutdown.wait() => {
                    return self.stop_on_interrupt().await;
                }
                _ = ticker.tick() => {
                    let exited = self.table.poll_exits().await;
                    if let Some(first) = exited.into_iter().next() {
                        return self.stop_after_exit(first).await;
                    }
                }
            }
        }
    }

    /// Tears down whatever was started before a fatal startup error.
    pub async fn abort_startup(mut self, err: anyhow::Error) -> SessionOutcome {
        if self.shutdown.is_set() {
            return self.stop_on_interrupt().await;
        }
        self.notifier.error(format!("{:#}", err));
        self.shutdown_tx.send_replace(true);
        self.stop_watcher().await;
        self.stop_all(self.options.shutdown.crash_grace).await;
        SessionOutcome::StartupFailed {
            reason: format!("{:#}", err),
        }
    }

    async fn stop_after_exit(mut self, exit: ExitedProcess) -> SessionOutcome {
        self.crashed = true;
        let outcome = match exit.code {
            Some(0) => {
                self.notifier
                    .error(format!("{} exited unexpectedly (code 0), stopping everything", exit.name));
                SessionOutcome::UnexpectedExit { name: exit.name }
            }
            code => {
                let code_text = code.map(|c| c.to_string()).unwrap_or_else(|| "none".into());
                self.notifier
                    .error(format!("{} crashed (code {}), stopping everything", exit.name, code_text));
                SessionOutcome::Crashed { name: exit.name, code }
            }
        };
        // Cancels a restart sequence that may be in flight.
        self.shutdown_tx.send_replace(true);
        self.stop_watcher().await;
        self.stop_all(self.options.shutdown.crash_grace).await;
        outcome
    }

    async fn stop_on_interrupt(mut self) -> SessionOutcome {
        self.notifier.info("shutting down");
        self.stop_watcher().await;
        self.stop_all(self.options.shutdown.interrupt_grace).await;
        self.notifier.success("all processes stopped");
        SessionOutcome::Interrupted
    }

    async fn stop_watcher(&mut self) {
        let Some(watcher) = self.watcher.take() else {
            return;
        };
        // Joining waits for a restart sequence in progress.
        if tokio::task::spawn_blocking(move || watcher.stop()).await.is_err() {
            tracing::warn!("watcher shutdown task failed");
        }
    }

    /// Stops every process in table order.
    async fn stop_all(&self, grace: Duration) {
        let signal = self.options.shutdown.signal;
        for slot in self.table.snapshot().await {
            tracing::debug!(
                process = %slot.name,
                state = ?slot.state,
                pid = ?slot.pid,
                generation = slot.generation,
                relay = slot.relay_attached,
                "stopping"
            );
            let name = slot.name;
            let detached = match self.table.detach_for_shutdown(&name).await {
                Ok(Some(detached)) => detached,
                Ok(None) => continue,
                Err(err) => {
                    tracing::warn!(error = %err, "could not detach process");
                    continue;
                }
            };
            let mut child = detached.child;
            match runner::terminate(&mut child, signal, grace).await {
                Ok(TerminationOutcome::Forced { .. }) => {
                    self.notifier.warn(format!("{} force-killed", name))
                }
                Ok(_) => {
                    if !self.crashed {
                        self.notifier.info(format!("{} stopped", name));
                    }
                }
                Err(err) => self.notifier.error(format!("failed to stop {}: {}", name, err)),
            }
            if let Some(mut relay) = detached.relay {
                if tokio::time::timeout(RELAY_FLUSH, &mut relay).await.is_err() {
                    relay.abort();
                }
            }
        }
        for mut relay in self.table.take_relays().await {
            if tokio::time::timeout(RELAY_FLUSH, &mut relay).await.is_err() {
                relay.abort();
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::events::Event;
    use crate::process::SlotState;
    use tokio::sync::mpsc;

    fn sh(name: &str, script: &str) -> ProcessSpec {
        ProcessSpec::new(name, "sh", vec!["-c".into(), script.into()])
    }

    fn options() -> SupervisorOptions {
        SupervisorOptions {
            reclaim: true,
            reclaim_settle: Duration::from_millis(200),
            poll_interval: Duration::from_millis(50),
            shutdown: ShutdownConfig {
                interrupt_grace: Duration::from_secs(2),
                crash_grace: Duration::from_secs(2),
                restart_grace: Duration::from_secs(2),
                ..ShutdownConfig::default()
            },
        }
    }

    fn supervisor() -> (Supervisor, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Supervisor::new(options(), Notifier::new(tx)), rx)
    }

    fn notices(rx: &mut mpsc::UnboundedReceiver<Event>) -> Vec<String> {
        let mut texts = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let Event::Notice { text, .. } = event {
                texts.push(text);
            }
        }
        texts
    }

    fn is_alive(pid: u32) -> bool {
        unsafe { libc::kill(pid as i32, 0) == 0 }
    }

    #[test]
    fn exit_codes() {
        assert_eq!(SessionOutcome::Interrupted.exit_code(), 0);
        assert_eq!(SessionOutcome::UnexpectedExit { name: "a".into() }.exit_code(), 1);
        assert_eq!(
            SessionOutcome::Crashed {
                name: "a".into(),
                code: Some(1)
            }
            .exit_code(),
            2
        );
        assert_eq!(SessionOutcome::StartupFailed { reason: "x".into() }.exit_code(), 1);
    }

    #[tokio::test]
    async fn crash_is_detected_while_another_slot_is_absent() {
        let (mut sup, _rx) = supervisor();
        let specs = vec![
            sh("a", "exec sleep 30"),
            sh("b", "sleep 0.5; exit 3"),
            sh("c", "exec sleep 30"),
        ];
        sup.start(&specs).await.unwrap();
        let table = sup.table();
        let pid_a = table.snapshot().await[0].pid.unwrap();

        // c is mid-restart: taken out of the table and already gone.
        let detached = table.detach_for_restart("c").await.unwrap().unwrap();
        let mut c = detached.child;
        let _ = c.kill().await;

        let outcome = tokio::time::timeout(Duration::from_secs(10), sup.supervise())
            .await
            .unwrap();
        assert_eq!(
            outcome,
            SessionOutcome::Crashed {
                name: "b".into(),
                code: Some(3)
            }
        );
        assert!(!is_alive(pid_a));
        assert!(table
            .snapshot()
            .await
            .iter()
            .all(|s| s.state == SlotState::Exiting && s.pid.is_none()));
    }

    #[tokio::test]
    async fn clean_exit_is_unexpected() {
        let (mut sup, mut rx) = supervisor();
        sup.start(&[sh("a", "exec sleep 30"), sh("b", "sleep 0.2")]).await.unwrap();
        let outcome = tokio::time::timeout(Duration::from_secs(10), sup.supervise())
            .await
            .unwrap();
        assert_eq!(outcome, SessionOutcome::UnexpectedExit { name: "b".into() });
        assert_eq!(outcome.exit_code(), 1);
        assert!(notices(&mut rx)
            .iter()
            .any(|t| t.contains("b exited unexpectedly (code 0)")));
    }

    #[tokio::test]
    async fn interrupt_stops_in_table_order() {
        let (mut sup, mut rx) = supervisor();
        sup.start(&[sh("a", "exec sleep 30"), sh("b", "exec sleep 30")]).await.unwrap();
        let interrupt = sup.interrupt();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            interrupt.trigger();
        });

        let outcome = tokio::time::timeout(Duration::from_secs(10), sup.supervise())
            .await
            .unwrap();
        assert_eq!(outcome, SessionOutcome::Interrupted);
        assert_eq!(outcome.exit_code(), 0);

        let texts = notices(&mut rx);
        let a = texts.iter().position(|t| t == "a stopped").unwrap();
        let b = texts.iter().position(|t| t == "b stopped").unwrap();
        assert!(a < b);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn watcher_restarts_target_and_goes_quiet_on_interrupt() {
        use crate::config::{MatchRule, WatchSettings};
        use crate::regenerate::SequenceConfig;

        let dir = tempfile::tempdir().unwrap();
        let schema_dir = dir.path().join("prisma");
        std::fs::create_dir(&schema_dir).unwrap();
        let schema = schema_dir.join("schema.prisma");
        std::fs::write(&schema, "model A {}").unwrap();

        let mut b = sh("b", "exec sleep 30");
        b.cwd = Some(dir.path().to_path_buf());
        let (mut sup, mut rx) = supervisor();
        sup.start(&[sh("a", "exec sleep 30"), b, sh("c", "exec sleep 30")])
            .await
            .unwrap();
        sup.watch(&WatchSettings {
            dir: schema_dir.clone(),
            file: "schema.prisma".into(),
            rule: MatchRule::Exact,
            debounce: Duration::from_millis(300),
            target: "b".into(),
            run_on_start: false,
            sequence: SequenceConfig {
                grace: Duration::from_secs(2),
                settle: Duration::from_millis(50),
                regenerate: None,
                sync: None,
            },
        });
        let table = sup.table();
        let interrupt = sup.interrupt();
        let session = tokio::spawn(sup.supervise());

        std::fs::write(&schema, "model A { id Int }").unwrap();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let snap = table.snapshot().await;
            if snap[1].generation >= 2 && snap[1].state == SlotState::Running {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "target was never restarted");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        // Outlast the debounce window so a further change would be admitted.
        tokio::time::sleep(Duration::from_millis(400)).await;

        interrupt.trigger();
        std::fs::write(&schema, "model B {}").unwrap();
        let outcome = tokio::time::timeout(Duration::from_secs(15), session)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome, SessionOutcome::Interrupted);
        assert_eq!(outcome.exit_code(), 0);

        let texts = notices(&mut rx);
        assert!(texts.iter().any(|t| t == "schema change detected, restarting b"));
        let shutting_down = texts.iter().position(|t| t == "shutting down").unwrap();
        let after = &texts[shutting_down..];
        assert!(!after.iter().any(|t| t.contains("schema change detected")));
        let order: Vec<_> = ["a stopped", "b stopped", "c stopped"]
            .iter()
            .map(|want| after.iter().position(|t| t == want).unwrap())
            .collect();
        assert!(order[0] < order[1] && order[1] < order[2]);
        assert_eq!(after.last().map(String::as_str), Some("all processes stopped"));
    }

    #[tokio::test]
    async fn spawn_failure_at_startup_is_fatal() {
        let (mut sup, _rx) = supervisor();
        let specs = vec![
            sh("a", "exec sleep 30"),
            ProcessSpec::new("b", "/definitely/not/a/binary", vec![]),
        ];
        let err = sup.start(&specs).await.unwrap_err();
        assert!(format!("{:#}", err).contains("failed to start b"));
        let table = sup.table();
        let pid_a = table.snapshot().await[0].pid.unwrap();

        let outcome = sup.abort_startup(err).await;
        assert!(matches!(outcome, SessionOutcome::StartupFailed { .. }));
        assert_eq!(outcome.exit_code(), 1);
        assert!(!is_alive(pid_a));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn squatted_port_is_reclaimed_before_start() {
        use crate::reclaim::test_support;

        let port = test_support::free_port();
        let mut squatter = test_support::spawn_stub(port);
        test_support::wait_until_listening(port);

        let exe = std::env::current_exe().unwrap();
        let mut b = ProcessSpec::new("b", exe.to_string_lossy(), test_support::stub_args());
        b.env.insert(test_support::STUB_PORT_ENV.into(), port.to_string());
        b.port = Some(port);

        let (mut sup, mut rx) = supervisor();
        sup.start(&[sh("a", "exec sleep 30"), b, sh("c", "exec sleep 30")])
            .await
            .unwrap();

        let status = squatter.wait().unwrap();
        assert!(!status.success());
        let table = sup.table();
        let snap = table.snapshot().await;
        assert_eq!(snap.len(), 3);
        assert!(snap.iter().all(|s| s.state == SlotState::Running));
        assert_ne!(snap[1].pid, Some(squatter.id()));
        assert!(notices(&mut rx)
            .iter()
            .any(|t| t.contains(&format!("port {} for b was in use", port))));

        test_support::wait_until_listening(port);
        sup.interrupt().trigger();
        let outcome = tokio::time::timeout(Duration::from_secs(15), sup.supervise())
            .await
            .unwrap();
        assert_eq!(outcome, SessionOutcome::Interrupted);
    }
}
