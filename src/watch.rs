//! Schema file watching with a leading-edge debounce.
//!
//! One OS thread observes a single directory (non-recursive). A change to the
//! watched file fires the trigger immediately; further changes inside the
//! debounce window are dropped, and anything that arrived while the trigger
//! was running is discarded once it returns.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use globset::{Glob, GlobMatcher};
use notify::event::EventKind;
use notify::{Event as NotifyEvent, RecommendedWatcher, RecursiveMode, Watcher};

use crate::config::MatchRule;

/// How often the watcher thread checks its stop flag.
const STOP_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Create,
    Modify,
    Remove,
    Other,
}

impl From<&EventKind> for ChangeKind {
    fn from(kind: &EventKind) -> Self {
        match kind {
            EventKind::Create(_) => ChangeKind::Create,
            EventKind::Modify(_) => ChangeKind::Modify,
            EventKind::Remove(_) => ChangeKind::Remove,
            _ => ChangeKind::Other,
        }
    }
}

/// A single filesystem change notification.
#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub path: PathBuf,
    pub kind: ChangeKind,
    pub at: Instant,
}

impl WatchEvent {
    fn from_notify(event: &NotifyEvent, at: Instant) -> Vec<WatchEvent> {
        let kind = ChangeKind::from(&event.kind);
        event
            .paths
            .iter()
            .map(|path| WatchEvent {
                path: path.clone(),
                kind,
                at,
            })
            .collect()
    }
}

/// Decides whether a changed path is the watched file.
#[derive(Debug, Clone)]
pub struct PathMatcher {
    target: String,
    rule: MatchRule,
    glob: Option<GlobMatcher>,
}

impl PathMatcher {
    pub fn new(target: &str, rule: MatchRule) -> Result<Self> {
        let glob = match rule {
            MatchRule::Glob => Some(
                Glob::new(target)
                    .with_context(|| format!("invalid watch glob {:?}", target))?
                    .compile_matcher(),
            ),
            _ => None,
        };
        Ok(Self {
            target: target.to_string(),
            rule,
            glob,
        })
    }

    pub fn matches(&self, path: &Path) -> bool {
        let file_name = path.file_name().map(|name| name.to_string_lossy());
        match self.rule {
            MatchRule::Exact => file_name.is_some_and(|name| name == self.target.as_str()),
            MatchRule::Suffix => path.to_string_lossy().ends_with(&self.target),
            MatchRule::Substring => path.to_string_lossy().contains(&self.target),
            MatchRule::Glob => match (&self.glob, file_name) {
                (Some(glob), Some(name)) => glob.is_match(name.as_ref()),
                _ => false,
            },
        }
    }
}

/// Leading-edge debounce: admit an event unless one was admitted less than
/// `min_interval` ago.
#[derive(Debug, Clone)]
pub struct Debouncer {
    last_trigger: Option<Instant>,
    min_interval: Duration,
}

impl Debouncer {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            last_trigger: None,
            min_interval,
        }
    }

    pub fn admit(&mut self, now: Instant) -> bool {
        if let Some(last) = self.last_trigger {
            if now.saturating_duration_since(last) < self.min_interval {
                return false;
            }
        }
        self.last_trigger = Some(now);
        true
    }

    /// Whether `now` falls inside the window opened by the last trigger.
    pub fn in_window(&self, now: Instant) -> bool {
        self.last_trigger
            .is_some_and(|last| now.saturating_duration_since(last) < self.min_interval)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    Idle,
    /// A trigger fired recently; qualifying events are being dropped.
    Debounced,
    Triggering,
}

/// Watch options resolved from configuration.
#[derive(Debug, Clone)]
pub struct WatchOptions {
    pub dir: PathBuf,
    pub file: String,
    pub rule: MatchRule,
    pub debounce: Duration,
}

/// Event filtering and debounce, independent of the OS watcher.
struct WatchLoop<F> {
    matcher: PathMatcher,
    debouncer: Debouncer,
    state: WatchState,
    trigger: F,
}

impl<F: FnMut()> WatchLoop<F> {
    fn new(matcher: PathMatcher, debounce: Duration, trigger: F) -> Self {
        Self {
            matcher,
            debouncer: Debouncer::new(debounce),
            state: WatchState::Idle,
            trigger,
        }
    }

    fn qualifies(&self, event: &WatchEvent) -> bool {
        matches!(event.kind, ChangeKind::Create | ChangeKind::Modify)
            && !event.path.is_dir()
            && self.matcher.matches(&event.path)
    }

    /// Feeds one event; returns true when it fired the trigger.
    fn handle(&mut self, event: &WatchEvent) -> bool {
        if self.state == WatchState::Debounced && !self.debouncer.in_window(event.at) {
            self.state = WatchState::Idle;
        }
        if !self.qualifies(event) {
            return false;
        }
        if !self.debouncer.admit(event.at) {
            tracing::trace!(path = %event.path.display(), "change dropped by debounce");
            self.state = WatchState::Debounced;
            return false;
        }
        tracing::debug!(path = %event.path.display(), kind = ?event.kind, "watched file changed");
        self.state = WatchState::Triggering;
        (self.trigger)();
        self.state = WatchState::Debounced;
        true
    }
}

/// A running watcher thread.
pub struct ChangeWatcher {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl ChangeWatcher {
    /// Starts watching `options.dir`; `trigger` runs on the watcher thread.
    pub fn start<F>(options: &WatchOptions, trigger: F) -> Result<Self>
    where
        F: FnMut() + Send + 'static,
    {
        let matcher = PathMatcher::new(&options.file, options.rule)?;
        let (raw_tx, raw_rx) = std::sync::mpsc::channel();
        let mut watcher = RecommendedWatcher::new(
            move |res| {
                let _ = raw_tx.send(res);
            },
            notify::Config::default(),
        )
        .context("failed to create watcher")?;
        watcher
            .watch(&options.dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("failed to watch {}", options.dir.display()))?;

        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let debounce = options.debounce;
        let thread = std::thread::Builder::new()
            .name("devrack-watch".into())
            .spawn(move || {
                // Keep the OS watcher alive for the lifetime of the thread.
                let _watcher = watcher;
                let mut watch_loop = WatchLoop::new(matcher, debounce, trigger);
                while !flag.load(Ordering::SeqCst) {
                    let event = match raw_rx.recv_timeout(STOP_POLL) {
                        Ok(Ok(event)) => event,
                        Ok(Err(err)) => {
                            tracing::warn!(error = %err, "watch error");
                            continue;
                        }
                        Err(RecvTimeoutError::Timeout) => continue,
                        Err(RecvTimeoutError::Disconnected) => break,
                    };
                    let now = Instant::now();
                    for change in WatchEvent::from_notify(&event, now) {
                        if flag.load(Ordering::SeqCst) {
                            break;
                        }
                        if watch_loop.handle(&change) {
                            let dropped = raw_rx.try_iter().count();
                            if dropped > 0 {
                                tracing::debug!(dropped, "discarded changes queued during restart");
                            }
                            break;
                        }
                    }
                }
                tracing::debug!("watcher thread exiting");
            })
            .context("failed to spawn watcher thread")?;

        tracing::debug!(dir = %options.dir.display(), file = %options.file, "watching");
        Ok(Self {
            stop,
            thread: Some(thread),
        })
    }

    /// Stops the thread and waits for it, including any trigger in progress.
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::warn!("watcher thread panicked");
            }
        }
    }
}

impl Drop for ChangeWatcher {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}
