//! Configuration management for devrack.
//!
//! This module defines the structure of the `devrack.toml` configuration file,
//! loads and parses it, and resolves it into the runtime [`Settings`] the
//! supervisor works from: defaults applied, relative paths anchored at the
//! config file, command lines split, and the environment overlay resolved
//! per process.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;

use crate::command::ExternalCommand;
use crate::output::ConsoleSettings;
use crate::process::ProcessSpec;
use crate::regenerate::SequenceConfig;
use crate::runner::{ProcessSignal, ShutdownConfig};

pub const DEFAULT_CONFIG_FILE: &str = "devrack.toml";

const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;
const DEFAULT_RECLAIM_SETTLE_MS: u64 = 1000;
const DEFAULT_DEBOUNCE_MS: u64 = 5000;
const DEFAULT_SEQUENCE_SETTLE_MS: u64 = 5000;
const DEFAULT_REGENERATE_TIMEOUT_MS: u64 = 60_000;
const DEFAULT_REGENERATE_ATTEMPTS: u32 = 3;
const DEFAULT_RETRY_DELAY_MS: u64 = 2000;
const DEFAULT_SYNC_TIMEOUT_MS: u64 = 120_000;
const DEFAULT_PREFLIGHT_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_SECRET: &str = "change-me-in-development";
const DEFAULT_MODE: &str = "development";
const DEFAULT_SYNC_PATTERNS: [&str; 2] = ["already in sync", "already up to date"];

/// Top-level configuration structure corresponding to `devrack.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Liveness check interval in milliseconds.
    pub poll_interval_ms: Option<u64>,
    /// Pause after killing a port owner, in milliseconds.
    pub settle_ms: Option<u64>,
    /// Whether to prepend timestamps to log lines.
    pub timestamp: Option<bool>,
    /// Fixed length for prefixes (padding/truncation).
    pub prefix_length: Option<usize>,
    /// Remove ANSI escape codes from child output.
    pub strip_ansi: Option<bool>,
    /// Stop signal and grace periods.
    pub shutdown: Option<ShutdownSection>,
    /// Values for the environment overlay.
    pub overlay: Option<OverlayConfig>,
    /// List of processes to run.
    #[serde(rename = "process", default)]
    pub processes: Vec<ProcessConfig>,
    /// Schema watch and the restart sequence it triggers.
    pub watch: Option<WatchConfig>,
    /// Tools that must be runnable before anything starts.
    #[serde(default)]
    pub preflight: Vec<PreflightConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ShutdownSection {
    /// "SIGTERM" (default) or "SIGINT".
    pub signal: Option<String>,
    pub interrupt_grace_ms: Option<u64>,
    pub crash_grace_ms: Option<u64>,
    pub restart_grace_ms: Option<u64>,
}

/// Environment values injected into processes that opt in with `use_overlay`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OverlayConfig {
    pub database_url: Option<String>,
    pub secret_key: Option<String>,
    pub port: Option<u16>,
    pub mode: Option<String>,
    /// Additional variables, set verbatim.
    pub extra: Option<HashMap<String, String>>,
}

/// Configuration for a single process.
#[derive(Debug, Clone, Deserialize)]
pub struct ProcessConfig {
    /// Display name of the process.
    pub name: String,
    /// Command to execute.
    pub cmd: String,
    /// Working directory, relative to the config file.
    pub cwd: Option<String>,
    /// Color override for the process name in logs.
    pub color: Option<String>,
    /// Environment variables to set for the process.
    pub env: Option<HashMap<String, String>>,
    /// TCP port the process serves on; reclaimed before launch.
    pub port: Option<u16>,
    /// Whether to inject the overlay variables.
    pub use_overlay: Option<bool>,
    /// Command to run before starting the main process.
    pub pre_cmd: Option<String>,
    /// Only run `pre_cmd` when this path (relative to `cwd`) is missing.
    pub pre_if_missing: Option<String>,
}

/// How a changed path is compared against the watched file name.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchRule {
    /// File name equals the target.
    Exact,
    /// Path ends with the target.
    #[default]
    Suffix,
    /// Path contains the target.
    Substring,
    /// File name matches the target as a glob.
    Glob,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WatchConfig {
    /// Directory to observe (non-recursive), relative to the config file.
    pub dir: String,
    /// File name (or pattern) that triggers the sequence.
    pub file: String,
    #[serde(rename = "match")]
    pub match_rule: Option<MatchRule>,
    pub debounce_ms: Option<u64>,
    /// Pause between stopping the target and regenerating.
    pub settle_ms: Option<u64>,
    /// Name of the process restarted on change.
    pub target: String,
    /// Run sync and regenerate once before launching processes.
    pub run_on_start: Option<bool>,
    pub regenerate: Option<ToolConfig>,
    pub sync: Option<ToolConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolConfig {
    pub cmd: String,
    pub timeout_ms: Option<u64>,
    pub retries: Option<u32>,
    pub retry_delay_ms: Option<u64>,
    pub success_patterns: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PreflightConfig {
    pub name: String,
    pub cmd: String,
}

/// Loads and parses the configuration from a file path.
pub fn load_config(path: &Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config: Config = toml::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    Ok(config)
}

/// Resolved watch section.
#[derive(Debug, Clone)]
pub struct WatchSettings {
    pub dir: PathBuf,
    pub file: String,
    pub rule: MatchRule,
    pub debounce: Duration,
    pub target: String,
    pub run_on_start: bool,
    pub sequence: SequenceConfig,
}

/// A tool that must answer before the session starts.
#[derive(Debug, Clone)]
pub struct PreflightCheck {
    pub name: String,
    pub command: ExternalCommand,
}

/// Everything the supervisor needs, resolved from a [`Config`].
#[derive(Debug, Clone)]
pub struct Settings {
    pub specs: Vec<ProcessSpec>,
    pub console: ConsoleSettings,
    pub shutdown: ShutdownConfig,
    pub poll_interval: Duration,
    pub reclaim_settle: Duration,
    pub watch: Option<WatchSettings>,
    pub preflight: Vec<PreflightCheck>,
}

/// Loads `path` and resolves it against the process environment.
pub fn load_settings(path: &Path) -> Result<Settings> {
    let config = load_config(path)?;
    let base = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    resolve(config, &base, |key| std::env::var(key).ok())
        .with_context(|| format!("invalid config file {}", path.display()))
}

/// Resolves a parsed config. `lookup` reads inherited environment variables.
pub fn resolve<F>(config: Config, base: &Path, lookup: F) -> Result<Settings>
where
    F: Fn(&str) -> Option<String>,
{
    if config.processes.is_empty() {
        bail!("no [[process]] entries defined");
    }
    ensure_unique_names(&config.processes)?;

    let overlay = config.overlay.clone().unwrap_or_default();
    let specs = config
        .processes
        .iter()
        .map(|process| spec_from_config(process, base, &overlay, &lookup))
        .collect::<Result<Vec<_>>>()?;

    let shutdown = shutdown_from_config(config.shutdown.as_ref())?;
    let watch = match &config.watch {
        Some(watch) => Some(watch_from_config(watch, base, &specs, shutdown.restart_grace)?),
        None => None,
    };
    let preflight = config
        .preflight
        .iter()
        .map(|check| {
            Ok(PreflightCheck {
                name: check.name.clone(),
                command: ExternalCommand::parse(
                    &check.name,
                    &check.cmd,
                    Duration::from_millis(DEFAULT_PREFLIGHT_TIMEOUT_MS),
                )?,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(Settings {
        specs,
        console: ConsoleSettings {
            timestamp: config.timestamp.unwrap_or(false),
            prefix_length: config.prefix_length,
            strip_ansi: config.strip_ansi.unwrap_or(false),
            colors: true,
        },
        shutdown,
        poll_interval: Duration::from_millis(config.poll_interval_ms.unwrap_or(DEFAULT_POLL_INTERVAL_MS)),
        reclaim_settle: Duration::from_millis(config.settle_ms.unwrap_or(DEFAULT_RECLAIM_SETTLE_MS)),
        watch,
        preflight,
    })
}

fn ensure_unique_names(processes: &[ProcessConfig]) -> Result<()> {
    let mut seen = HashSet::new();
    for process in processes {
        if process.name.trim().is_empty() {
            bail!("process name must not be empty");
        }
        if !seen.insert(process.name.as_str()) {
            bail!("duplicate process name: {}", process.name);
        }
    }
    Ok(())
}

fn spec_from_config<F>(
    process: &ProcessConfig,
    base: &Path,
    overlay: &OverlayConfig,
    lookup: &F,
) -> Result<ProcessSpec>
where
    F: Fn(&str) -> Option<String>,
{
    let mut parts = shell_words::split(&process.cmd)
        .with_context(|| format!("failed to parse cmd for {}", process.name))?;
    if parts.is_empty() {
        bail!("empty cmd for process {}", process.name);
    }
    let cmd = parts.remove(0);
    let mut spec = ProcessSpec::new(process.name.clone(), cmd, parts);
    let cwd = process
        .cwd
        .as_deref()
        .map(|dir| base.join(dir))
        .unwrap_or_else(|| base.to_path_buf());
    spec.pre_if_missing = process.pre_if_missing.as_deref().map(|p| cwd.join(p));
    spec.cwd = Some(cwd);
    spec.color = process.color.clone();
    spec.port = process.port;
    spec.pre_cmd = process.pre_cmd.clone();

    if process.use_overlay.unwrap_or(false) {
        spec.env = resolve_overlay(overlay, process.port, lookup);
    }
    if let Some(env) = &process.env {
        spec.env.extend(env.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    Ok(spec)
}

/// Resolves overlay variables: configured value, then inherited variable, then default.
pub fn resolve_overlay<F>(overlay: &OverlayConfig, port: Option<u16>, lookup: &F) -> HashMap<String, String>
where
    F: Fn(&str) -> Option<String>,
{
    let mut env = HashMap::new();
    if let Some(url) = overlay.database_url.clone().or_else(|| lookup("DATABASE_URL")) {
        env.insert("DATABASE_URL".to_string(), url);
    }
    let secret = overlay
        .secret_key
        .clone()
        .or_else(|| lookup("JWT_SECRET"))
        .unwrap_or_else(|| DEFAULT_SECRET.to_string());
    env.insert("JWT_SECRET".to_string(), secret);
    let port = overlay
        .port
        .map(|p| p.to_string())
        .or_else(|| lookup("PORT"))
        .or_else(|| port.map(|p| p.to_string()));
    if let Some(port) = port {
        env.insert("PORT".to_string(), port);
    }
    let mode = overlay
        .mode
        .clone()
        .or_else(|| lookup("NODE_ENV"))
        .unwrap_or_else(|| DEFAULT_MODE.to_string());
    env.insert("NODE_ENV".to_string(), mode);
    if let Some(extra) = &overlay.extra {
        env.extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    env
}

fn shutdown_from_config(section: Option<&ShutdownSection>) -> Result<ShutdownConfig> {
    let mut shutdown = ShutdownConfig::default();
    let Some(section) = section else {
        return Ok(shutdown);
    };
    if let Some(signal) = &section.signal {
        shutdown.signal = match signal.to_ascii_uppercase().as_str() {
            "SIGTERM" | "TERM" => ProcessSignal::SigTerm,
            "SIGINT" | "INT" => ProcessSignal::SigInt,
            other => bail!("unknown shutdown signal: {}", other),
        };
    }
    if let Some(ms) = section.interrupt_grace_ms {
        shutdown.interrupt_grace = Duration::from_millis(ms);
    }
    if let Some(ms) = section.crash_grace_ms {
        shutdown.crash_grace = Duration::from_millis(ms);
    }
    if let Some(ms) = section.restart_grace_ms {
        shutdown.restart_grace = Duration::from_millis(ms);
    }
    Ok(shutdown)
}

fn watch_from_config(
    watch: &WatchConfig,
    base: &Path,
    specs: &[ProcessSpec],
    restart_grace: Duration,
) -> Result<WatchSettings> {
    if !specs.iter().any(|spec| spec.name == watch.target) {
        bail!("watch target {} is not a defined process", watch.target);
    }
    if watch.file.trim().is_empty() {
        bail!("watch file must not be empty");
    }
    let rule = watch.match_rule.unwrap_or_default();
    if rule == MatchRule::Glob {
        globset::Glob::new(&watch.file)
            .with_context(|| format!("invalid watch glob {:?}", watch.file))?;
    }

    let regenerate = watch
        .regenerate
        .as_ref()
        .map(|tool| {
            tool_command(
                "regenerate",
                tool,
                DEFAULT_REGENERATE_TIMEOUT_MS,
                DEFAULT_REGENERATE_ATTEMPTS,
                &[],
            )
        })
        .transpose()?;
    let sync = watch
        .sync
        .as_ref()
        .map(|tool| tool_command("sync", tool, DEFAULT_SYNC_TIMEOUT_MS, 1, &DEFAULT_SYNC_PATTERNS))
        .transpose()?;

    Ok(WatchSettings {
        dir: base.join(&watch.dir),
        file: watch.file.clone(),
        rule,
        debounce: Duration::from_millis(watch.debounce_ms.unwrap_or(DEFAULT_DEBOUNCE_MS)),
        target: watch.target.clone(),
        run_on_start: watch.run_on_start.unwrap_or(false),
        sequence: SequenceConfig {
            grace: restart_grace,
            settle: Duration::from_millis(watch.settle_ms.unwrap_or(DEFAULT_SEQUENCE_SETTLE_MS)),
            regenerate,
            sync,
        },
    })
}

fn tool_command(
    label: &str,
    tool: &ToolConfig,
    default_timeout_ms: u64,
    default_attempts: u32,
    default_patterns: &[&str],
) -> Result<ExternalCommand> {
    let timeout = Duration::from_millis(tool.timeout_ms.unwrap_or(default_timeout_ms));
    let attempts = tool.retries.unwrap_or(default_attempts);
    if attempts == 0 {
        return Err(anyhow!("{} retries must be at least 1", label));
    }
    let patterns = tool
        .success_patterns
        .clone()
        .unwrap_or_else(|| default_patterns.iter().map(|p| p.to_string()).collect());
    ExternalCommand::parse(label, &tool.cmd, timeout)?
        .with_attempts(
            attempts,
            Duration::from_millis(tool.retry_delay_ms.unwrap_or(DEFAULT_RETRY_DELAY_MS)),
        )
        .with_success_patterns(&patterns)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
poll_interval_ms = 500
settle_ms = 200
timestamp = true
prefix_length = 8
strip_ansi = true

[shutdown]
signal = "SIGINT"
interrupt_grace_ms = 4000
crash_grace_ms = 1500

[overlay]
database_url = "postgres://localhost/app"
extra = { LOG_LEVEL = "debug" }

[[process]]
name = "backend"
cmd = "npm run dev"
cwd = "backend"
color = "cyan"
port = 5000
use_overlay = true
pre_cmd = "npm install"
pre_if_missing = "node_modules"

[[process]]
name = "web"
cmd = "npm run dev -- --host 0.0.0.0"
cwd = "web"
color = "magenta"
port = 3000
env = { BROWSER = "none" }

[watch]
dir = "backend/prisma"
file = "schema.prisma"
target = "backend"
debounce_ms = 2000

[watch.regenerate]
cmd = "npx prisma generate"

[watch.sync]
cmd = "npx prisma db push --accept-data-loss"
timeout_ms = 90000

[[preflight]]
name = "node"
cmd = "node --version"
"#;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    fn parse(raw: &str) -> Config {
        toml::from_str(raw).unwrap()
    }

    #[test]
    fn parses_optional_fields() {
        let config = parse(SAMPLE);
        assert_eq!(config.poll_interval_ms, Some(500));
        assert_eq!(config.timestamp, Some(true));
        assert_eq!(config.prefix_length, Some(8));
        assert_eq!(config.processes.len(), 2);
        assert_eq!(config.processes[0].port, Some(5000));
        assert_eq!(config.processes[0].use_overlay, Some(true));
        assert_eq!(config.processes[1].use_overlay, None);
        let watch = config.watch.unwrap();
        assert_eq!(watch.match_rule, None);
        assert_eq!(watch.target, "backend");
        assert_eq!(config.preflight.len(), 1);
    }

    #[test]
    fn resolves_settings_with_defaults() {
        let settings = resolve(parse(SAMPLE), Path::new("/proj"), no_env).unwrap();
        assert_eq!(settings.poll_interval, Duration::from_millis(500));
        assert_eq!(settings.reclaim_settle, Duration::from_millis(200));
        assert_eq!(settings.shutdown.signal, ProcessSignal::SigInt);
        assert_eq!(settings.shutdown.interrupt_grace, Duration::from_secs(4));
        assert_eq!(settings.shutdown.crash_grace, Duration::from_millis(1500));
        assert_eq!(settings.shutdown.restart_grace, Duration::from_secs(5));
        assert!(settings.console.strip_ansi);

        let backend = &settings.specs[0];
        assert_eq!(backend.cmd, "npm");
        assert_eq!(backend.args, vec!["run", "dev"]);
        assert_eq!(backend.cwd.as_deref(), Some(Path::new("/proj/backend")));
        assert_eq!(
            backend.pre_if_missing.as_deref(),
            Some(Path::new("/proj/backend/node_modules"))
        );

        let web = &settings.specs[1];
        assert_eq!(web.args, vec!["run", "dev", "--", "--host", "0.0.0.0"]);
        assert_eq!(web.env.get("BROWSER").map(String::as_str), Some("none"));
        assert!(!web.env.contains_key("NODE_ENV"));

        let watch = settings.watch.unwrap();
        assert_eq!(watch.dir, PathBuf::from("/proj/backend/prisma"));
        assert_eq!(watch.rule, MatchRule::Suffix);
        assert_eq!(watch.debounce, Duration::from_secs(2));
        assert!(!watch.run_on_start);
        assert_eq!(watch.sequence.settle, Duration::from_secs(5));
        let regenerate = watch.sequence.regenerate.unwrap();
        assert_eq!(regenerate.timeout, Duration::from_secs(60));
        assert_eq!(regenerate.attempts, 3);
        assert_eq!(regenerate.retry_delay, Duration::from_secs(2));
        let sync = watch.sequence.sync.unwrap();
        assert_eq!(sync.timeout, Duration::from_secs(90));
        assert_eq!(sync.attempts, 1);
        assert_eq!(sync.success_patterns.len(), 2);
    }

    #[test]
    fn overlay_prefers_configured_then_inherited_then_default() {
        let overlay = OverlayConfig {
            database_url: None,
            secret_key: Some("configured".into()),
            port: None,
            mode: None,
            extra: None,
        };
        let inherited = |key: &str| match key {
            "DATABASE_URL" => Some("postgres://inherited".to_string()),
            "JWT_SECRET" => Some("inherited-secret".to_string()),
            _ => None,
        };
        let env = resolve_overlay(&overlay, Some(5000), &inherited);
        assert_eq!(env["DATABASE_URL"], "postgres://inherited");
        assert_eq!(env["JWT_SECRET"], "configured");
        assert_eq!(env["PORT"], "5000");
        assert_eq!(env["NODE_ENV"], "development");

        let env = resolve_overlay(&OverlayConfig::default(), None, &no_env);
        assert!(!env.contains_key("DATABASE_URL"));
        assert!(!env.contains_key("PORT"));
        assert_eq!(env["JWT_SECRET"], DEFAULT_SECRET);
    }

    #[test]
    fn explicit_env_overrides_overlay() {
        let raw = r#"
[[process]]
name = "api"
cmd = "node server.js"
port = 5000
use_overlay = true
env = { NODE_ENV = "test" }
"#;
        let settings = resolve(parse(raw), Path::new("."), |key| {
            (key == "PORT").then(|| "6000".to_string())
        })
        .unwrap();
        let env = &settings.specs[0].env;
        assert_eq!(env["NODE_ENV"], "test");
        assert_eq!(env["PORT"], "6000");
    }

    #[test]
    fn rejects_duplicate_names() {
        let raw = r#"
[[process]]
name = "api"
cmd = "a"

[[process]]
name = "api"
cmd = "b"
"#;
        let err = resolve(parse(raw), Path::new("."), no_env).unwrap_err();
        assert!(err.to_string().contains("duplicate process name"));
    }

    #[test]
    fn rejects_empty_command() {
        let raw = r#"
[[process]]
name = "api"
cmd = "   "
"#;
        let err = resolve(parse(raw), Path::new("."), no_env).unwrap_err();
        assert!(err.to_string().contains("empty cmd"));
    }

    #[test]
    fn rejects_unknown_watch_target() {
        let raw = r#"
[[process]]
name = "api"
cmd = "node server.js"

[watch]
dir = "prisma"
file = "schema.prisma"
target = "backend"
"#;
        let err = resolve(parse(raw), Path::new("."), no_env).unwrap_err();
        assert!(err.to_string().contains("watch target backend"));
    }

    #[test]
    fn parses_match_rule_and_rejects_bad_glob() {
        let raw = r#"
[[process]]
name = "api"
cmd = "node server.js"

[watch]
dir = "prisma"
file = "*.prisma"
match = "glob"
target = "api"
"#;
        let settings = resolve(parse(raw), Path::new("."), no_env).unwrap();
        assert_eq!(settings.watch.unwrap().rule, MatchRule::Glob);

        let bad = raw.replace("*.prisma", "[schema");
        assert!(resolve(parse(&bad), Path::new("."), no_env).is_err());
    }

    #[test]
    fn rejects_missing_processes_and_bad_signal() {
        assert!(resolve(Config::default(), Path::new("."), no_env).is_err());
        let raw = r#"
[shutdown]
signal = "SIGHUP"

[[process]]
name = "api"
cmd = "node"
"#;
        let err = resolve(parse(raw), Path::new("."), no_env).unwrap_err();
        assert!(err.to_string().contains("unknown shutdown signal"));
    }
}
