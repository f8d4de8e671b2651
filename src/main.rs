//! devrack: a development process supervisor.
//!
//! This is the entry point of the application. It parses command-line arguments,
//! loads configuration, runs setup, and hands the managed processes to the
//! supervisor until an interrupt or an unexpected exit ends the session.

mod command;
mod config;
mod events;
mod output;
mod process;
mod reclaim;
mod regenerate;
mod relay;
mod runner;
mod setup;
mod strays;
mod supervisor;
mod table;
mod watch;

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Result;
use clap::builder::styling::{AnsiColor, Effects, Style};
use clap::builder::Styles;
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use crate::config::{Settings, DEFAULT_CONFIG_FILE};
use crate::events::Notifier;
use crate::runner::ShutdownSignal;
use crate::supervisor::{Interrupt, SessionOutcome, Supervisor, SupervisorOptions};

/// Command-line interface definition.
#[derive(Debug, Parser)]
#[command(
    name = "devrack",
    version,
    about = "Development process supervisor with schema-triggered restarts",
    styles = help_styles(),
    color = clap::ColorChoice::Auto,
    disable_help_subcommand = true
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
    /// Path to devrack.toml configuration file.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Do not watch the schema file.
    #[arg(long)]
    no_watch: bool,
    /// Do not kill processes holding configured ports.
    #[arg(long)]
    no_reclaim: bool,
    /// Skip preflight checks, pre-commands and the initial sync.
    #[arg(long)]
    skip_setup: bool,
    /// Prepend elapsed time to each line.
    #[arg(long)]
    timestamp: bool,
    /// Diagnostic log verbosity (-v debug, -vv trace); RUST_LOG overrides.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Validate the configuration and print what would run.
    Check,
    /// Show version information.
    Version,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Some(Commands::Version) = &cli.command {
        println!("devrack {}", env!("CARGO_PKG_VERSION"));
        return Ok(ExitCode::SUCCESS);
    }

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
    let mut settings = config::load_settings(&config_path)?;
    if cli.timestamp {
        settings.console.timestamp = true;
    }

    if let Some(Commands::Check) = &cli.command {
        for line in plan_lines(&settings) {
            println!("{}", line);
        }
        return Ok(ExitCode::SUCCESS);
    }

    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let console = output::spawn_console(event_rx, settings.console.clone(), std::io::stdout());
    let outcome = run(&cli, settings, Notifier::new(event_tx)).await;
    tracing::debug!(?outcome, "session finished");

    // Every sender is gone once the supervisor is; let the console drain.
    let _ = tokio::time::timeout(Duration::from_secs(2), console).await;
    Ok(ExitCode::from(outcome.exit_code()))
}

async fn run(cli: &Cli, settings: Settings, notifier: Notifier) -> SessionOutcome {
    let options = SupervisorOptions {
        reclaim: !cli.no_reclaim,
        reclaim_settle: settings.reclaim_settle,
        poll_interval: settings.poll_interval,
        shutdown: settings.shutdown,
    };
    let mut supervisor = Supervisor::new(options, notifier.clone());
    spawn_signal_listener(supervisor.interrupt());
    let shutdown = supervisor.shutdown_signal();

    if let Err(err) = prepare(cli, &settings, &notifier, &shutdown).await {
        return supervisor.abort_startup(err).await;
    }
    if let Err(err) = supervisor.start(&settings.specs).await {
        return supervisor.abort_startup(err).await;
    }
    match &settings.watch {
        Some(watch) if !cli.no_watch => supervisor.watch(watch),
        _ => {}
    }
    setup::print_banner(&settings.specs, &notifier);
    drop(notifier);
    supervisor.supervise().await
}

async fn prepare(cli: &Cli, settings: &Settings, notifier: &Notifier, shutdown: &ShutdownSignal) -> Result<()> {
    setup::check_directories(&settings.specs)?;
    if cli.skip_setup {
        return Ok(());
    }
    setup::run_preflight(&settings.preflight, notifier, shutdown).await?;
    setup::prepare_processes(&settings.specs, notifier, shutdown).await?;
    if let Some(watch) = settings.watch.as_ref().filter(|watch| watch.run_on_start) {
        if let Some(target) = settings.specs.iter().find(|spec| spec.name == watch.target) {
            setup::initial_sync(watch, target, notifier, shutdown).await;
        }
    }
    Ok(())
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn spawn_signal_listener(interrupt: Interrupt) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => tracing::debug!("received SIGINT"),
                        _ = sigterm.recv() => tracing::debug!("received SIGTERM"),
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, "cannot listen for SIGTERM");
                    let _ = tokio::signal::ctrl_c().await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        interrupt.trigger();
    });
}

/// Human-readable summary of what a session would run.
fn plan_lines(settings: &Settings) -> Vec<String> {
    let mut lines = Vec::new();
    for check in &settings.preflight {
        lines.push(format!("preflight {}: {}", check.name, check.command.command_line()));
    }
    for spec in &settings.specs {
        let mut line = format!("process {}: {}", spec.name, spec.command_line());
        if let Some(cwd) = &spec.cwd {
            line.push_str(&format!(" (in {})", cwd.display()));
        }
        if let Some(port) = spec.port {
            line.push_str(&format!(" port {}", port));
        }
        lines.push(line);
        if let Some(pre) = &spec.pre_cmd {
            match &spec.pre_if_missing {
                Some(marker) => lines.push(format!("  pre_cmd: {} (if {} is missing)", pre, marker.display())),
                None => lines.push(format!("  pre_cmd: {}", pre)),
            }
        }
    }
    if let Some(watch) = &settings.watch {
        lines.push(format!(
            "watch {} in {} ({:?}, debounce {}ms) -> restart {}",
            watch.file,
            watch.dir.display(),
            watch.rule,
            watch.debounce.as_millis(),
            watch.target
        ));
        for tool in [&watch.sequence.regenerate, &watch.sequence.sync].into_iter().flatten() {
            lines.push(format!(
                "  {}: {} (timeout {}s, attempts {})",
                tool.label,
                tool.command_line(),
                tool.timeout.as_secs(),
                tool.attempts
            ));
        }
    }
    lines
}

fn help_styles() -> Styles {
    Styles::styled()
        .header(
            Style::new()
                .fg_color(Some(AnsiColor::Cyan.into()))
                .effects(Effects::BOLD),
        )
        .usage(
            Style::new()
                .fg_color(Some(AnsiColor::Green.into()))
                .effects(Effects::BOLD),
        )
        .literal(Style::new().fg_color(Some(AnsiColor::Yellow.into())))
        .placeholder(Style::new().fg_color(Some(AnsiColor::Magenta.into())))
        .valid(Style::new().fg_color(Some(AnsiColor::Green.into())))
        .invalid(
            Style::new()
                .fg_color(Some(AnsiColor::Red.into()))
                .effects(Effects::BOLD),
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn cli_parses_flags() {
        let cli = Cli::try_parse_from(["devrack", "--config", "dev.toml", "--no-watch", "-vv"]).unwrap();
        assert_eq!(cli.config.as_deref(), Some(Path::new("dev.toml")));
        assert!(cli.no_watch);
        assert!(!cli.no_reclaim);
        assert_eq!(cli.verbose, 2);

        let cli = Cli::try_parse_from(["devrack", "check"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::Check)));
    }

    #[cfg(unix)]
    #[test]
    fn plan_lists_processes_and_watch() {
        let raw = r#"
[[process]]
name = "backend"
cmd = "npm run dev"
cwd = "backend"
port = 5000
pre_cmd = "npm install"

[watch]
dir = "backend/prisma"
file = "schema.prisma"
target = "backend"

[watch.regenerate]
cmd = "npx prisma generate"
"#;
        let config: config::Config = toml::from_str(raw).unwrap();
        let settings = config::resolve(config, Path::new("/proj"), |_| None).unwrap();
        let lines = plan_lines(&settings);
        assert_eq!(lines[0], "process backend: npm run dev (in /proj/backend) port 5000");
        assert_eq!(lines[1], "  pre_cmd: npm install");
        assert!(lines[2].starts_with("watch schema.prisma in /proj/backend/prisma"));
        assert!(lines[2].ends_with("-> restart backend"));
        assert_eq!(lines[3], "  regenerate: npx prisma generate (timeout 60s, attempts 3)");
    }
}
