//! canto-watch: follow a Canto backend's health from the terminal.
//!
//! Runs the health monitor against a configured backend and reports every
//! verdict change. Control lines on stdin drive it the way a browser would:
//!
//! ```text
//! refetch | online | offline | focus | quit
//! ```
//!
//! # Usage
//!
//! ```text
//! canto-watch run --config canto.toml --json
//! canto-watch init --path canto.toml
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};

use canto_core::{CantoConfig, HealthStatus};
use canto_health::{BoxFuture, HealthCallback, HealthMonitor, HttpProbe, MonitorHandle, ProgressGate};

#[derive(Parser)]
#[command(name = "canto-watch", about = "Canto backend health watcher", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Poll the backend until interrupted.
    Run {
        /// Path to canto.toml. Defaults apply when omitted.
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Override `[api].base_url`.
        #[arg(long)]
        url: Option<String>,

        /// Print every snapshot as a JSON line on stdout.
        #[arg(long)]
        json: bool,

        /// Start as if the network were unavailable.
        #[arg(long)]
        offline: bool,
    },
    /// Write a canto.toml with default settings.
    Init {
        #[arg(short, long, default_value = "canto.toml")]
        path: PathBuf,
    },
}

/// Line-oriented control input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    Refetch,
    Online,
    Offline,
    Focus,
    Quit,
}

fn parse_control(line: &str) -> Option<Control> {
    match line.trim().to_ascii_lowercase().as_str() {
        "refetch" | "r" => Some(Control::Refetch),
        "online" => Some(Control::Online),
        "offline" => Some(Control::Offline),
        "focus" => Some(Control::Focus),
        "quit" | "exit" | "q" => Some(Control::Quit),
        _ => None,
    }
}

/// Tracks whether the maintenance notice is showing.
#[derive(Debug, Default)]
struct DownNotice {
    shown: bool,
}

impl DownNotice {
    /// Feed the latest verdict. Returns `true` only when the notice first
    /// appears, which is when the watcher asks for an immediate re-check.
    fn observe(&mut self, is_down: bool) -> bool {
        let appeared = is_down && !self.shown;
        self.shown = is_down;
        appeared
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,canto=debug")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            config,
            url,
            json,
            offline,
        } => run(config, url, json, offline).await,
        Command::Init { path } => init(path),
    }
}

fn init(path: PathBuf) -> anyhow::Result<()> {
    if path.exists() {
        anyhow::bail!("{} already exists", path.display());
    }
    let content = CantoConfig::default().to_toml_string()?;
    std::fs::write(&path, content).with_context(|| format!("writing {}", path.display()))?;
    info!(path = %path.display(), "wrote default config");
    Ok(())
}

async fn run(
    config: Option<PathBuf>,
    url: Option<String>,
    json: bool,
    offline: bool,
) -> anyhow::Result<()> {
    let mut config = match config {
        Some(path) => CantoConfig::from_file(&path)?,
        None => CantoConfig::default(),
    };
    if let Some(url) = url {
        config.api.base_url = url;
    }
    config.health.validate()?;

    let probe = HttpProbe::new(
        &config.api.base_url,
        &config.api.health_path,
        config.health.timeout(),
    )?;
    info!(
        address = probe.address(),
        path = probe.path(),
        "watching backend health"
    );

    let gate = ProgressGate::new(&config.api.health_path);
    let handle = HealthMonitor::new(config.health.clone(), Arc::new(probe))
        .with_progress_gate(gate.clone())
        .with_callback(status_logger())
        .start_offline(offline)
        .spawn();

    watch(&handle, &gate, json).await?;

    handle.shutdown().await;
    info!("canto-watch stopped");
    Ok(())
}

fn status_logger() -> HealthCallback {
    Arc::new(|status: HealthStatus| -> BoxFuture {
        Box::pin(async move {
            match status {
                HealthStatus::Down => warn!("backend is down, maintenance mode"),
                HealthStatus::Up => info!("backend is back up"),
            }
        })
    })
}

async fn watch(handle: &MonitorHandle, gate: &ProgressGate, json: bool) -> anyhow::Result<()> {
    let mut snapshots = handle.subscribe();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut notice = DownNotice::default();

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            changed = snapshots.changed() => {
                if changed.is_err() {
                    warn!("health monitor stopped unexpectedly");
                    return Ok(());
                }
                let snapshot = snapshots.borrow_and_update().clone();
                if notice.observe(snapshot.is_down) {
                    info!("maintenance notice shown, re-checking backend");
                    handle.refetch();
                }
                if json {
                    println!("{}", serde_json::to_string(&snapshot)?);
                } else {
                    debug!(
                        status = %snapshot.status(),
                        unhealthy = snapshot.is_unhealthy,
                        fetching = snapshot.is_fetching,
                        progress_suspended = gate.is_suspended(),
                        "health snapshot"
                    );
                }
            }
            line = lines.next_line(), if stdin_open => {
                let Some(line) = line.context("reading stdin")? else {
                    stdin_open = false;
                    continue;
                };
                if line.trim().is_empty() {
                    continue;
                }
                match parse_control(&line) {
                    Some(Control::Refetch) => handle.refetch(),
                    Some(Control::Online) => handle.set_online(true),
                    Some(Control::Offline) => handle.set_online(false),
                    Some(Control::Focus) => handle.focus(),
                    Some(Control::Quit) => return Ok(()),
                    None => warn!(input = %line.trim(), "unknown command"),
                }
            }
            result = &mut ctrl_c => {
                result.context("listening for ctrl-c")?;
                info!("shutdown signal received");
                return Ok(());
            }
        }
    }
}
