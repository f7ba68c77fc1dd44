mod app;
mod bridge;
mod cli;
mod client;
mod config;
mod handoff;
mod log;
mod paths;
mod poller;
mod sequencer;
mod server;
mod store;
mod ui;

use std::fs::OpenOptions;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing::info;

use cli::Cli;
use config::ProjectConfig;
use log::ExecutionLog;

fn main() -> Result<()> {
    let cli = Cli::parse();

    let cwd = std::env::current_dir().context("failed to get current directory (was it deleted?)")?;
    let log_dir = paths::resolve_log_dir(&cwd);
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("failed to create log directory {}", log_dir.display()))?;

    // Diagnostics go to a file: stderr belongs to the terminal view.
    let filter = match cli.verbose {
        0 => "ocloop=info",
        1 => "ocloop=debug",
        _ => "ocloop=trace",
    };
    let trace_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join("ocloop.log"))
        .context("failed to open trace log file")?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(false)
        .with_writer(Arc::new(trace_file))
        .init();

    let (config, config_path) = ProjectConfig::load(&cwd)?;
    match config_path {
        Some(ref p) => info!("loaded config from {}", p.display()),
        None => info!("no config file found, using defaults"),
    }

    let prompt = std::fs::read_to_string(&cli.prompt)
        .with_context(|| format!("failed to read prompt file {}", cli.prompt.display()))?;
    if prompt.trim().is_empty() {
        bail!("prompt file {} is empty", cli.prompt.display());
    }

    let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
    let exec_log = Arc::new(ExecutionLog::new(
        &log_dir.join(format!("batch-{stamp}.jsonl")),
    )?);
    info!(path = %exec_log.path().display(), "execution log opened");

    app::run(cli, config, prompt, exec_log)
}
