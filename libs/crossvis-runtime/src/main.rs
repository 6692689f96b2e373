// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! crossvis Runtime Binary
//!
//! Runs the host of a pair. The host re-launches this same binary with the
//! hidden role marker to get its worker. Exit codes: 0 when the window is
//! closed, 2 when the platform cannot share resources, 1 for anything else.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use crossvis::config::WORKER_ROLE_MARKER;
use crossvis::{
    HeadlessWindow, HostController, MemfdBridge, PairConfig, PairSettings, Role, ShareError,
    WorkerController,
};
use tracing_appender::non_blocking::WorkerGuard;

const EXIT_FAILURE: u8 = 1;
const EXIT_UNSUPPORTED: u8 = 2;

// ---------------------------------------------------------------------------
// CLI arguments
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "crossvis-runtime")]
#[command(author, version, about = "Host/worker pair sharing one live composition resource", long_about = None)]
struct Args {
    /// TOML settings file (CLI flags override it)
    #[arg(long, value_name = "PATH", env = "CROSSVIS_CONFIG")]
    config: Option<PathBuf>,

    /// Pair id (generated if not specified)
    #[arg(long, env = "CROSSVIS_PAIR_ID")]
    pair_id: Option<String>,

    /// Directory holding the handshake sockets
    #[arg(long, value_name = "DIR", env = "CROSSVIS_RUNTIME_DIR")]
    runtime_dir: Option<PathBuf>,

    /// How long each handshake step may take
    #[arg(long, value_name = "MS", env = "CROSSVIS_HANDSHAKE_TIMEOUT_MS")]
    handshake_timeout_ms: Option<u64>,

    /// Initial window width
    #[arg(long)]
    width: Option<u32>,

    /// Initial window height
    #[arg(long)]
    height: Option<u32>,

    /// Also write logs to this file
    #[arg(long, value_name = "PATH")]
    log_file: Option<PathBuf>,

    /// Run as the worker of an existing pair
    #[arg(long = "crossvis-worker", hide = true)]
    worker: bool,
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

fn setup_logging(log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
    use tracing_subscriber::prelude::*;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    let (file_layer, guard) = match log_file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let file_name = path
                .file_name()
                .with_context(|| format!("Log file path has no file name: {}", path.display()))?;
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;

            let file_appender = tracing_appender::rolling::never(dir, file_name);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();

    Ok(guard)
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Defaults, then the settings file, then flags and `CROSSVIS_*` variables.
fn build_config(args: &Args, role: Role) -> Result<PairConfig> {
    let mut config = PairConfig::generate();

    if let Some(path) = &args.config {
        let settings = PairSettings::load(path)
            .with_context(|| format!("Failed to load settings: {}", path.display()))?;
        config = config.apply_settings(settings);
    }

    if let Some(pair_id) = &args.pair_id {
        config.pair_id = pair_id.clone();
    } else if role == Role::Worker && args.config.is_none() {
        anyhow::bail!("Worker launched without a pair id");
    }
    if let Some(dir) = &args.runtime_dir {
        config.runtime_dir = dir.clone();
    }
    if let Some(ms) = args.handshake_timeout_ms {
        config.handshake_timeout = Duration::from_millis(ms);
    }
    let (width, height) = config.window_size;
    config.window_size = (args.width.unwrap_or(width), args.height.unwrap_or(height));

    // The worker sees the same flags the host was given.
    config.worker_args = std::env::args()
        .skip(1)
        .filter(|arg| arg.as_str() != WORKER_ROLE_MARKER)
        .collect();

    config.validate()?;
    Ok(config)
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> ExitCode {
    let args = Args::parse();

    let _log_guard = match setup_logging(args.log_file.as_deref()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("crossvis-runtime: {:#}", e);
            return ExitCode::from(EXIT_FAILURE);
        }
    };

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if let Some(ShareError::Unsupported(reason)) = e.downcast_ref::<ShareError>() {
                eprintln!(
                    "crossvis-runtime: this platform cannot share composition resources: {}",
                    reason
                );
                return ExitCode::from(EXIT_UNSUPPORTED);
            }
            tracing::error!("{:#}", e);
            ExitCode::from(EXIT_FAILURE)
        }
    }
}

fn run(args: Args) -> Result<()> {
    let role = if args.worker { Role::Worker } else { Role::Host };
    let config = build_config(&args, role)?;

    let (width, height) = config.window_size;
    let window = HeadlessWindow::new(width, height)
        .close_on_signals()
        .context("Failed to install close signal handlers")?;
    let bridge = MemfdBridge::from_config(&config);

    tracing::info!(
        %role,
        pair_id = %config.pair_id,
        runtime_dir = %config.runtime_dir.display(),
        "Starting crossvis runtime"
    );

    match role {
        Role::Host => {
            let mut host = HostController::new(config, bridge, window);
            host.run_with(|host| {
                println!(
                    "paired host={} worker={} pair={}",
                    std::process::id(),
                    host.worker_pid().unwrap_or_default(),
                    host.config().pair_id
                );
            })
            .context("Host failed")?;
        }
        Role::Worker => {
            WorkerController::new(config, bridge, window)
                .run()
                .context("Worker failed")?;
        }
    }

    Ok(())
}
