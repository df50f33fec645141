//! VPS Manager - Provision and manage LXC containers through text commands
//!
//! Users buy plans with credits, admins create, resize and inspect
//! containers, and a background guard force-stops everything when the host
//! CPU runs hot.

#![allow(dead_code)] // Several query methods are part of the public API for other transports

mod core;
mod persistence;
mod surface;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use single_instance::SingleInstance;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::core::{AppState, LxcRuntime, Settings, SystemCpuSampler};
use crate::surface::{spawn_event_log, Console, Dispatcher};

/// Application name constant
pub const APP_NAME: &str = "vps-manager";

/// Application version
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser, Debug)]
#[command(name = APP_NAME, version, about = "Provision and manage LXC containers (VPS)")]
struct Args {
    /// Directory holding user_data.json, vps_data.json and admin_data.json
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Path to the settings file
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Start with the CPU guard disabled
    #[arg(long)]
    no_cpu_guard: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let settings_path = args
        .settings
        .clone()
        .unwrap_or_else(Settings::default_settings_path);
    let mut settings = Settings::load(&settings_path)?;
    if let Some(dir) = args.data_dir {
        settings.data_directory = Some(dir);
    }
    if args.no_cpu_guard {
        settings.cpu_guard_enabled = false;
    }

    // Initialize logging
    init_logging(settings.debug_logging);

    info!("{} v{} starting...", APP_NAME, APP_VERSION);

    // Two managers would race on whole-file rewrites of the same tables
    let instance = SingleInstance::new(APP_NAME)
        .map_err(|e| anyhow::anyhow!("Failed to create single instance lock: {}", e))?;
    if !instance.is_single() {
        error!("Another instance of {} is already running!", APP_NAME);
        return Ok(());
    }

    let runtime = Arc::new(LxcRuntime::new(settings.runtime_binary.clone()));
    let state = AppState::new(settings, runtime)?;
    info!("Data directory: {:?}", state.settings.get_data_directory());

    let (shutdown_tx, shutdown_rx) = watch::channel(());

    let event_log = spawn_event_log(state.manager.subscribe());
    let guard = tokio::spawn(
        state
            .cpu_guard(Box::new(SystemCpuSampler::new()))
            .run(shutdown_rx.clone()),
    );

    let console = Console::new(Arc::new(Dispatcher::from_state(&state)));
    let outcome = tokio::select! {
        result = console.run(shutdown_rx) => match result {
            Ok(()) => {
                info!("Console closed, running until interrupted");
                tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl+C")
            }
            Err(e) => Err(e),
        },
        result = tokio::signal::ctrl_c() => {
            info!("Interrupt received");
            result.context("Failed to listen for Ctrl+C")
        }
    };

    if shutdown_tx.send(()).is_err() {
        info!("Background tasks already stopped");
    }
    if let Err(e) = guard.await {
        error!("CPU guard task failed: {}", e);
    }
    event_log.abort();

    if let Err(e) = state.flush() {
        error!("Failed to flush data on shutdown: {:#}", e);
    }

    info!("{} shutting down", APP_NAME);
    outcome
}

/// Initialize the logging system
fn init_logging(debug: bool) {
    let default_level = if debug {
        "vps_manager=debug"
    } else {
        "vps_manager=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    // Replies go to stdout, logs to stderr
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
