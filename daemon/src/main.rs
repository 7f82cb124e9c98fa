mod config;
mod devices;
mod engine;
mod event;
mod executor;
mod logging;
mod paths;
mod process_monitor;
mod registry;
mod scheduler;
mod startup;
mod status;

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use clap::Parser;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::config::GlobalConfig;
use crate::engine::Engine;
use crate::event::DaemonEvent;
use crate::executor::{DeviceExecutor, SoundVolumeView};
use crate::process_monitor::{SystemProcesses, WatchedNames};

/// Keeps per-application audio output devices pinned.
#[derive(Parser, Debug)]
#[command(name = "audiopin", version)]
struct Args {
    /// Config file to use instead of the one in the app data directory.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Launch AudioPin automatically at login, then exit.
    #[arg(long, conflicts_with = "unregister_startup")]
    register_startup: bool,
    /// Remove AudioPin from the login autostart list, then exit.
    #[arg(long)]
    unregister_startup: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // ── App data directory ────────────────────────────────────────────────────
    let app_dir = match paths::app_data_dir() {
        Ok(dir) => dir,
        Err(e) => {
            eprintln!("Failed to locate app data directory: {e}");
            std::process::exit(1);
        }
    };
    if let Err(e) = std::fs::create_dir_all(&app_dir) {
        eprintln!("Failed to create app data directory {}: {e}", app_dir.display());
        std::process::exit(1);
    }

    logging::init(&paths::log_file_path(&app_dir));

    // ── One-shot commands ─────────────────────────────────────────────────────
    if args.register_startup || args.unregister_startup {
        if let Err(e) = startup::set_autostart(args.register_startup) {
            error!("Failed to update autostart: {e:#}");
            std::process::exit(1);
        }
        return;
    }

    if process_monitor::another_instance_running() {
        warn!("Another instance is already running; exiting");
        return;
    }

    // ── Configuration ─────────────────────────────────────────────────────────
    let config_path = args.config.unwrap_or_else(|| paths::config_file_path(&app_dir));
    let config_path = config::resolve_path(&config_path).unwrap_or_else(|e| {
        error!("{e:#}");
        config_path
    });
    match config::write_default(&config_path) {
        Ok(true) => info!(
            "Created '{}'. Please add your apps to the file; it is reloaded automatically",
            config_path.display()
        ),
        Ok(false) => {}
        Err(e) => error!("{e:#}"),
    }
    let initial_config = config::load_or_default(&config_path).unwrap_or_else(|e| {
        error!("Failed to load config (using defaults): {e:#}");
        config::Config::default()
    });
    let devices = config::discover_devices(initial_config.global.clone()).await;
    if devices.is_empty() {
        warn!("No valid audio devices found; every application will be rejected");
    }

    // ── Engine ────────────────────────────────────────────────────────────────
    let (event_tx, mut event_rx) = mpsc::channel::<DaemonEvent>(64);
    let watched: WatchedNames = Arc::new(RwLock::new(HashSet::new()));

    let mut engine = Engine::new(
        SystemProcesses::new(),
        Box::new(|global: &GlobalConfig| -> Arc<dyn DeviceExecutor> {
            Arc::new(SoundVolumeView::new(global.sound_volume_view_path.clone()))
        }),
        Arc::clone(&watched),
        event_tx.clone(),
    );
    engine.reload(&initial_config, devices);

    let status_path = paths::status_file_path(&app_dir);
    let mut current_status = status::DaemonStatus::new();
    current_status.update_from(engine.registry());
    status::write_status(&status_path, &current_status);

    // ── Background tasks ──────────────────────────────────────────────────────
    tokio::spawn(config::watch_config(config_path, event_tx.clone()));
    {
        let tx = event_tx.clone();
        tokio::spawn(async move {
            process_monitor::run(watched, tx).await;
            warn!("Process watcher stopped; new process starts will not be detected");
        });
    }

    // Graceful shutdown on Ctrl+C.
    {
        let tx = event_tx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let _ = tx.send(DaemonEvent::Shutdown).await;
            }
        });
    }
    spawn_reset_listener(event_tx.clone());
    drop(event_tx);

    info!("audiopin v{} started", env!("CARGO_PKG_VERSION"));

    // ── Event loop ────────────────────────────────────────────────────────────
    while let Some(evt) = event_rx.recv().await {
        let keep_running = engine.handle(evt);
        if !keep_running {
            current_status.state = status::DaemonState::Stopping;
        }
        current_status.update_from(engine.registry());
        status::write_status(&status_path, &current_status);
        if !keep_running {
            break;
        }
    }

    info!("Exit");
}

/// Requests a state reset on SIGHUP (Unix) or Ctrl+Break (Windows).
fn spawn_reset_listener(tx: mpsc::Sender<DaemonEvent>) {
    tokio::spawn(async move {
        #[cfg(unix)]
        let signal = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup());
        #[cfg(windows)]
        let signal = tokio::signal::windows::ctrl_break();

        let mut signal = match signal {
            Ok(s) => s,
            Err(e) => {
                warn!("Reset signal unavailable: {e}");
                return;
            }
        };
        while signal.recv().await.is_some() {
            if tx.send(DaemonEvent::ResetRequested).await.is_err() {
                break;
            }
        }
    });
}
