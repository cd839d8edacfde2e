//! tsmd - game server supervisor daemon
//!
//! Starts the game server, takes a backup every night at midnight, and
//! listens on a Unix control socket for commands from tsmctl.
//!
//! On first run without a config file, writes a default `config.json` and
//! exits so it can be filled in.

use clap::Parser;
use log::info;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};

use tsm::backup::{BackupStore, Backups, SaveTarget, SledStore, ZipCodec};
use tsm::config::{Config, Loaded, DEFAULT_CONFIG_PATH};
use tsm::scheduler::{AutoBackupScheduler, FailurePolicy};
use tsm::server::ControlServer;
use tsm::{logging, Operations, ProcessSupervisor};

#[derive(Parser)]
#[command(name = "tsmd")]
#[command(about = "Game server supervisor daemon")]
#[command(
    long_about = "tsmd runs a game server, serializes restarts, backups, restores and \
    updates behind one lock, and backs up the save every night at midnight."
)]
struct Args {
    /// Config file (created with defaults if missing)
    #[arg(long, short = 'c', default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = match Config::load(&args.config)? {
        Loaded::Existing(config) => config,
        Loaded::Generated(path) => {
            println!("Wrote default config to {}", path.display());
            println!("Set game_exe_path and game_save_path, then start tsmd again");
            return Ok(());
        }
    };
    config.validate()?;

    logging::init(&config.log_dir, config.level_filter()?)?;
    info!("tsmd starting with config {}", args.config.display());

    let store = Arc::new(SledStore::open(&config.database_path)?);
    let save = SaveTarget::detect(&config.game_save_path)?;
    info!(
        "Game save at {} ({})",
        save.path().display(),
        if save.is_dir() { "directory" } else { "file" }
    );
    let backups = Backups::new(
        &config.backups_dir,
        save,
        Arc::clone(&store) as Arc<dyn BackupStore>,
        Arc::new(ZipCodec),
    )?;

    let supervisor =
        ProcessSupervisor::new(&config.game_exe_path).with_stop_grace(config.stop_grace());
    let ops = Arc::new(
        Operations::new(Arc::new(supervisor), Arc::new(backups))
            .with_update_command(config.update_command.clone()),
    );

    // Nothing else can touch the supervisor yet, so no lock needed
    if let Err(e) = ops.supervisor().start().await {
        log::error!("Failed to start game server: {}", e);
        return Err(e.into());
    }

    let scheduler = AutoBackupScheduler::init(Arc::clone(&ops), FailurePolicy::Exit);

    let server = ControlServer::bind(&config.socket_path)?;
    info!("tsmd listening on {}", server.socket_path().display());

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sighup = signal(SignalKind::hangup())?;
    let mut sigquit = signal(SignalKind::quit())?;

    tokio::select! {
        _ = server.serve(Arc::clone(&ops)) => {}
        _ = server.shutdown_requested() => info!("Shutdown requested by tsmctl"),
        _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
        _ = sigint.recv() => info!("Received SIGINT, shutting down"),
        _ = sighup.recv() => info!("Received SIGHUP, shutting down"),
        _ = sigquit.recv() => info!("Received SIGQUIT, shutting down"),
    }

    scheduler.stop().await;
    stop_game_server(&ops).await;

    if let Err(e) = store.flush() {
        log::error!("Failed to flush backup database: {}", e);
    }
    drop(server);

    info!("tsmd stopped");
    log::logger().flush();
    Ok(())
}

/// Wait for any in-flight operation, then stop the game server
async fn stop_game_server(ops: &Operations) {
    let _guard = ops.lock().acquire().await;
    if !ops.supervisor().running() {
        return;
    }
    info!("Stopping game server for shutdown");
    if let Err(e) = ops.supervisor().stop().await {
        log::warn!("Failed to stop game server cleanly: {}", e);
    }
}
