//! Game server process supervision
//!
//! ```text
//!     ┌─────────┐   start    ┌─────────┐
//!     │ Stopped ├───────────►│ Running │
//!     └────▲────┘            └────┬────┘
//!          │ stop: SIGTERM group, │
//!          │ wait, grace delay    │
//!          └──────────────────────┘
//! ```
//!
//! `start` launches the executable and hands the process to a watcher task.
//! `stop` asks the watcher to terminate it and blocks until the process has
//! exited and the grace delay has passed. The `running` and `status` fields
//! have their own locks so reads never wait behind an in-flight start/stop.

mod launcher;
#[cfg(test)]
pub(crate) mod testing;

pub use launcher::{ExitInfo, Launcher, ProcessGroupLauncher};

use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;

/// Wait after the process exits before reporting it stopped
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(3);

const STATUS_NOT_STARTED: &str = "Hasn't started yet";

/// Observable state, written by the supervisor and its watcher
struct Shared {
    running: Mutex<bool>,
    status: Mutex<String>,
}

impl Shared {
    fn running(&self) -> bool {
        *self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_running(&self, running: bool) {
        *self.running.lock().unwrap_or_else(PoisonError::into_inner) = running;
    }

    fn status(&self) -> String {
        self.status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_status(&self, status: impl Into<String>) {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner) = status.into();
    }
}

/// Supervisor's side of a running watcher task
struct Watch {
    stop_tx: oneshot::Sender<()>,
    done_rx: oneshot::Receiver<WatchOutcome>,
}

/// What the watcher saw when the process went away
struct WatchOutcome {
    /// Exit followed a stop request
    requested: bool,
    exit: io::Result<ExitInfo>,
}

/// Supervises a single game server process
pub struct ProcessSupervisor<L: Launcher = ProcessGroupLauncher> {
    command: PathBuf,
    launcher: Arc<L>,
    stop_grace: Duration,
    shared: Arc<Shared>,
    /// Serializes start/stop and holds the live watcher, if any
    lifecycle: tokio::sync::Mutex<Option<Watch>>,
}

impl ProcessSupervisor<ProcessGroupLauncher> {
    /// Supervisor for `command`, launched in its own process group
    pub fn new(command: impl Into<PathBuf>) -> Self {
        Self::with_launcher(command, ProcessGroupLauncher)
    }
}

impl<L: Launcher> ProcessSupervisor<L> {
    pub fn with_launcher(command: impl Into<PathBuf>, launcher: L) -> Self {
        Self {
            command: command.into(),
            launcher: Arc::new(launcher),
            stop_grace: DEFAULT_STOP_GRACE,
            shared: Arc::new(Shared {
                running: Mutex::new(false),
                status: Mutex::new(STATUS_NOT_STARTED.to_string()),
            }),
            lifecycle: tokio::sync::Mutex::new(None),
        }
    }

    /// Override the post-exit grace delay
    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    pub fn command(&self) -> &Path {
        &self.command
    }

    pub fn stop_grace(&self) -> Duration {
        self.stop_grace
    }

    /// Whether the game server is running
    pub fn running(&self) -> bool {
        self.shared.running()
    }

    /// Human-readable status for display
    pub fn status(&self) -> String {
        self.shared.status()
    }

    /// Launch the game server.
    ///
    /// Returns once the process has been spawned; a watcher task takes
    /// ownership of it from there.
    pub async fn start(&self) -> Result<(), SupervisorError> {
        let mut slot = self.lifecycle.lock().await;

        if self.running() {
            log::error!("Tried to start game server while it is already running");
            return Err(SupervisorError::AlreadyRunning);
        }

        // Left over from an out-of-band exit; that watcher has already finished
        slot.take();

        self.shared.set_status("Starting");
        let handle = match self.launcher.launch(&self.command) {
            Ok(handle) => handle,
            Err(e) => {
                log::error!("Failed to launch {}: {}", self.command.display(), e);
                self.shared.set_status(format!("Failed to start: {}", e));
                return Err(SupervisorError::Launch {
                    command: self.command.clone(),
                    source: e,
                });
            }
        };

        let pid = self.launcher.pid(&handle);
        self.shared.set_running(true);
        self.shared.set_status(match pid {
            Some(pid) => format!("Running (PID {})", pid),
            None => "Running".to_string(),
        });
        log::info!(
            "Started {} (PID {})",
            self.command.display(),
            pid.map_or_else(|| "?".to_string(), |p| p.to_string())
        );

        let (stop_tx, stop_rx) = oneshot::channel();
        let (done_tx, done_rx) = oneshot::channel();
        tokio::spawn(watch_process(
            Arc::clone(&self.launcher),
            handle,
            Arc::clone(&self.shared),
            self.stop_grace,
            stop_rx,
            done_tx,
        ));
        log::debug!("Started watcher task");

        *slot = Some(Watch { stop_tx, done_rx });
        Ok(())
    }

    /// Stop the game server.
    ///
    /// Blocks until the process group has been signalled, the process has
    /// exited, and the grace delay has passed. Must not be abandoned midway.
    pub async fn stop(&self) -> Result<(), SupervisorError> {
        let mut slot = self.lifecycle.lock().await;
        log::debug!("Stopping game server");

        if !self.running() {
            log::error!("Tried to stop game server while it is not running");
            return Err(SupervisorError::NotRunning);
        }
        let Some(watch) = slot.take() else {
            log::error!("Game server marked running without a watcher");
            return Err(SupervisorError::NotRunning);
        };

        self.shared.set_status("Stopping");

        // The watcher may already have seen the process exit on its own
        let _ = watch.stop_tx.send(());
        log::debug!("Sent stop request to watcher");

        let outcome = match watch.done_rx.await {
            Ok(outcome) => outcome,
            Err(_) => {
                self.shared.set_running(false);
                self.shared.set_status("Lost track of process");
                return Err(SupervisorError::UnexpectedExit(
                    "watcher ended without reporting an exit".to_string(),
                ));
            }
        };
        log::debug!("Received exit report from watcher");
        if !outcome.requested {
            log::warn!("Game server had already exited before the stop request");
        }

        match outcome.exit {
            Ok(info) if info.is_clean_stop() => Ok(()),
            Ok(info) => Err(SupervisorError::UnexpectedExit(info.to_string())),
            Err(e) => Err(SupervisorError::UnexpectedExit(format!(
                "waiting for exit failed: {}",
                e
            ))),
        }
    }
}

/// Own the process until it exits, terminating it on request.
///
/// A dropped stop sender (supervisor gone) counts as a stop request.
async fn watch_process<L: Launcher>(
    launcher: Arc<L>,
    mut handle: L::Handle,
    shared: Arc<Shared>,
    grace: Duration,
    mut stop_rx: oneshot::Receiver<()>,
    done_tx: oneshot::Sender<WatchOutcome>,
) {
    let (requested, exit) = tokio::select! {
        exit = launcher.wait(&mut handle) => (false, exit),
        _ = &mut stop_rx => {
            log::debug!("Received stop request, sending SIGTERM");
            if let Err(e) = launcher.terminate(&handle) {
                log::error!("Failed to deliver SIGTERM: {}", e);
            }
            (true, launcher.wait(&mut handle).await)
        }
    };

    let status = match &exit {
        Ok(info) if requested => {
            log::info!("Game server stopped ({})", info);
            if info.is_clean_stop() {
                "Stopped".to_string()
            } else {
                format!("Stopped ({})", info)
            }
        }
        Ok(info) => {
            log::warn!("Game server exited on its own ({})", info);
            format!("Exited unexpectedly ({})", info)
        }
        Err(e) => {
            log::error!("Failed to wait for game server: {}", e);
            format!("Lost track of process: {}", e)
        }
    };

    // Let the OS finish releasing files and sockets before anyone touches the save
    tokio::time::sleep(grace).await;

    shared.set_status(status);
    shared.set_running(false);
    log::debug!("Watcher finished");

    // Nobody is listening if the exit was out-of-band and no stop followed
    let _ = done_tx.send(WatchOutcome { requested, exit });
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("Game server is already running")]
    AlreadyRunning,

    #[error("Game server is not running")]
    NotRunning,

    #[error("Failed to launch {}: {}", .command.display(), .source)]
    Launch {
        command: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Game server exited unexpectedly: {0}")]
    UnexpectedExit(String),
}
