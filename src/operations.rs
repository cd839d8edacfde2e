//! Composite operations on the game server
//!
//! Anything that needs the game server offline (restart, backup, restore,
//! update) runs as one sequence under the [`ExclusiveLock`]:
//!
//! ```text
//!   acquire ──► stop ──► mutate ──► start ──► release
//! ```
//!
//! The control socket and the automatic backup scheduler share a single
//! [`Operations`] instance, so no two sequences ever interleave. The first
//! failing step aborts the rest and its error is returned; nothing is
//! retried, so the server stays in whatever state the last successful step
//! left it (usually stopped).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Command;
use tokio::sync::{Mutex, MutexGuard};

use crate::backup::{BackupError, BackupRecord, Backups};
use crate::supervisor::{ExitInfo, Launcher, ProcessGroupLauncher, ProcessSupervisor, SupervisorError};

/// Gate held for the whole stop→mutate→start sequence. Not reentrant.
#[derive(Default)]
pub struct ExclusiveLock {
    inner: Mutex<()>,
}

/// Held while an exclusive operation runs; dropping it releases the lock
pub struct OperationGuard<'a> {
    _guard: MutexGuard<'a, ()>,
}

impl ExclusiveLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until no other operation holds the lock
    pub async fn acquire(&self) -> OperationGuard<'_> {
        OperationGuard {
            _guard: self.inner.lock().await,
        }
    }

    /// Like [`acquire`](Self::acquire), giving up after `timeout`
    pub async fn acquire_timeout(&self, timeout: Duration) -> Result<OperationGuard<'_>, LockTimeout> {
        match tokio::time::timeout(timeout, self.inner.lock()).await {
            Ok(guard) => Ok(OperationGuard { _guard: guard }),
            Err(_) => Err(LockTimeout(timeout)),
        }
    }

    /// Whether an operation currently holds the lock
    pub fn is_held(&self) -> bool {
        self.inner.try_lock().is_err()
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Timed out after {0:?} waiting for another operation to finish")]
pub struct LockTimeout(pub Duration);

/// Restart, backup, restore and update, serialized by one lock
pub struct Operations<L: Launcher = ProcessGroupLauncher> {
    supervisor: Arc<ProcessSupervisor<L>>,
    backups: Arc<Backups>,
    update_command: Option<String>,
    lock: ExclusiveLock,
}

impl<L: Launcher> Operations<L> {
    pub fn new(supervisor: Arc<ProcessSupervisor<L>>, backups: Arc<Backups>) -> Self {
        Self {
            supervisor,
            backups,
            update_command: None,
            lock: ExclusiveLock::new(),
        }
    }

    /// Command run by [`update`](Self::update); blank disables updates
    pub fn with_update_command(mut self, command: impl Into<String>) -> Self {
        let command = command.into();
        self.update_command = (!command.trim().is_empty()).then_some(command);
        self
    }

    pub fn supervisor(&self) -> &ProcessSupervisor<L> {
        &self.supervisor
    }

    pub fn lock(&self) -> &ExclusiveLock {
        &self.lock
    }

    /// Stop and start the game server
    pub async fn restart(&self) -> Result<(), OperationError> {
        let _guard = self.lock.acquire().await;
        log::info!("Restarting game server");

        self.supervisor.stop().await?;
        log::debug!("Stopped game server");
        self.supervisor.start().await?;
        log::debug!("Started game server");
        Ok(())
    }

    /// Stop, snapshot the save with `comment`, start. Returns the backup id.
    pub async fn backup(&self, comment: &str) -> Result<u64, OperationError> {
        let _guard = self.lock.acquire().await;
        log::info!("Backing up game save");

        self.supervisor.stop().await?;
        let comment = comment.to_string();
        let id = self.with_backups(move |b| b.create(&comment)).await?;
        self.supervisor.start().await?;
        Ok(id)
    }

    /// Stop, replace the save with backup `id`, start
    pub async fn restore(&self, id: u64) -> Result<(), OperationError> {
        // Unknown ids fail before the server is touched
        let archive = self.backup_path(id).await?;

        let _guard = self.lock.acquire().await;
        log::info!("Restoring backup {} from {}", id, archive.display());

        self.supervisor.stop().await?;
        self.with_backups(move |b| b.restore(&archive)).await?;
        self.supervisor.start().await?;
        Ok(())
    }

    /// Stop, run the update command, start.
    ///
    /// A failed update still restarts the server; the update error is
    /// returned once the start succeeds.
    pub async fn update(&self) -> Result<(), OperationError> {
        let command = self
            .update_command
            .clone()
            .ok_or(UpdateError::NotConfigured)?;

        let _guard = self.lock.acquire().await;
        log::info!("Updating game server");

        self.supervisor.stop().await?;
        let updated = run_update(&command).await;
        if let Err(e) = &updated {
            log::error!("Failed to update game server: {}", e);
        }
        self.supervisor.start().await?;

        Ok(updated?)
    }

    /// All backups, newest first. Does not take the lock.
    pub async fn list_backups(&self) -> Result<Vec<BackupRecord>, OperationError> {
        self.with_backups(|b| b.list()).await
    }

    /// Archive path for backup `id`. Does not take the lock.
    pub async fn backup_path(&self, id: u64) -> Result<PathBuf, OperationError> {
        self.with_backups(move |b| b.path_of(id)).await
    }

    /// Run file and store work on the blocking pool
    async fn with_backups<T, F>(&self, f: F) -> Result<T, OperationError>
    where
        F: FnOnce(&Backups) -> Result<T, BackupError> + Send + 'static,
        T: Send + 'static,
    {
        let backups = Arc::clone(&self.backups);
        Ok(tokio::task::spawn_blocking(move || f(&backups)).await??)
    }
}

/// Run the update command to completion
async fn run_update(command: &str) -> Result<(), UpdateError> {
    let args = shlex::split(command).ok_or_else(|| UpdateError::InvalidCommand(command.to_string()))?;
    let (program, args) = args
        .split_first()
        .ok_or_else(|| UpdateError::InvalidCommand(command.to_string()))?;

    log::info!("Running update command: {}", command);
    let status = Command::new(program).args(args).status().await?;
    if !status.success() {
        return Err(UpdateError::Failed(ExitInfo::from(status)));
    }
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum UpdateError {
    #[error("Update command not set")]
    NotConfigured,

    #[error("Invalid update command: {0}")]
    InvalidCommand(String),

    #[error("Failed to run update command: {0}")]
    Io(#[from] std::io::Error),

    #[error("Update command failed ({0})")]
    Failed(ExitInfo),
}

#[derive(Debug, thiserror::Error)]
pub enum OperationError {
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error(transparent)]
    Backup(#[from] BackupError),

    #[error(transparent)]
    Update(#[from] UpdateError),

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lock_excludes() {
        let lock = ExclusiveLock::new();
        assert!(!lock.is_held());

        let guard = lock.acquire().await;
        assert!(lock.is_held());
        let err = lock
            .acquire_timeout(Duration::from_millis(50))
            .await
            .err()
            .unwrap();
        assert_eq!(err.0, Duration::from_millis(50));

        drop(guard);
        assert!(!lock.is_held());
        let _guard = lock.acquire_timeout(Duration::from_millis(50)).await.unwrap();
    }

    #[tokio::test]
    async fn test_lock_waiter_proceeds_after_release() {
        let lock = Arc::new(ExclusiveLock::new());
        let guard = lock.acquire().await;

        let waiter = {
            let lock = Arc::clone(&lock);
            tokio::spawn(async move {
                let _guard = lock.acquire().await;
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn test_run_update() {
        run_update("/bin/true").await.unwrap();
        run_update("/bin/sh -c 'exit 0'").await.unwrap();

        let err = run_update("/bin/sh -c 'exit 4'").await.unwrap_err();
        assert!(matches!(err, UpdateError::Failed(ExitInfo::Exited(4))));

        let err = run_update("   ").await.unwrap_err();
        assert!(matches!(err, UpdateError::InvalidCommand(_)));

        let err = run_update("/nonexistent/updater --now").await.unwrap_err();
        assert!(matches!(err, UpdateError::Io(_)));
    }
}
