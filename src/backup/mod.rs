//! Save-state backups
//!
//! A backup is an archive of the game's save directory (or single save
//! file) in the backups directory, plus a record in a [`BackupStore`].
//! Everything here assumes the game server is stopped; callers go through
//! [`crate::operations::Operations`] to guarantee that.

mod archive;
mod store;

pub use archive::{ArchiveCodec, ArchiveError, ZipCodec};
pub use store::{SledStore, StoreError};

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, TimeZone};
use serde::{Deserialize, Serialize};

/// Point-in-time snapshot of the save state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    /// Opaque id, increasing in creation order
    pub id: u64,
    /// Archive location
    pub path: PathBuf,
    /// Display name derived from the creation time
    pub name: String,
    pub comment: String,
    /// Creation time (unix seconds)
    pub created_at: i64,
}

/// Persistence for backup records
pub trait BackupStore: Send + Sync {
    /// Insert a record and return its id
    fn create_record(&self, path: &Path, name: &str, comment: &str) -> Result<u64, StoreError>;

    /// All records, newest first
    fn list_records(&self) -> Result<Vec<BackupRecord>, StoreError>;

    /// Archive path for `id`, or `None` if there is no such record
    fn find_record_path(&self, id: u64) -> Result<Option<PathBuf>, StoreError>;
}

/// The game's save location
///
/// Whether it is a directory or a single file is checked once, at startup.
#[derive(Debug, Clone)]
pub struct SaveTarget {
    path: PathBuf,
    is_dir: bool,
}

impl SaveTarget {
    pub fn detect(path: impl Into<PathBuf>) -> Result<Self, BackupError> {
        let path = path.into();
        let metadata = fs::metadata(&path).map_err(|e| BackupError::SaveMissing {
            path: path.clone(),
            source: e,
        })?;
        Ok(Self {
            is_dir: metadata.is_dir(),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_dir(&self) -> bool {
        self.is_dir
    }

    /// Directory holding the save; restores extract into it
    pub fn parent_dir(&self) -> PathBuf {
        self.path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Delete the current save so a restore fully replaces it
    fn wipe(&self) -> io::Result<()> {
        let result = if self.is_dir {
            fs::remove_dir_all(&self.path)
        } else {
            fs::remove_file(&self.path)
        };
        match result {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }
}

/// Archive file name for a backup taken at `time`
pub fn archive_name<Tz: TimeZone>(time: &DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    format!("{}.zip", time.format("%Y-%m-%d_%H-%M-%S"))
}

/// Creates, lists and restores backups
pub struct Backups {
    dir: PathBuf,
    save: SaveTarget,
    store: Arc<dyn BackupStore>,
    codec: Arc<dyn ArchiveCodec>,
}

impl Backups {
    /// Creates the backups directory if needed
    pub fn new(
        dir: impl Into<PathBuf>,
        save: SaveTarget,
        store: Arc<dyn BackupStore>,
        codec: Arc<dyn ArchiveCodec>,
    ) -> Result<Self, BackupError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            save,
            store,
            codec,
        })
    }

    /// Snapshot the save and record it. Assumes the game server is stopped.
    pub fn create(&self, comment: &str) -> Result<u64, BackupError> {
        if !self.save.path.exists() {
            return Err(BackupError::SaveMissing {
                path: self.save.path.clone(),
                source: io::Error::from(io::ErrorKind::NotFound),
            });
        }

        let (name, path) = self.next_archive_path(&chrono::Local::now());
        if let Err(e) = self.codec.snapshot(&self.save.path, self.save.is_dir, &path) {
            discard_archive(&path);
            return Err(e.into());
        }

        match self.store.create_record(&path, &name, comment) {
            Ok(id) => {
                log::info!("Created backup {} ({}) comment={:?}", id, name, comment);
                Ok(id)
            }
            Err(e) => {
                // No record points at it
                discard_archive(&path);
                Err(e.into())
            }
        }
    }

    /// Two backups in the same second get `-1`, `-2`, ... suffixes
    fn next_archive_path<Tz: TimeZone>(&self, time: &DateTime<Tz>) -> (String, PathBuf)
    where
        Tz::Offset: std::fmt::Display,
    {
        let name = archive_name(time);
        let path = self.dir.join(&name);
        if !path.exists() {
            return (name, path);
        }
        let stem = name.trim_end_matches(".zip").to_string();
        (1..)
            .map(|n| format!("{}-{}.zip", stem, n))
            .map(|name| {
                let path = self.dir.join(&name);
                (name, path)
            })
            .find(|(_, path)| !path.exists())
            .unwrap_or((name, path))
    }

    /// Replace the save with the contents of `archive`. Assumes the game server is stopped.
    pub fn restore(&self, archive: &Path) -> Result<(), BackupError> {
        if !archive.exists() {
            return Err(BackupError::ArchiveMissing(archive.to_path_buf()));
        }

        self.save.wipe()?;
        self.codec.restore(archive, &self.save.parent_dir())?;

        log::info!("Restored {} from {}", self.save.path.display(), archive.display());
        Ok(())
    }

    /// All backups, newest first
    pub fn list(&self) -> Result<Vec<BackupRecord>, BackupError> {
        Ok(self.store.list_records()?)
    }

    /// Archive path of backup `id`
    pub fn path_of(&self, id: u64) -> Result<PathBuf, BackupError> {
        self.store
            .find_record_path(id)?
            .ok_or(BackupError::NotFound(id))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error("Game save {} is not accessible: {}", .path.display(), .source)]
    SaveMissing {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Backup {0} not found")]
    NotFound(u64),

    #[error("Backup archive {} does not exist", .0.display())]
    ArchiveMissing(PathBuf),

    #[error("Archive error: {0}")]
    Archive(#[from] ArchiveError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Remove an archive that never got a record, if it was written at all
fn discard_archive(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => log::warn!("Removed unrecorded archive {}", path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => log::warn!("Failed to remove unrecorded archive {}: {}", path.display(), e),
    }
}
