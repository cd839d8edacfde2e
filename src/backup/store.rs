//! Sled-backed backup record store

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::{BackupRecord, BackupStore};

/// Record as persisted; the id lives in the key
#[derive(Debug, Serialize, Deserialize)]
struct StoredBackup {
    path: PathBuf,
    name: String,
    comment: String,
    created_at: i64,
}

/// Backup records keyed by big-endian id, so key order is creation order
pub struct SledStore {
    db: sled::Db,
    backups: sled::Tree,
}

impl SledStore {
    /// Open (or create) the database at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        log::info!("Opening backup database at {}", path.display());
        Self::from_db(sled::open(path)?)
    }

    /// Throwaway database, removed on drop
    pub fn temporary() -> Result<Self, StoreError> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: sled::Db) -> Result<Self, StoreError> {
        let backups = db.open_tree("backups")?;
        Ok(Self { db, backups })
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }
}

fn decode(key: &[u8], value: &[u8]) -> Result<BackupRecord, StoreError> {
    let id = <[u8; 8]>::try_from(key)
        .map(u64::from_be_bytes)
        .map_err(|_| StoreError::BadKey)?;
    let stored: StoredBackup = rmp_serde::from_slice(value)?;
    Ok(BackupRecord {
        id,
        path: stored.path,
        name: stored.name,
        comment: stored.comment,
        created_at: stored.created_at,
    })
}

impl BackupStore for SledStore {
    fn create_record(&self, path: &Path, name: &str, comment: &str) -> Result<u64, StoreError> {
        let id = self.db.generate_id()?;
        let stored = StoredBackup {
            path: path.to_path_buf(),
            name: name.to_string(),
            comment: comment.to_string(),
            created_at: chrono::Local::now().timestamp(),
        };
        self.backups
            .insert(id.to_be_bytes(), rmp_serde::to_vec_named(&stored)?)?;
        log::debug!("Stored backup record {} ({})", id, name);
        Ok(id)
    }

    fn list_records(&self) -> Result<Vec<BackupRecord>, StoreError> {
        self.backups
            .iter()
            .rev()
            .map(|entry| {
                let (key, value) = entry?;
                decode(&key, &value)
            })
            .collect()
    }

    fn find_record_path(&self, id: u64) -> Result<Option<PathBuf>, StoreError> {
        match self.backups.get(id.to_be_bytes())? {
            Some(value) => Ok(Some(decode(&id.to_be_bytes(), &value)?.path)),
            None => Ok(None),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Db(#[from] sled::Error),

    #[error("Failed to encode record: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("Failed to decode record: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("Malformed record key")]
    BadKey,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_find() {
        let store = SledStore::temporary().unwrap();
        let id = store
            .create_record(Path::new("backups/a.zip"), "a.zip", "before update")
            .unwrap();

        assert_eq!(
            store.find_record_path(id).unwrap(),
            Some(PathBuf::from("backups/a.zip"))
        );
        assert_eq!(store.find_record_path(id + 1000).unwrap(), None);
    }

    #[test]
    fn test_list_newest_first() {
        let store = SledStore::temporary().unwrap();
        assert!(store.list_records().unwrap().is_empty());

        for name in ["first.zip", "second.zip", "third.zip"] {
            store
                .create_record(&Path::new("backups").join(name), name, "")
                .unwrap();
        }

        let names: Vec<String> = store
            .list_records()
            .unwrap()
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(names, ["third.zip", "second.zip", "first.zip"]);
    }

    #[test]
    fn test_ids_increase() {
        let store = SledStore::temporary().unwrap();
        let a = store.create_record(Path::new("a.zip"), "a.zip", "").unwrap();
        let b = store.create_record(Path::new("b.zip"), "b.zip", "").unwrap();
        assert!(b > a);

        let records = store.list_records().unwrap();
        assert_eq!(records[0].id, b);
        assert_eq!(records[1].comment, "");
    }
}
