//! Firmware file records.
//!
//! The binary itself lives on disk under the media root; the record keeps
//! its path relative to that root.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::database::blocking;
use crate::{Error, Result};

// Firmware table: key = file id, value = FirmwareFile (JSON)
pub(crate) const FIRMWARE_TABLE: TableDefinition<&str, &str> = TableDefinition::new("firmware");

/// Uploaded firmware file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareFile {
    pub id: String,
    pub version: String,
    /// Path relative to the media root, with `/` separators.
    pub path: String,
    pub uploaded_at: DateTime<Utc>,
}

impl FirmwareFile {
    /// Location of the binary under `media_root`.
    pub fn disk_path(&self, media_root: &Path) -> PathBuf {
        media_root.join(&self.path)
    }
}

/// Reject absolute paths and parent traversal.
fn validate_relative(path: &str) -> Result<()> {
    let p = Path::new(path);
    let ok = !path.is_empty()
        && p.components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if ok {
        Ok(())
    } else {
        Err(Error::InvalidInput(format!(
            "firmware path must be relative to the media root: {}",
            path
        )))
    }
}

/// Firmware store backed by redb.
#[derive(Clone)]
pub struct FirmwareStore {
    db: Arc<Database>,
}

impl FirmwareStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Record a firmware file already placed under the media root.
    pub async fn create(&self, version: &str, path: &str) -> Result<FirmwareFile> {
        if version.trim().is_empty() {
            return Err(Error::InvalidInput("firmware version is empty".to_string()));
        }
        validate_relative(path)?;

        let file = FirmwareFile {
            id: Uuid::new_v4().to_string(),
            version: version.to_string(),
            path: path.replace('\\', "/"),
            uploaded_at: Utc::now(),
        };
        let db = self.db.clone();
        blocking(move || {
            let json = serde_json::to_string(&file)?;
            let write_txn = db.begin_write()?;
            {
                let mut table = write_txn.open_table(FIRMWARE_TABLE)?;
                table.insert(file.id.as_str(), json.as_str())?;
            }
            write_txn.commit()?;
            Ok(file)
        })
        .await
    }

    pub async fn get(&self, id: &str) -> Result<Option<FirmwareFile>> {
        let db = self.db.clone();
        let id = id.to_string();
        blocking(move || {
            let read_txn = db.begin_read()?;
            let table = read_txn.open_table(FIRMWARE_TABLE)?;
            match table.get(id.as_str())? {
                Some(value) => Ok(Some(serde_json::from_str(value.value())?)),
                None => Ok(None),
            }
        })
        .await
    }

    /// All firmware files, newest first.
    pub async fn list(&self) -> Result<Vec<FirmwareFile>> {
        let db = self.db.clone();
        let mut files: Vec<FirmwareFile> = blocking(move || {
            let read_txn = db.begin_read()?;
            let table = read_txn.open_table(FIRMWARE_TABLE)?;
            let mut files = Vec::new();
            for item in table.iter()? {
                let (_, value) = item?;
                files.push(serde_json::from_str(value.value())?);
            }
            Ok(files)
        })
        .await?;
        files.sort_by(|a, b| b.uploaded_at.cmp(&a.uploaded_at));
        Ok(files)
    }

    /// Delete a record together with its binary under `media_root`.
    ///
    /// A binary that is already gone is not an error.
    pub async fn remove(&self, id: &str, media_root: &Path) -> Result<Option<FirmwareFile>> {
        let Some(file) = self.get(id).await? else {
            return Ok(None);
        };

        let disk_path = file.disk_path(media_root);
        match tokio::fs::remove_file(&disk_path).await {
            Ok(()) => tracing::info!(path = %disk_path.display(), "firmware binary removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path = %disk_path.display(), "firmware binary already missing")
            }
            Err(e) => return Err(e.into()),
        }

        let db = self.db.clone();
        let key = file.id.clone();
        blocking(move || {
            let write_txn = db.begin_write()?;
            {
                let mut table = write_txn.open_table(FIRMWARE_TABLE)?;
                table.remove(key.as_str())?;
            }
            write_txn.commit()?;
            Ok(())
        })
        .await?;
        Ok(Some(file))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::temp_database;

    #[tokio::test]
    async fn test_create_and_list() {
        let (_dir, db) = temp_database();
        let store = FirmwareStore::new(db);

        let a = store.create("1.0.0", "firmware/a.bin").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let b = store.create("1.1.0", "firmware/b.bin").await.unwrap();
        assert_ne!(a.id, b.id);

        let files = store.list().await.unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].version, "1.1.0");
        assert_eq!(store.get(&a.id).await.unwrap().unwrap(), a);
    }

    #[tokio::test]
    async fn test_rejects_escaping_paths() {
        let (_dir, db) = temp_database();
        let store = FirmwareStore::new(db);

        assert!(store.create("1.0", "../etc/passwd").await.is_err());
        assert!(store.create("1.0", "/abs/fw.bin").await.is_err());
        assert!(store.create("", "fw.bin").await.is_err());
    }

    #[tokio::test]
    async fn test_remove_deletes_binary() {
        let (dir, db) = temp_database();
        let store = FirmwareStore::new(db);
        let media = dir.path().join("media");
        std::fs::create_dir_all(media.join("firmware")).unwrap();
        std::fs::write(media.join("firmware/fw.bin"), b"\x00\x01").unwrap();

        let file = store.create("2.0", "firmware/fw.bin").await.unwrap();
        let removed = store.remove(&file.id, &media).await.unwrap();
        assert_eq!(removed.map(|f| f.id), Some(file.id.clone()));
        assert!(!media.join("firmware/fw.bin").exists());
        assert!(store.get(&file.id).await.unwrap().is_none());

        // Missing binary and missing record are both tolerated.
        let orphan = store.create("2.1", "firmware/gone.bin").await.unwrap();
        assert!(store.remove(&orphan.id, &media).await.unwrap().is_some());
        assert!(store.remove("nope", &media).await.unwrap().is_none());
    }
}
