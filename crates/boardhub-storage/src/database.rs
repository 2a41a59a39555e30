//! Database file handling shared by every store.

use std::path::Path;
use std::sync::Arc;

use redb::Database;

use crate::{boards, firmware, locks, stream, Result};

/// Open (or create) the database at `path` and make sure every table exists.
///
/// The returned handle is shared by all stores; redb allows a single
/// `Database` per file per process.
pub fn open_database<P: AsRef<Path>>(path: P) -> Result<Arc<Database>> {
    let path_ref = path.as_ref();

    if let Some(parent) = path_ref.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let db = if path_ref.exists() {
        Database::open(path_ref)?
    } else {
        Database::create(path_ref)?
    };

    let write_txn = db.begin_write()?;
    {
        let _locks = write_txn.open_table(locks::LOCKS_TABLE)?;
        let _tombstones = write_txn.open_table(locks::TOMBSTONES_TABLE)?;
        let _entries = write_txn.open_table(stream::ENTRIES_TABLE)?;
        let _meta = write_txn.open_table(stream::META_TABLE)?;
        let _groups = write_txn.open_table(stream::GROUPS_TABLE)?;
        let _pending = write_txn.open_table(stream::PENDING_TABLE)?;
        let _boards = write_txn.open_table(boards::BOARDS_TABLE)?;
        let _firmware = write_txn.open_table(firmware::FIRMWARE_TABLE)?;
    }
    write_txn.commit()?;

    tracing::debug!(path = %path_ref.display(), "database opened");
    Ok(Arc::new(db))
}

/// Run a synchronous redb transaction on the blocking pool.
pub(crate) async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await?
}

#[cfg(test)]
pub(crate) fn temp_database() -> (tempfile::TempDir, Arc<Database>) {
    let dir = tempfile::tempdir().unwrap();
    let db = open_database(dir.path().join("boardhub.redb")).unwrap();
    (dir, db)
}
