//! Per-device operation locks.
//!
//! A lock marks one in-flight command (`pending` for state changes,
//! `flashing` for firmware updates). Keys are `"{kind}:{device_id}:{job_id}"`.
//! Each lock carries two instants: `deadline_at_ms`, when the watchdog gives
//! up on the reply, and `expires_at_ms`, after which the lock no longer
//! blocks new commands even if nobody removed it.
//!
//! When the watchdog expires a lock it leaves a short-lived tombstone under
//! the same key, so a reply arriving after the timeout can be recognised as
//! stale instead of being applied as a fresh update.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use boardhub_core::{now_ms, LockKey, LockKind};
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};

use crate::database::blocking;
use crate::Result;

// Locks table: key = lock key string, value = LockRecord (JSON)
pub(crate) const LOCKS_TABLE: TableDefinition<&str, &str> = TableDefinition::new("locks");

// Tombstones table: key = lock key string, value = Tombstone (JSON)
pub(crate) const TOMBSTONES_TABLE: TableDefinition<&str, &str> =
    TableDefinition::new("lock_tombstones");

/// A held lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub kind: LockKind,
    pub device_id: String,
    pub job_id: String,
    pub created_at_ms: i64,
    /// After this instant the lock no longer blocks dispatch.
    pub expires_at_ms: i64,
    /// When the watchdog fires if no reply has released the lock.
    pub deadline_at_ms: i64,
}

impl LockRecord {
    pub fn key(&self) -> LockKey {
        LockKey::new(self.kind, self.device_id.clone(), self.job_id.clone())
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at_ms <= now_ms
    }

    /// Time left until the watchdog deadline, zero if already past.
    pub fn remaining_until_deadline(&self, now_ms: i64) -> Duration {
        Duration::from_millis(self.deadline_at_ms.saturating_sub(now_ms).max(0) as u64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Tombstone {
    expires_at_ms: i64,
}

/// Result of releasing a lock on behalf of a reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockRelease {
    /// A matching lock was held and has been removed.
    Released(LockRecord),
    /// No lock is held, but a matching one timed out recently.
    Stale { job_id: String },
    /// Nothing matched.
    Absent,
}

/// Lock storage.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Whether any unexpired lock of `kind` exists for `device_id`.
    async fn exists_any(&self, kind: LockKind, device_id: &str) -> Result<bool>;

    /// Create `key` unless the device already holds an unexpired lock of any
    /// kind. Check and insert run in one write transaction, so concurrent
    /// callers for the same device see exactly one `true`.
    async fn try_acquire(&self, key: &LockKey, ttl: Duration, deadline: Duration) -> Result<bool>;

    /// Remove `key`. Returns whether it was present.
    async fn release(&self, key: &LockKey) -> Result<bool>;

    /// Remove `key` because its deadline passed, leaving a tombstone that
    /// lives for `tombstone_ttl`. Returns whether the lock was present.
    async fn expire(&self, key: &LockKey, tombstone_ttl: Duration) -> Result<bool>;

    /// Remove the unexpired lock of `kind` held by `device_id`, restricted
    /// to `job_id` when given. A lock past its TTL no longer matches.
    async fn release_any(
        &self,
        kind: LockKind,
        device_id: &str,
        job_id: Option<&str>,
    ) -> Result<LockRelease>;

    /// Fetch a single lock, expired or not.
    async fn get(&self, key: &LockKey) -> Result<Option<LockRecord>>;

    /// Every stored lock, expired or not.
    async fn list(&self) -> Result<Vec<LockRecord>>;
}

/// Lock store backed by redb.
#[derive(Clone)]
pub struct RedbLockStore {
    db: Arc<Database>,
}

impl RedbLockStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }
}

/// Entries under the `(kind, device_id)` prefix whose device id matches exactly.
fn device_entries<T>(table: &T, kind: LockKind, device_id: &str) -> Result<Vec<(LockKey, String)>>
where
    T: ReadableTable<&'static str, &'static str>,
{
    let prefix = LockKey::prefix(kind, device_id);
    let mut entries = Vec::new();
    for item in table.range(prefix.as_str()..)? {
        let (key, value) = item?;
        let key = key.value();
        if !key.starts_with(&prefix) {
            break;
        }
        match LockKey::parse(key) {
            Some(parsed) if parsed.device_id == device_id => {
                entries.push((parsed, value.value().to_string()));
            }
            Some(_) => {}
            None => tracing::warn!(key, "skipping malformed lock key"),
        }
    }
    Ok(entries)
}

fn device_locks<T>(table: &T, kind: LockKind, device_id: &str) -> Result<Vec<LockRecord>>
where
    T: ReadableTable<&'static str, &'static str>,
{
    let mut records = Vec::new();
    for (key, value) in device_entries(table, kind, device_id)? {
        match serde_json::from_str::<LockRecord>(&value) {
            Ok(record) => records.push(record),
            Err(e) => tracing::warn!(key = %key, error = %e, "skipping unreadable lock"),
        }
    }
    Ok(records)
}

fn expires_after(now: i64, d: Duration) -> i64 {
    now.saturating_add(d.as_millis().min(i64::MAX as u128) as i64)
}

#[async_trait]
impl LockStore for RedbLockStore {
    async fn exists_any(&self, kind: LockKind, device_id: &str) -> Result<bool> {
        let db = self.db.clone();
        let device_id = device_id.to_string();
        blocking(move || {
            let read_txn = db.begin_read()?;
            let table = read_txn.open_table(LOCKS_TABLE)?;
            let now = now_ms();
            Ok(device_locks(&table, kind, &device_id)?
                .iter()
                .any(|record| !record.is_expired(now)))
        })
        .await
    }

    async fn try_acquire(&self, key: &LockKey, ttl: Duration, deadline: Duration) -> Result<bool> {
        let db = self.db.clone();
        let key = key.clone();
        blocking(move || {
            let now = now_ms();
            let write_txn = db.begin_write()?;
            {
                let mut table = write_txn.open_table(LOCKS_TABLE)?;

                let mut stale = Vec::new();
                for kind in LockKind::ALL {
                    for record in device_locks(&table, kind, &key.device_id)? {
                        if !record.is_expired(now) {
                            tracing::debug!(
                                lock = %key,
                                held = %record.key(),
                                "device busy, lock not acquired"
                            );
                            return Ok(false);
                        }
                        stale.push(record.key().to_string());
                    }
                }

                // Expired locks of this device are superseded by the new one.
                for old in &stale {
                    table.remove(old.as_str())?;
                }

                let record = LockRecord {
                    kind: key.kind,
                    device_id: key.device_id.clone(),
                    job_id: key.job_id.clone(),
                    created_at_ms: now,
                    expires_at_ms: expires_after(now, ttl),
                    deadline_at_ms: expires_after(now, deadline),
                };
                let json = serde_json::to_string(&record)?;
                let key_str = key.to_string();
                table.insert(key_str.as_str(), json.as_str())?;
            }
            write_txn.commit()?;
            Ok(true)
        })
        .await
    }

    async fn release(&self, key: &LockKey) -> Result<bool> {
        let db = self.db.clone();
        let key_str = key.to_string();
        blocking(move || {
            let write_txn = db.begin_write()?;
            let removed = {
                let mut table = write_txn.open_table(LOCKS_TABLE)?;
                let removed = table.remove(key_str.as_str())?.is_some();
                removed
            };
            write_txn.commit()?;
            Ok(removed)
        })
        .await
    }

    async fn expire(&self, key: &LockKey, tombstone_ttl: Duration) -> Result<bool> {
        let db = self.db.clone();
        let key_str = key.to_string();
        blocking(move || {
            let now = now_ms();
            let write_txn = db.begin_write()?;
            let removed = {
                let mut locks = write_txn.open_table(LOCKS_TABLE)?;
                let removed = locks.remove(key_str.as_str())?.is_some();

                let mut tombstones = write_txn.open_table(TOMBSTONES_TABLE)?;
                let mut dead = Vec::new();
                for item in tombstones.iter()? {
                    let (k, v) = item?;
                    let expired = serde_json::from_str::<Tombstone>(v.value())
                        .map(|t| t.expires_at_ms <= now)
                        .unwrap_or(true);
                    if expired {
                        dead.push(k.value().to_string());
                    }
                }
                for k in &dead {
                    tombstones.remove(k.as_str())?;
                }

                if removed {
                    let tombstone = Tombstone {
                        expires_at_ms: expires_after(now, tombstone_ttl),
                    };
                    let json = serde_json::to_string(&tombstone)?;
                    tombstones.insert(key_str.as_str(), json.as_str())?;
                }
                removed
            };
            write_txn.commit()?;
            Ok(removed)
        })
        .await
    }

    async fn release_any(
        &self,
        kind: LockKind,
        device_id: &str,
        job_id: Option<&str>,
    ) -> Result<LockRelease> {
        let db = self.db.clone();
        let device_id = device_id.to_string();
        let job_id = job_id.map(str::to_string);
        blocking(move || {
            let now = now_ms();
            let write_txn = db.begin_write()?;
            let outcome = {
                let mut locks = write_txn.open_table(LOCKS_TABLE)?;
                let live: Vec<LockRecord> = device_locks(&locks, kind, &device_id)?
                    .into_iter()
                    .filter(|record| !record.is_expired(now))
                    .collect();
                let held = live
                    .iter()
                    .find(|record| job_id.as_deref().is_none_or(|job| job == record.job_id))
                    .cloned();

                if let Some(record) = held {
                    let key_str = record.key().to_string();
                    locks.remove(key_str.as_str())?;
                    LockRelease::Released(record)
                } else {
                    let tombstones = write_txn.open_table(TOMBSTONES_TABLE)?;
                    let mut stale = None;
                    for (key, value) in device_entries(&tombstones, kind, &device_id)? {
                        if job_id.as_deref().is_some_and(|job| job != key.job_id) {
                            continue;
                        }
                        let live = serde_json::from_str::<Tombstone>(&value)
                            .map(|t| t.expires_at_ms > now)
                            .unwrap_or(false);
                        if live {
                            stale = Some(key.job_id);
                            break;
                        }
                    }
                    match (stale, job_id) {
                        (Some(job_id), _) => LockRelease::Stale { job_id },
                        // An echoed job id that matches nothing held is a
                        // reply to a command this device is no longer running.
                        (None, Some(job_id)) if !live.is_empty() => LockRelease::Stale { job_id },
                        (None, _) => LockRelease::Absent,
                    }
                }
            };
            write_txn.commit()?;
            Ok(outcome)
        })
        .await
    }

    async fn get(&self, key: &LockKey) -> Result<Option<LockRecord>> {
        let db = self.db.clone();
        let key_str = key.to_string();
        blocking(move || {
            let read_txn = db.begin_read()?;
            let table = read_txn.open_table(LOCKS_TABLE)?;
            match table.get(key_str.as_str())? {
                Some(value) => Ok(Some(serde_json::from_str(value.value())?)),
                None => Ok(None),
            }
        })
        .await
    }

    async fn list(&self) -> Result<Vec<LockRecord>> {
        let db = self.db.clone();
        blocking(move || {
            let read_txn = db.begin_read()?;
            let table = read_txn.open_table(LOCKS_TABLE)?;
            let mut records = Vec::new();
            for item in table.iter()? {
                let (key, value) = item?;
                match serde_json::from_str::<LockRecord>(value.value()) {
                    Ok(record) => records.push(record),
                    Err(e) => {
                        tracing::warn!(key = key.value(), error = %e, "skipping unreadable lock")
                    }
                }
            }
            Ok(records)
        })
        .await
    }
}
