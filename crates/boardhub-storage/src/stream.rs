//! Durable reply stream with consumer groups.
//!
//! Entries get monotonically increasing ids. A consumer group keeps a
//! delivery cursor and a pending list: reading hands out entries past the
//! cursor and records each one as pending for the reading consumer until it
//! is acknowledged. Entries left pending by a consumer that went away can be
//! claimed by another one once they have been idle long enough.

use std::sync::Arc;
use std::time::Duration;

use boardhub_core::now_ms;
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::database::blocking;
use crate::{Error, Result};

// Entries table: key = entry id, value = StoredEntry (JSON)
pub(crate) const ENTRIES_TABLE: TableDefinition<u64, &str> = TableDefinition::new("reply_stream");

// Stream metadata: key = name, value = counter
pub(crate) const META_TABLE: TableDefinition<&str, u64> = TableDefinition::new("reply_stream_meta");

// Consumer groups: key = group name, value = last delivered entry id
pub(crate) const GROUPS_TABLE: TableDefinition<&str, u64> =
    TableDefinition::new("reply_stream_groups");

// Pending entries: key = "{group}/{id:020}", value = PendingRecord (JSON)
pub(crate) const PENDING_TABLE: TableDefinition<&str, &str> =
    TableDefinition::new("reply_stream_pending");

const LAST_ID: &str = "last_id";

/// Stream entry identifier.
pub type EntryId = u64;

#[derive(Debug, Serialize, Deserialize)]
struct StoredEntry {
    topic: String,
    payload: String,
    appended_at_ms: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct PendingRecord {
    consumer: String,
    delivered_at_ms: i64,
    delivery_count: u32,
}

/// An entry handed to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub id: EntryId,
    pub topic: String,
    pub payload: String,
    pub appended_at_ms: i64,
    /// How many times this entry has been delivered, this time included.
    pub delivery_count: u32,
}

/// An entry delivered but not yet acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    pub id: EntryId,
    pub consumer: String,
    pub delivered_at_ms: i64,
    pub delivery_count: u32,
}

impl PendingEntry {
    pub fn idle(&self, now_ms: i64) -> Duration {
        Duration::from_millis(now_ms.saturating_sub(self.delivered_at_ms).max(0) as u64)
    }
}

/// Stream summary for one consumer group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    pub length: u64,
    pub last_id: EntryId,
    /// `None` when the group does not exist.
    pub last_delivered_id: Option<EntryId>,
    pub pending: usize,
}

fn pending_prefix(group: &str) -> String {
    format!("{}/", group)
}

fn pending_key(group: &str, id: EntryId) -> String {
    format!("{}/{:020}", group, id)
}

fn validate_group(group: &str) -> Result<()> {
    if group.is_empty() || group.contains('/') {
        return Err(Error::InvalidInput(format!("invalid group name: {:?}", group)));
    }
    Ok(())
}

fn no_group(group: &str) -> Error {
    Error::GroupNotFound(group.to_string())
}

/// Pending records of `group`, as `(key, id, record)`.
fn group_pending<T>(table: &T, group: &str) -> Result<Vec<(String, EntryId, PendingRecord)>>
where
    T: ReadableTable<&'static str, &'static str>,
{
    let prefix = pending_prefix(group);
    let mut out = Vec::new();
    for item in table.range(prefix.as_str()..)? {
        let (key, value) = item?;
        let key = key.value();
        let Some(suffix) = key.strip_prefix(&prefix) else {
            break;
        };
        let (Ok(id), Ok(record)) = (
            suffix.parse::<EntryId>(),
            serde_json::from_str::<PendingRecord>(value.value()),
        ) else {
            tracing::warn!(key, "skipping unreadable pending record");
            continue;
        };
        out.push((key.to_string(), id, record));
    }
    Ok(out)
}

/// Reply stream backed by redb.
#[derive(Clone)]
pub struct ReplyStream {
    db: Arc<Database>,
    appended: Arc<Notify>,
}

impl ReplyStream {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            appended: Arc::new(Notify::new()),
        }
    }

    /// Append an entry and wake blocked readers.
    pub async fn append(&self, topic: &str, payload: &str) -> Result<EntryId> {
        let db = self.db.clone();
        let stored = StoredEntry {
            topic: topic.to_string(),
            payload: payload.to_string(),
            appended_at_ms: now_ms(),
        };
        let id = blocking(move || {
            let json = serde_json::to_string(&stored)?;
            let write_txn = db.begin_write()?;
            let id = {
                let mut meta = write_txn.open_table(META_TABLE)?;
                let last = meta.get(LAST_ID)?.map(|v| v.value()).unwrap_or(0);
                let id = last + 1;
                meta.insert(LAST_ID, id)?;

                let mut entries = write_txn.open_table(ENTRIES_TABLE)?;
                entries.insert(id, json.as_str())?;
                id
            };
            write_txn.commit()?;
            Ok(id)
        })
        .await?;

        self.appended.notify_waiters();
        Ok(id)
    }

    /// Create `group` with its cursor at the start of the stream.
    ///
    /// Returns `false` if the group already existed; it is left untouched.
    pub async fn create_group(&self, group: &str) -> Result<bool> {
        validate_group(group)?;
        let db = self.db.clone();
        let group = group.to_string();
        blocking(move || {
            let write_txn = db.begin_write()?;
            let created = {
                let mut groups = write_txn.open_table(GROUPS_TABLE)?;
                let exists = groups.get(group.as_str())?.is_some();
                if !exists {
                    groups.insert(group.as_str(), 0)?;
                }
                !exists
            };
            write_txn.commit()?;
            Ok(created)
        })
        .await
    }

    /// Deliver up to `count` entries past the group cursor to `consumer`.
    pub async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>> {
        let db = self.db.clone();
        let group = group.to_string();
        let consumer = consumer.to_string();
        blocking(move || {
            let now = now_ms();
            let write_txn = db.begin_write()?;
            let delivered = {
                let mut groups = write_txn.open_table(GROUPS_TABLE)?;
                let cursor = match groups.get(group.as_str())? {
                    Some(v) => v.value(),
                    None => return Err(no_group(&group)),
                };

                let entries = write_txn.open_table(ENTRIES_TABLE)?;
                let mut delivered = Vec::new();
                let mut last_seen = cursor;
                for item in entries.range((cursor + 1)..)? {
                    if delivered.len() >= count {
                        break;
                    }
                    let (id, value) = item?;
                    let id = id.value();
                    last_seen = id;
                    match serde_json::from_str::<StoredEntry>(value.value()) {
                        Ok(stored) => delivered.push(StreamEntry {
                            id,
                            topic: stored.topic,
                            payload: stored.payload,
                            appended_at_ms: stored.appended_at_ms,
                            delivery_count: 1,
                        }),
                        Err(e) => tracing::warn!(id, error = %e, "skipping unreadable stream entry"),
                    }
                }

                let mut pending = write_txn.open_table(PENDING_TABLE)?;
                for entry in &delivered {
                    let record = PendingRecord {
                        consumer: consumer.clone(),
                        delivered_at_ms: now,
                        delivery_count: 1,
                    };
                    let json = serde_json::to_string(&record)?;
                    pending.insert(pending_key(&group, entry.id).as_str(), json.as_str())?;
                }
                if last_seen != cursor {
                    groups.insert(group.as_str(), last_seen)?;
                }
                delivered
            };
            write_txn.commit()?;
            Ok(delivered)
        })
        .await
    }

    /// Like [`read_group`](Self::read_group), but when nothing is available
    /// wait up to `block` for an append before reading once more.
    pub async fn read_group_blocking(
        &self,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>> {
        let notified = self.appended.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let entries = self.read_group(group, consumer, count).await?;
        if !entries.is_empty() || block.is_zero() {
            return Ok(entries);
        }

        let _ = tokio::time::timeout(block, notified).await;
        self.read_group(group, consumer, count).await
    }

    /// Remove entries from the group's pending list. Returns how many were pending.
    pub async fn ack(&self, group: &str, ids: &[EntryId]) -> Result<usize> {
        let db = self.db.clone();
        let keys: Vec<String> = ids.iter().map(|id| pending_key(group, *id)).collect();
        blocking(move || {
            let write_txn = db.begin_write()?;
            let mut acked = 0;
            {
                let mut pending = write_txn.open_table(PENDING_TABLE)?;
                for key in &keys {
                    if pending.remove(key.as_str())?.is_some() {
                        acked += 1;
                    }
                }
            }
            write_txn.commit()?;
            Ok(acked)
        })
        .await
    }

    /// Delete entries from the stream. Returns how many existed.
    pub async fn delete(&self, ids: &[EntryId]) -> Result<usize> {
        let db = self.db.clone();
        let ids = ids.to_vec();
        blocking(move || {
            let write_txn = db.begin_write()?;
            let mut deleted = 0;
            {
                let mut entries = write_txn.open_table(ENTRIES_TABLE)?;
                for id in &ids {
                    if entries.remove(*id)?.is_some() {
                        deleted += 1;
                    }
                }
            }
            write_txn.commit()?;
            Ok(deleted)
        })
        .await
    }

    /// Acknowledge and delete one entry in a single transaction.
    pub async fn ack_and_delete(&self, group: &str, id: EntryId) -> Result<bool> {
        let db = self.db.clone();
        let key = pending_key(group, id);
        blocking(move || {
            let write_txn = db.begin_write()?;
            let deleted = {
                let mut pending = write_txn.open_table(PENDING_TABLE)?;
                pending.remove(key.as_str())?;
                let mut entries = write_txn.open_table(ENTRIES_TABLE)?;
                let deleted = entries.remove(id)?.is_some();
                deleted
            };
            write_txn.commit()?;
            Ok(deleted)
        })
        .await
    }

    /// Transfer up to `count` pending entries idle for at least `min_idle`
    /// to `consumer`, and return them.
    ///
    /// Pending records whose entry was already deleted are dropped.
    pub async fn autoclaim(
        &self,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamEntry>> {
        let db = self.db.clone();
        let group = group.to_string();
        let consumer = consumer.to_string();
        let min_idle_ms = min_idle.as_millis().min(i64::MAX as u128) as i64;
        blocking(move || {
            let now = now_ms();
            let write_txn = db.begin_write()?;
            let claimed = {
                let groups = write_txn.open_table(GROUPS_TABLE)?;
                if groups.get(group.as_str())?.is_none() {
                    return Err(no_group(&group));
                }

                let mut pending = write_txn.open_table(PENDING_TABLE)?;
                let entries = write_txn.open_table(ENTRIES_TABLE)?;

                let mut claimed = Vec::new();
                let mut orphaned = Vec::new();
                let mut updates = Vec::new();
                for (key, id, record) in group_pending(&pending, &group)? {
                    if claimed.len() >= count {
                        break;
                    }
                    if now.saturating_sub(record.delivered_at_ms) < min_idle_ms {
                        continue;
                    }
                    let Some(value) = entries.get(id)? else {
                        orphaned.push(key);
                        continue;
                    };
                    let stored: StoredEntry = match serde_json::from_str(value.value()) {
                        Ok(stored) => stored,
                        Err(e) => {
                            tracing::warn!(id, error = %e, "dropping unreadable stream entry");
                            orphaned.push(key);
                            continue;
                        }
                    };
                    let delivery_count = record.delivery_count.saturating_add(1);
                    claimed.push(StreamEntry {
                        id,
                        topic: stored.topic,
                        payload: stored.payload,
                        appended_at_ms: stored.appended_at_ms,
                        delivery_count,
                    });
                    updates.push((
                        key,
                        PendingRecord {
                            consumer: consumer.clone(),
                            delivered_at_ms: now,
                            delivery_count,
                        },
                    ));
                }

                for key in &orphaned {
                    pending.remove(key.as_str())?;
                }
                for (key, record) in &updates {
                    let json = serde_json::to_string(record)?;
                    pending.insert(key.as_str(), json.as_str())?;
                }
                claimed
            };
            write_txn.commit()?;
            Ok(claimed)
        })
        .await
    }

    /// Entries delivered to `group` and not yet acknowledged.
    pub async fn pending(&self, group: &str) -> Result<Vec<PendingEntry>> {
        let db = self.db.clone();
        let group = group.to_string();
        blocking(move || {
            let read_txn = db.begin_read()?;
            let pending = read_txn.open_table(PENDING_TABLE)?;
            Ok(group_pending(&pending, &group)?
                .into_iter()
                .map(|(_, id, record)| PendingEntry {
                    id,
                    consumer: record.consumer,
                    delivered_at_ms: record.delivered_at_ms,
                    delivery_count: record.delivery_count,
                })
                .collect())
        })
        .await
    }

    /// Number of entries in the stream.
    pub async fn len(&self) -> Result<u64> {
        let db = self.db.clone();
        blocking(move || {
            let read_txn = db.begin_read()?;
            let entries = read_txn.open_table(ENTRIES_TABLE)?;
            Ok(entries.len()?)
        })
        .await
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    /// Stream length, last id and the state of `group`.
    pub async fn info(&self, group: &str) -> Result<StreamInfo> {
        let db = self.db.clone();
        let group = group.to_string();
        blocking(move || {
            let read_txn = db.begin_read()?;
            let entries = read_txn.open_table(ENTRIES_TABLE)?;
            let meta = read_txn.open_table(META_TABLE)?;
            let groups = read_txn.open_table(GROUPS_TABLE)?;
            let pending = read_txn.open_table(PENDING_TABLE)?;

            let last_id = meta.get(LAST_ID)?.map(|v| v.value()).unwrap_or(0);
            let last_delivered_id = groups.get(group.as_str())?.map(|v| v.value());
            Ok(StreamInfo {
                length: entries.len()?,
                last_id,
                last_delivered_id,
                pending: group_pending(&pending, &group)?.len(),
            })
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::temp_database;

    const GROUP: &str = "board_replies";

    async fn stream_with_group() -> (tempfile::TempDir, ReplyStream) {
        let (dir, db) = temp_database();
        let stream = ReplyStream::new(db);
        assert!(stream.create_group(GROUP).await.unwrap());
        (dir, stream)
    }

    #[tokio::test]
    async fn test_create_group_is_idempotent() {
        let (_dir, stream) = stream_with_group().await;
        stream.append("boards/reply", "{}").await.unwrap();
        stream.read_group(GROUP, "w0", 10).await.unwrap();

        assert!(!stream.create_group(GROUP).await.unwrap());
        // The existing cursor survives.
        assert!(stream.read_group(GROUP, "w0", 10).await.unwrap().is_empty());
        assert!(stream.create_group("bad/name").await.is_err());
    }

    #[tokio::test]
    async fn test_read_without_group_fails() {
        let (_dir, db) = temp_database();
        let stream = ReplyStream::new(db);
        let result = stream.read_group("missing", "w0", 1).await;
        assert!(matches!(result, Err(Error::GroupNotFound(_))));
    }

    #[tokio::test]
    async fn test_group_sees_entries_appended_before_creation() {
        let (_dir, db) = temp_database();
        let stream = ReplyStream::new(db);
        stream.append("t", "early").await.unwrap();
        stream.create_group(GROUP).await.unwrap();

        let entries = stream.read_group(GROUP, "w0", 10).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].payload, "early");
    }

    #[tokio::test]
    async fn test_each_entry_delivered_once() {
        let (_dir, stream) = stream_with_group().await;
        for i in 0..5 {
            stream.append("t", &format!("m{}", i)).await.unwrap();
        }

        let first = stream.read_group(GROUP, "w0", 3).await.unwrap();
        let second = stream.read_group(GROUP, "w1", 3).await.unwrap();
        assert_eq!(first.iter().map(|e| e.id).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(second.iter().map(|e| e.id).collect::<Vec<_>>(), vec![4, 5]);

        let pending = stream.pending(GROUP).await.unwrap();
        assert_eq!(pending.len(), 5);
        assert_eq!(pending[3].consumer, "w1");
    }

    #[tokio::test]
    async fn test_ack_and_delete() {
        let (_dir, stream) = stream_with_group().await;
        let id = stream.append("t", "x").await.unwrap();
        stream.read_group(GROUP, "w0", 1).await.unwrap();

        assert!(stream.ack_and_delete(GROUP, id).await.unwrap());
        assert!(stream.pending(GROUP).await.unwrap().is_empty());
        assert!(stream.is_empty().await.unwrap());
        assert!(!stream.ack_and_delete(GROUP, id).await.unwrap());
    }

    #[tokio::test]
    async fn test_ack_then_delete_separately() {
        let (_dir, stream) = stream_with_group().await;
        let a = stream.append("t", "a").await.unwrap();
        let b = stream.append("t", "b").await.unwrap();
        stream.read_group(GROUP, "w0", 10).await.unwrap();

        assert_eq!(stream.ack(GROUP, &[a, b, 99]).await.unwrap(), 2);
        assert_eq!(stream.delete(&[a]).await.unwrap(), 1);
        assert_eq!(stream.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_autoclaim_respects_idle_time() {
        let (_dir, stream) = stream_with_group().await;
        stream.append("t", "x").await.unwrap();
        stream.read_group(GROUP, "crashed", 1).await.unwrap();

        let none = stream
            .autoclaim(GROUP, "reclaimer", Duration::from_secs(60), 10)
            .await
            .unwrap();
        assert!(none.is_empty());

        let claimed = stream
            .autoclaim(GROUP, "reclaimer", Duration::ZERO, 10)
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].delivery_count, 2);

        let pending = stream.pending(GROUP).await.unwrap();
        assert_eq!(pending[0].consumer, "reclaimer");
    }

    #[tokio::test]
    async fn test_autoclaim_drops_deleted_entries() {
        let (_dir, stream) = stream_with_group().await;
        let id = stream.append("t", "x").await.unwrap();
        stream.read_group(GROUP, "w0", 1).await.unwrap();
        stream.delete(&[id]).await.unwrap();

        let claimed = stream
            .autoclaim(GROUP, "reclaimer", Duration::ZERO, 10)
            .await
            .unwrap();
        assert!(claimed.is_empty());
        assert!(stream.pending(GROUP).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_blocking_read_wakes_on_append() {
        let (_dir, stream) = stream_with_group().await;
        let reader = stream.clone();
        let handle = tokio::spawn(async move {
            reader
                .read_group_blocking(GROUP, "w0", 1, Duration::from_secs(5))
                .await
                .unwrap()
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        stream.append("t", "wake").await.unwrap();

        let entries = handle.await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].payload, "wake");
    }

    #[tokio::test]
    async fn test_info() {
        let (_dir, stream) = stream_with_group().await;
        stream.append("t", "a").await.unwrap();
        stream.append("t", "b").await.unwrap();
        stream.read_group(GROUP, "w0", 1).await.unwrap();

        let info = stream.info(GROUP).await.unwrap();
        assert_eq!(info.length, 2);
        assert_eq!(info.last_id, 2);
        assert_eq!(info.last_delivered_id, Some(1));
        assert_eq!(info.pending, 1);

        assert_eq!(stream.info("other").await.unwrap().last_delivered_id, None);
    }
}
