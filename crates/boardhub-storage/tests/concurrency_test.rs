//! Concurrent access to locks and the reply stream through a shared database.

use std::sync::Arc;
use std::time::Duration;

use boardhub_core::{LockKey, LockKind};
use boardhub_storage::{open_database, LockStore, RedbLockStore, ReplyStream};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_acquire_has_one_winner() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_database(dir.path().join("boardhub.redb")).unwrap();
    let store = Arc::new(RedbLockStore::new(db));

    let tasks: Vec<_> = (0..16)
        .map(|i| {
            let store = store.clone();
            // Mix both kinds: a device may hold only one lock at a time.
            let kind = if i % 2 == 0 {
                LockKind::Pending
            } else {
                LockKind::Flashing
            };
            tokio::spawn(async move {
                let key = LockKey::generate(kind, "AA:BB:CC:DD:EE:FF");
                store
                    .try_acquire(&key, Duration::from_secs(60), Duration::from_secs(30))
                    .await
                    .unwrap()
            })
        })
        .collect();

    let winners = futures::future::join_all(tasks)
        .await
        .into_iter()
        .filter(|r| *r.as_ref().unwrap())
        .count();
    assert_eq!(winners, 1);
    assert_eq!(store.list().await.unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_readers_share_entries() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_database(dir.path().join("boardhub.redb")).unwrap();
    let stream = ReplyStream::new(db);
    stream.create_group("g").await.unwrap();

    for i in 0..40 {
        stream.append("boards/reply", &i.to_string()).await.unwrap();
    }

    let readers: Vec<_> = (0..4)
        .map(|w| {
            let stream = stream.clone();
            tokio::spawn(async move {
                let consumer = format!("w{}", w);
                let mut seen = Vec::new();
                loop {
                    let batch = stream.read_group("g", &consumer, 3).await.unwrap();
                    if batch.is_empty() {
                        break;
                    }
                    seen.extend(batch.into_iter().map(|e| e.id));
                }
                seen
            })
        })
        .collect();

    let mut all: Vec<u64> = futures::future::join_all(readers)
        .await
        .into_iter()
        .flat_map(|r| r.unwrap())
        .collect();
    all.sort_unstable();
    assert_eq!(all, (1..=40).collect::<Vec<u64>>());
}

#[tokio::test]
async fn test_state_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("boardhub.redb");
    let key = LockKey::generate(LockKind::Flashing, "dev");

    {
        let db = open_database(&path).unwrap();
        let locks = RedbLockStore::new(db.clone());
        locks
            .try_acquire(&key, Duration::from_secs(330), Duration::from_secs(300))
            .await
            .unwrap();
        let stream = ReplyStream::new(db);
        stream.create_group("g").await.unwrap();
        stream.append("t", "p").await.unwrap();
        stream.read_group("g", "w0", 1).await.unwrap();
    }

    let db = open_database(&path).unwrap();
    let locks = RedbLockStore::new(db.clone());
    assert_eq!(locks.list().await.unwrap()[0].key(), key);
    let stream = ReplyStream::new(db);
    assert_eq!(stream.pending("g").await.unwrap().len(), 1);
}
