//! Shared fixtures for command tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use boardhub_commands::{Dispatcher, Reconciler, Watchdog};
use boardhub_core::{
    BoardEvent, CommandTiming, CommandsConfig, EventBus, EventBusReceiver, LockKey, LockKind,
    MqttConfig, ReconcilerConfig,
};
use boardhub_devices::{BrokerError, CommandPublisher};
use boardhub_storage::{
    open_database, Board, BoardRepository, FirmwareStore, LockRecord, LockRelease, LockStore,
    RedbBoardStore, RedbLockStore, ReplyStream, StreamEntry,
};
use tokio_util::sync::CancellationToken;

pub const MAC: &str = "AA:BB:CC:DD:EE:01";
pub const GROUP: &str = "board_replies";

/// Publisher that records every message and can be told to fail.
#[derive(Default)]
pub struct RecordingPublisher {
    pub published: Mutex<Vec<(String, serde_json::Value)>>,
    pub fail: AtomicBool,
}

impl RecordingPublisher {
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn messages(&self) -> Vec<(String, serde_json::Value)> {
        self.published.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommandPublisher for RecordingPublisher {
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), BrokerError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(BrokerError::Connection("broker unreachable".to_string()));
        }
        let value = serde_json::from_slice(payload).unwrap();
        self.published
            .lock()
            .unwrap()
            .push((topic.to_string(), value));
        Ok(())
    }
}

/// Board repository whose writes can be made to fail.
pub struct FlakyBoards {
    pub inner: RedbBoardStore,
    pub fail_writes: AtomicBool,
}

#[async_trait]
impl BoardRepository for FlakyBoards {
    async fn get(&self, mac_address: &str) -> boardhub_storage::Result<Option<Board>> {
        self.inner.get(mac_address).await
    }

    async fn list(&self) -> boardhub_storage::Result<Vec<Board>> {
        self.inner.list().await
    }

    async fn update_activity(
        &self,
        mac_address: &str,
        is_active: bool,
    ) -> boardhub_storage::Result<bool> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(boardhub_storage::Error::Storage("disk full".to_string()));
        }
        self.inner.update_activity(mac_address, is_active).await
    }

    async fn update_firmware_version(
        &self,
        mac_address: &str,
        version: &str,
    ) -> boardhub_storage::Result<bool> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(boardhub_storage::Error::Storage("disk full".to_string()));
        }
        self.inner.update_firmware_version(mac_address, version).await
    }
}

/// Lock store whose next `expire_failures` expire calls fail.
pub struct FlakyLocks {
    pub inner: RedbLockStore,
    pub expire_failures: AtomicUsize,
}

#[async_trait]
impl LockStore for FlakyLocks {
    async fn exists_any(&self, kind: LockKind, device_id: &str) -> boardhub_storage::Result<bool> {
        self.inner.exists_any(kind, device_id).await
    }

    async fn try_acquire(
        &self,
        key: &LockKey,
        ttl: Duration,
        deadline: Duration,
    ) -> boardhub_storage::Result<bool> {
        self.inner.try_acquire(key, ttl, deadline).await
    }

    async fn release(&self, key: &LockKey) -> boardhub_storage::Result<bool> {
        self.inner.release(key).await
    }

    async fn expire(&self, key: &LockKey, tombstone_ttl: Duration) -> boardhub_storage::Result<bool> {
        let failing = self
            .expire_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(boardhub_storage::Error::Storage("database busy".to_string()));
        }
        self.inner.expire(key, tombstone_ttl).await
    }

    async fn release_any(
        &self,
        kind: LockKind,
        device_id: &str,
        job_id: Option<&str>,
    ) -> boardhub_storage::Result<LockRelease> {
        self.inner.release_any(kind, device_id, job_id).await
    }

    async fn get(&self, key: &LockKey) -> boardhub_storage::Result<Option<LockRecord>> {
        self.inner.get(key).await
    }

    async fn list(&self) -> boardhub_storage::Result<Vec<LockRecord>> {
        self.inner.list().await
    }
}

/// Short timings so watchdog tests finish quickly.
pub fn fast_timing() -> CommandsConfig {
    CommandsConfig {
        state: CommandTiming {
            lock_ttl_secs: 3,
            timeout_secs: 1,
        },
        flash: CommandTiming {
            lock_ttl_secs: 3,
            timeout_secs: 1,
        },
    }
}

/// Every component wired against one temporary database.
pub struct Harness {
    pub dir: tempfile::TempDir,
    pub locks: Arc<RedbLockStore>,
    pub boards: Arc<FlakyBoards>,
    pub firmware: FirmwareStore,
    pub stream: ReplyStream,
    pub bus: EventBus,
    pub publisher: Arc<RecordingPublisher>,
    pub cancel: CancellationToken,
    pub watchdog: Watchdog,
    pub dispatcher: Arc<Dispatcher>,
    pub reconciler: Arc<Reconciler>,
    pub mqtt: MqttConfig,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_timing(CommandsConfig::default()).await
    }

    pub async fn with_timing(timing: CommandsConfig) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let db = open_database(dir.path().join("boardhub.redb")).unwrap();

        let locks = Arc::new(RedbLockStore::new(db.clone()));
        let boards = Arc::new(FlakyBoards {
            inner: RedbBoardStore::new(db.clone()),
            fail_writes: AtomicBool::new(false),
        });
        let firmware = FirmwareStore::new(db.clone());
        let stream = ReplyStream::new(db);
        stream.create_group(GROUP).await.unwrap();

        let bus = EventBus::new();
        let publisher = Arc::new(RecordingPublisher::default());
        let cancel = CancellationToken::new();
        let mqtt = MqttConfig::default();

        let watchdog = Watchdog::new(
            locks.clone(),
            Arc::new(bus.clone()),
            timing.clone(),
            cancel.clone(),
        );
        let dispatcher = Arc::new(Dispatcher::new(
            locks.clone(),
            publisher.clone(),
            watchdog.clone(),
            mqtt.clone(),
            timing,
        ));
        let reconciler = Arc::new(Reconciler::new(
            stream.clone(),
            locks.clone(),
            boards.clone(),
            Arc::new(bus.clone()),
            ReconcilerConfig {
                workers: 4,
                group: GROUP.to_string(),
                poll_interval_ms: 100,
                reclaim_interval_secs: 1,
                reclaim_idle_secs: 0,
                ..Default::default()
            },
        ));

        Self {
            dir,
            locks,
            boards,
            firmware,
            stream,
            bus,
            publisher,
            cancel,
            watchdog,
            dispatcher,
            reconciler,
            mqtt,
        }
    }

    pub async fn add_board(&self, mac_address: &str) {
        self.boards
            .inner
            .create(Board::new(mac_address, self.mqtt.device_topic(mac_address)))
            .await
            .unwrap();
    }

    pub async fn board(&self, mac_address: &str) -> Board {
        self.boards.get(mac_address).await.unwrap().unwrap()
    }

    /// Append a reply and deliver it to `consumer`, as a worker would.
    pub async fn deliver(&self, payload: &str, consumer: &str) -> StreamEntry {
        self.stream.append("boards/reply", payload).await.unwrap();
        let mut entries = self.stream.read_group(GROUP, consumer, 1).await.unwrap();
        assert_eq!(entries.len(), 1);
        entries.remove(0)
    }
}

/// Drain every event currently queued on `rx`.
pub fn drain(rx: &mut EventBusReceiver) -> Vec<BoardEvent> {
    let mut events = Vec::new();
    while let Some((event, _)) = rx.try_recv() {
        events.push(event);
    }
    events
}

pub fn state_reply(mac_address: &str, value: bool) -> String {
    serde_json::json!({"type": "state", "mac_address": mac_address, "value": value}).to_string()
}

pub fn flash_reply(mac_address: &str, version: &str) -> String {
    serde_json::json!({"type": "flash", "mac_address": mac_address, "version": version})
        .to_string()
}

/// Poll `check` until it holds or `timeout` elapses.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    check().await
}
