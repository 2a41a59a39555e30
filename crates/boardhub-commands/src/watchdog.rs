//! Reply deadlines for dispatched commands.
//!
//! Every dispatched command arms a one-shot timer. When it fires and the
//! command's lock is still held, the board never answered: the lock is
//! expired and a `board_timeout` event goes out. Deadlines are stored with
//! the locks, so [`Watchdog::recover`] can re-arm them after a restart.

use std::sync::Arc;
use std::time::Duration;

use boardhub_core::{
    notify_logged, now_ms, BoardEvent, CommandsConfig, LockKey, Notifier, BOARDS_CHANNEL,
};
use boardhub_storage::LockStore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Delay before a timer whose lock could not be expired fires again.
pub const EXPIRE_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Timer service for command deadlines.
#[derive(Clone)]
pub struct Watchdog {
    locks: Arc<dyn LockStore>,
    notifier: Arc<dyn Notifier>,
    timing: CommandsConfig,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl Watchdog {
    /// Timers stop without firing once `cancel` is triggered; their locks
    /// stay stored and are picked up by [`recover`](Self::recover).
    pub fn new(
        locks: Arc<dyn LockStore>,
        notifier: Arc<dyn Notifier>,
        timing: CommandsConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            locks,
            notifier,
            timing,
            tracker: TaskTracker::new(),
            cancel,
        }
    }

    /// Schedule [`fire`](Self::fire) for `key` after `delay`.
    pub fn arm(&self, key: LockKey, delay: Duration) {
        let watchdog = self.clone();
        tracing::debug!(lock = %key, delay_ms = delay.as_millis() as u64, "watchdog armed");
        self.tracker.spawn(async move {
            tokio::select! {
                _ = watchdog.cancel.cancelled() => {
                    tracing::debug!(lock = %key, "watchdog cancelled");
                }
                _ = tokio::time::sleep(delay) => {
                    watchdog.fire(&key).await;
                }
            }
        });
    }

    /// Deadline reached for `key`. Returns whether the command timed out,
    /// i.e. its lock was still held. If the store fails, the timer is
    /// re-armed after [`EXPIRE_RETRY_DELAY`] and `false` is returned.
    pub async fn fire(&self, key: &LockKey) -> bool {
        let tombstone_ttl = self.timing.timing(key.kind).lock_ttl();
        match self.locks.expire(key, tombstone_ttl).await {
            Ok(true) => {
                tracing::info!(
                    lock = %key,
                    device_id = %key.device_id,
                    "no reply before deadline, lock expired"
                );
                notify_logged(
                    self.notifier.as_ref(),
                    BoardEvent::timeout(key.kind, key.device_id.clone()),
                    BOARDS_CHANNEL,
                )
                .await;
                true
            }
            Ok(false) => {
                tracing::debug!(lock = %key, "lock already released");
                false
            }
            Err(e) => {
                tracing::error!(
                    lock = %key,
                    error = %e,
                    retry_ms = EXPIRE_RETRY_DELAY.as_millis() as u64,
                    "failed to expire lock, retrying"
                );
                self.arm(key.clone(), EXPIRE_RETRY_DELAY);
                false
            }
        }
    }

    /// Re-arm a timer for every stored lock, at its original deadline.
    /// Returns the number of timers armed.
    pub async fn recover(&self) -> boardhub_storage::Result<usize> {
        let records = self.locks.list().await?;
        let now = now_ms();
        for record in &records {
            self.arm(record.key(), record.remaining_until_deadline(now));
        }
        if !records.is_empty() {
            tracing::info!(count = records.len(), "re-armed watchdogs for stored locks");
        }
        Ok(records.len())
    }

    /// Number of timers not yet finished.
    pub fn armed(&self) -> usize {
        self.tracker.len()
    }

    /// Wait for every timer to finish. Call after cancelling.
    pub async fn wait(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}
