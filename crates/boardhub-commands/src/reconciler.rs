//! Reply reconciliation.
//!
//! A fixed pool of workers reads the reply stream through one consumer
//! group. Each entry is parsed, the matching lock released, the board
//! record updated and an event emitted; then the entry is acknowledged and
//! deleted. An entry whose board update fails stays pending. A separate
//! reclaim task periodically takes over entries that have been pending too
//! long, so a crashed or stuck worker never strands a reply.

use std::sync::Arc;

use boardhub_core::{
    notify_logged, BoardEvent, LockKind, Notifier, ReconcilerConfig, BOARDS_CHANNEL,
};
use boardhub_storage::{BoardRepository, LockRelease, LockStore, ReplyStream, StreamEntry};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::reply::Reply;

/// What happened to one stream entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryOutcome {
    /// Reply matched a held lock and the board was updated.
    Applied,
    /// No lock matched; the board was updated anyway.
    Orphan,
    /// The matching command had already timed out. Nothing changed.
    Stale,
    /// Malformed or unknown payload, or an unknown board.
    Dropped,
    /// Board update failed; leave the entry pending.
    Retry,
}

impl EntryOutcome {
    /// Whether the entry should be acknowledged and deleted.
    pub fn is_final(&self) -> bool {
        !matches!(self, EntryOutcome::Retry)
    }
}

/// Reply stream consumer.
pub struct Reconciler {
    stream: ReplyStream,
    locks: Arc<dyn LockStore>,
    boards: Arc<dyn BoardRepository>,
    notifier: Arc<dyn Notifier>,
    config: ReconcilerConfig,
}

impl Reconciler {
    pub fn new(
        stream: ReplyStream,
        locks: Arc<dyn LockStore>,
        boards: Arc<dyn BoardRepository>,
        notifier: Arc<dyn Notifier>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            stream,
            locks,
            boards,
            notifier,
            config,
        }
    }

    fn consumer_name(&self, index: usize) -> String {
        format!("{}-{}", self.config.consumer_prefix, index)
    }

    fn reclaim_consumer(&self) -> String {
        format!("{}-reclaim", self.config.consumer_prefix)
    }

    /// Create the consumer group, then run the workers and the reclaim task
    /// until `cancel` fires. Returns once every task has stopped.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> boardhub_storage::Result<()> {
        if self.stream.create_group(&self.config.group).await? {
            tracing::info!(group = %self.config.group, "consumer group created");
        }

        let tracker = TaskTracker::new();
        for index in 0..self.config.workers {
            let reconciler = self.clone();
            let cancel = cancel.clone();
            tracker.spawn(async move { reconciler.worker(index, cancel).await });
        }
        let reconciler = self.clone();
        let reclaim_cancel = cancel.clone();
        tracker.spawn(async move { reconciler.reclaim_loop(reclaim_cancel).await });
        tracker.close();

        tracing::info!(
            workers = self.config.workers,
            group = %self.config.group,
            "reconciler started"
        );
        tracker.wait().await;
        tracing::info!("reconciler stopped");
        Ok(())
    }

    async fn worker(&self, index: usize, cancel: CancellationToken) {
        let consumer = self.consumer_name(index);
        let poll = self.config.poll_interval();
        tracing::debug!(consumer = %consumer, "worker started");

        loop {
            let read = tokio::select! {
                _ = cancel.cancelled() => break,
                read = self
                    .stream
                    .read_group_blocking(&self.config.group, &consumer, 1, poll) => read,
            };

            match read {
                Ok(entries) => {
                    for entry in entries {
                        self.handle(&entry, &consumer).await;
                    }
                }
                Err(e) => {
                    tracing::error!(consumer = %consumer, error = %e, "stream read failed");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(poll) => {}
                    }
                }
            }
        }
        tracing::debug!(consumer = %consumer, "worker stopped");
    }

    async fn reclaim_loop(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.reclaim_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            if let Err(e) = self.reclaim_once().await {
                tracing::error!(error = %e, "reclaim pass failed");
            }
        }
    }

    /// Claim entries idle past the threshold and process them. Returns how
    /// many were claimed.
    pub async fn reclaim_once(&self) -> boardhub_storage::Result<usize> {
        let consumer = self.reclaim_consumer();
        let claimed = self
            .stream
            .autoclaim(
                &self.config.group,
                &consumer,
                self.config.reclaim_idle(),
                self.config.reclaim_batch,
            )
            .await?;

        if !claimed.is_empty() {
            tracing::info!(count = claimed.len(), "reclaimed idle entries");
        }
        for entry in &claimed {
            self.handle(entry, &consumer).await;
        }
        Ok(claimed.len())
    }

    /// Process one entry and acknowledge it unless it must be retried.
    async fn handle(&self, entry: &StreamEntry, consumer: &str) {
        let outcome = self.process_entry(entry).await;
        tracing::debug!(
            consumer,
            entry_id = entry.id,
            delivery = entry.delivery_count,
            outcome = ?outcome,
            "entry processed"
        );
        if !outcome.is_final() {
            return;
        }
        if let Err(e) = self.stream.ack_and_delete(&self.config.group, entry.id).await {
            // Stays pending and is redelivered by reclaim; the update is idempotent.
            tracing::error!(entry_id = entry.id, error = %e, "failed to acknowledge entry");
        }
    }

    /// Apply one stream entry. Does not acknowledge it.
    pub async fn process_entry(&self, entry: &StreamEntry) -> EntryOutcome {
        let reply = match Reply::parse(&entry.payload) {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!(entry_id = entry.id, error = %e, "dropping malformed reply");
                return EntryOutcome::Dropped;
            }
        };

        match reply {
            Reply::State {
                mac_address,
                value,
                job_id,
            } => {
                let matched = self
                    .release(LockKind::Pending, &mac_address, job_id.as_deref())
                    .await;
                if matched == EntryOutcome::Stale {
                    return matched;
                }
                match self.boards.update_activity(&mac_address, value).await {
                    Ok(true) => {}
                    Ok(false) => return unknown_board(&mac_address),
                    Err(e) => return storage_failed(&mac_address, &e),
                }
                tracing::info!(
                    mac_address = %mac_address,
                    is_active = value,
                    "board state updated"
                );
                notify_logged(
                    self.notifier.as_ref(),
                    BoardEvent::state_updated(mac_address, value),
                    BOARDS_CHANNEL,
                )
                .await;
                matched
            }
            Reply::Flash {
                mac_address,
                version,
                job_id,
            } => {
                let matched = self
                    .release(LockKind::Flashing, &mac_address, job_id.as_deref())
                    .await;
                if matched == EntryOutcome::Stale {
                    return matched;
                }
                let updated = self
                    .boards
                    .update_firmware_version(&mac_address, &version)
                    .await;
                match updated {
                    Ok(true) => {}
                    Ok(false) => return unknown_board(&mac_address),
                    Err(e) => return storage_failed(&mac_address, &e),
                }
                tracing::info!(
                    mac_address = %mac_address,
                    version = %version,
                    "board firmware updated"
                );
                notify_logged(
                    self.notifier.as_ref(),
                    BoardEvent::firmware_updated(mac_address, version),
                    BOARDS_CHANNEL,
                )
                .await;
                matched
            }
            Reply::Unknown { reply_type } => {
                tracing::warn!(
                    entry_id = entry.id,
                    reply_type = reply_type.as_deref().unwrap_or("<missing>"),
                    "dropping reply with unknown type"
                );
                EntryOutcome::Dropped
            }
        }
    }

    /// Release the lock a reply settles. Lock store errors are logged and
    /// treated as an orphan reply so the update still goes through.
    async fn release(
        &self,
        kind: LockKind,
        mac_address: &str,
        job_id: Option<&str>,
    ) -> EntryOutcome {
        match self.locks.release_any(kind, mac_address, job_id).await {
            Ok(LockRelease::Released(record)) => {
                tracing::debug!(lock = %record.key(), "lock released by reply");
                EntryOutcome::Applied
            }
            Ok(LockRelease::Stale { job_id }) => {
                tracing::info!(
                    mac_address,
                    kind = %kind,
                    job_id = %job_id,
                    "reply arrived after timeout, ignored"
                );
                EntryOutcome::Stale
            }
            Ok(LockRelease::Absent) => {
                tracing::warn!(mac_address, kind = %kind, "reply without a matching lock");
                EntryOutcome::Orphan
            }
            Err(e) => {
                tracing::error!(mac_address, kind = %kind, error = %e, "failed to release lock");
                EntryOutcome::Orphan
            }
        }
    }
}

fn unknown_board(mac_address: &str) -> EntryOutcome {
    tracing::warn!(mac_address, "reply from unknown board, dropped");
    EntryOutcome::Dropped
}

fn storage_failed(mac_address: &str, e: &boardhub_storage::Error) -> EntryOutcome {
    tracing::error!(mac_address, error = %e, "board update failed, will retry");
    EntryOutcome::Retry
}
