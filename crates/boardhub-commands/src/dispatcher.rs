//! Command dispatch.
//!
//! Dispatching a command to a board:
//! 1. refuse if the board has any operation in flight
//! 2. take a lock for a fresh job id
//! 3. arm the reply watchdog
//! 4. publish; on failure release the lock before reporting the error
//!
//! A board never receives a command that is not covered by a lock, and a
//! failed publish never leaves its lock behind.

use std::sync::Arc;

use boardhub_core::{CommandsConfig, LockKey, LockKind, MqttConfig};
use boardhub_devices::CommandPublisher;
use boardhub_storage::LockStore;

use crate::message::CommandMessage;
use crate::watchdog::Watchdog;

/// Result of a single-board dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Published; the board holds a lock for `job_id`.
    Accepted { job_id: String },
    /// Another operation is in flight for this board.
    Conflict,
    /// Lock store or broker failure. No lock is left behind.
    InfraError(String),
}

impl DispatchOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, DispatchOutcome::Accepted { .. })
    }
}

/// Result of a broadcast dispatch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastOutcome {
    /// Locks held for boards covered by the published command.
    pub accepted: Vec<LockKey>,
    /// Boards skipped because an operation was already in flight.
    pub conflicts: Vec<String>,
    /// Boards skipped because of a lock store error, plus every board whose
    /// lock was rolled back after a failed publish.
    pub failed: Vec<String>,
    /// Set when the broadcast publish failed.
    pub publish_error: Option<String>,
}

impl BroadcastOutcome {
    pub fn published(&self) -> bool {
        !self.accepted.is_empty()
    }
}

/// Lock acquisition for one board, shared by both dispatch paths.
enum Acquire {
    Held(LockKey),
    Busy,
    Failed(String),
}

/// Sends commands under per-board locks.
pub struct Dispatcher {
    locks: Arc<dyn LockStore>,
    publisher: Arc<dyn CommandPublisher>,
    watchdog: Watchdog,
    mqtt: MqttConfig,
    timing: CommandsConfig,
}

impl Dispatcher {
    pub fn new(
        locks: Arc<dyn LockStore>,
        publisher: Arc<dyn CommandPublisher>,
        watchdog: Watchdog,
        mqtt: MqttConfig,
        timing: CommandsConfig,
    ) -> Self {
        Self {
            locks,
            publisher,
            watchdog,
            mqtt,
            timing,
        }
    }

    async fn acquire(&self, device_id: &str, kind: LockKind) -> Acquire {
        for held in LockKind::ALL {
            match self.locks.exists_any(held, device_id).await {
                Ok(false) => {}
                Ok(true) => {
                    tracing::info!(device_id, held = %held, "operation already in flight");
                    return Acquire::Busy;
                }
                Err(e) => return Acquire::Failed(e.to_string()),
            }
        }

        let key = LockKey::generate(kind, device_id);
        let timing = self.timing.timing(kind);
        match self
            .locks
            .try_acquire(&key, timing.lock_ttl(), timing.timeout())
            .await
        {
            Ok(true) => Acquire::Held(key),
            // Lost a race with a concurrent dispatch after the check above.
            Ok(false) => Acquire::Busy,
            Err(e) => Acquire::Failed(e.to_string()),
        }
    }

    async fn rollback(&self, key: &LockKey) {
        match self.locks.release(key).await {
            Ok(_) => tracing::debug!(lock = %key, "lock rolled back"),
            Err(e) => tracing::error!(
                lock = %key,
                error = %e,
                "failed to roll back lock, watchdog will expire it"
            ),
        }
    }

    /// Send `command` to one board.
    pub async fn dispatch(&self, device_id: &str, command: &CommandMessage) -> DispatchOutcome {
        let kind = command.kind();
        let key = match self.acquire(device_id, kind).await {
            Acquire::Held(key) => key,
            Acquire::Busy => return DispatchOutcome::Conflict,
            Acquire::Failed(e) => {
                tracing::error!(device_id, kind = %kind, error = %e, "lock store unavailable");
                return DispatchOutcome::InfraError(e);
            }
        };

        self.watchdog.arm(key.clone(), self.timing.timing(kind).timeout());

        let payload = match command.with_job_id(key.job_id.clone()).to_payload() {
            Ok(payload) => payload,
            Err(e) => {
                self.rollback(&key).await;
                return DispatchOutcome::InfraError(e.to_string());
            }
        };

        let topic = self.mqtt.device_topic(device_id);
        if let Err(e) = self.publisher.publish(&topic, &payload).await {
            tracing::error!(device_id, topic = %topic, error = %e, "command publish failed");
            self.rollback(&key).await;
            return DispatchOutcome::InfraError(e.to_string());
        }

        tracing::info!(
            device_id,
            kind = %kind,
            job_id = %key.job_id,
            topic = %topic,
            "command dispatched"
        );
        DispatchOutcome::Accepted { job_id: key.job_id }
    }

    /// Send `command` once on the broadcast topic, covering every board in
    /// `device_ids` that could be locked.
    ///
    /// Boards with an operation in flight are skipped. Nothing is published
    /// when no board could be locked.
    pub async fn dispatch_broadcast(
        &self,
        device_ids: &[String],
        command: &CommandMessage,
    ) -> BroadcastOutcome {
        let kind = command.kind();
        let timeout = self.timing.timing(kind).timeout();
        let mut outcome = BroadcastOutcome::default();

        for device_id in device_ids {
            match self.acquire(device_id, kind).await {
                Acquire::Held(key) => {
                    self.watchdog.arm(key.clone(), timeout);
                    outcome.accepted.push(key);
                }
                Acquire::Busy => outcome.conflicts.push(device_id.clone()),
                Acquire::Failed(e) => {
                    tracing::error!(device_id = %device_id, error = %e, "lock store unavailable");
                    outcome.failed.push(device_id.clone());
                }
            }
        }

        if outcome.accepted.is_empty() {
            tracing::warn!(
                conflicts = outcome.conflicts.len(),
                failed = outcome.failed.len(),
                "no board could be locked, broadcast not sent"
            );
            return outcome;
        }

        let topic = self.mqtt.broadcast_topic().to_string();
        let published = match command.to_payload() {
            Ok(payload) => self
                .publisher
                .publish(&topic, &payload)
                .await
                .map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };

        match published {
            Ok(()) => {
                tracing::info!(
                    kind = %kind,
                    topic = %topic,
                    boards = outcome.accepted.len(),
                    conflicts = outcome.conflicts.len(),
                    "broadcast command dispatched"
                );
            }
            Err(e) => {
                tracing::error!(topic = %topic, error = %e, "broadcast publish failed");
                for key in std::mem::take(&mut outcome.accepted) {
                    self.rollback(&key).await;
                    outcome.failed.push(key.device_id);
                }
                outcome.publish_error = Some(e);
            }
        }
        outcome
    }
}
