//! Notification fan-out for board events.
//!
//! Producers (watchdog, reconciler) only see the [`Notifier`] trait. The
//! in-process [`EventBus`] is the default implementation: a broadcast channel
//! that live viewers subscribe to. Delivery is fire-and-forget.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use crate::event::BoardEvent;

/// Default channel capacity for the event bus.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1000;

/// Notification delivery errors.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("Notification channel closed")]
    Closed,

    #[error("Notification transport error: {0}")]
    Transport(String),
}

/// Sink for board events.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver `event` to every viewer listening on `channel`.
    async fn broadcast(&self, event: BoardEvent, channel: &str) -> Result<(), NotifyError>;
}

/// Deliver an event and log, rather than return, any failure.
pub async fn notify_logged(notifier: &dyn Notifier, event: BoardEvent, channel: &str) {
    let name = event.name();
    let device_id = event.device_id().to_string();
    match notifier.broadcast(event, channel).await {
        Ok(()) => tracing::debug!(event = name, device_id = %device_id, channel, "event sent"),
        Err(e) => tracing::error!(
            event = name,
            device_id = %device_id,
            channel,
            error = %e,
            "failed to send event"
        ),
    }
}

/// Metadata attached to each published event.
#[derive(Debug, Clone)]
pub struct EventMetadata {
    pub channel: String,
    pub timestamp: DateTime<Utc>,
}

/// Broadcast-channel event bus.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<(BoardEvent, EventMetadata)>,
}

impl EventBus {
    /// Create a new event bus with default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a new event bus with the specified capacity.
    ///
    /// The capacity determines how many events are buffered for slow subscribers.
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Get the number of current subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Subscribe to events on every channel.
    pub fn subscribe(&self) -> EventBusReceiver {
        EventBusReceiver {
            rx: self.tx.subscribe(),
            channel: None,
        }
    }

    /// Subscribe to events published on one channel.
    pub fn subscribe_channel(&self, channel: impl Into<String>) -> EventBusReceiver {
        EventBusReceiver {
            rx: self.tx.subscribe(),
            channel: Some(channel.into()),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Notifier for EventBus {
    async fn broadcast(&self, event: BoardEvent, channel: &str) -> Result<(), NotifyError> {
        let metadata = EventMetadata {
            channel: channel.to_string(),
            timestamp: Utc::now(),
        };
        // No subscribers is not an error: nobody is watching.
        if self.tx.send((event, metadata)).is_err() {
            tracing::trace!(channel, "event dropped, no subscribers");
        }
        Ok(())
    }
}

/// Receiver for events from the event bus.
pub struct EventBusReceiver {
    rx: broadcast::Receiver<(BoardEvent, EventMetadata)>,
    channel: Option<String>,
}

impl EventBusReceiver {
    /// Receive the next event.
    ///
    /// Returns `None` if the event bus is closed. Lagging receivers skip the
    /// events they missed.
    pub async fn recv(&mut self) -> Option<(BoardEvent, EventMetadata)> {
        loop {
            match self.rx.recv().await {
                Ok((event, meta)) => {
                    if self.accepts(&meta) {
                        return Some((event, meta));
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event receiver lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Try to receive an event without blocking.
    pub fn try_recv(&mut self) -> Option<(BoardEvent, EventMetadata)> {
        while let Ok((event, meta)) = self.rx.try_recv() {
            if self.accepts(&meta) {
                return Some((event, meta));
            }
        }
        None
    }

    fn accepts(&self, meta: &EventMetadata) -> bool {
        self.channel.as_deref().is_none_or(|c| c == meta.channel)
    }
}
