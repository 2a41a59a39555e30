//! Core types shared across BoardHub.
//!
//! This crate defines the vocabulary used by every other crate:
//! - Lock kinds and lock keys for in-flight board operations
//! - Board notification events and the in-process event bus
//! - Runtime configuration

pub mod config;
pub mod event;
pub mod eventbus;
pub mod lock;

pub use config::{
    CommandTiming, CommandsConfig, ConfigError, HubConfig, LoggingConfig, MqttConfig,
    ReconcilerConfig, StorageConfig,
};
pub use event::{BoardEvent, BOARDS_CHANNEL};
pub use eventbus::{
    notify_logged, EventBus, EventBusReceiver, EventMetadata, Notifier, NotifyError,
    DEFAULT_CHANNEL_CAPACITY,
};
pub use lock::{LockKey, LockKind, JOB_ID_LEN};

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
