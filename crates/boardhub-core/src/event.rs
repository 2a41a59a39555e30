//! Board notification events.
//!
//! These are the payloads pushed to live viewers. The JSON shape is the
//! contract: `{"event": "board_update", "command": "state", ...}`.

use serde::{Deserialize, Serialize};

use crate::lock::LockKind;

/// Channel all board events are published on.
pub const BOARDS_CHANNEL: &str = "boards";

/// Event emitted when board state changes or an operation times out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BoardEvent {
    /// A board was registered.
    BoardCreate { mac_address: String, topic: String },
    /// A confirmed reply changed board state.
    BoardUpdate {
        command: String,
        mac_address: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        is_active: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        file_version: Option<String>,
    },
    /// No reply arrived before the watchdog deadline. `command` is the lock
    /// kind, not the reply command name.
    BoardTimeout { command: String, device_id: String },
}

impl BoardEvent {
    /// Activity flag confirmed by a `state` reply.
    pub fn state_updated(mac_address: impl Into<String>, is_active: bool) -> Self {
        BoardEvent::BoardUpdate {
            command: LockKind::Pending.command_name().to_string(),
            mac_address: mac_address.into(),
            is_active: Some(is_active),
            file_version: None,
        }
    }

    /// Firmware version confirmed by a `flash` reply.
    pub fn firmware_updated(mac_address: impl Into<String>, version: impl Into<String>) -> Self {
        BoardEvent::BoardUpdate {
            command: LockKind::Flashing.command_name().to_string(),
            mac_address: mac_address.into(),
            is_active: None,
            file_version: Some(version.into()),
        }
    }

    /// Operation of `kind` on `device_id` timed out. `command` carries the
    /// lock kind (`pending` or `flashing`).
    pub fn timeout(kind: LockKind, device_id: impl Into<String>) -> Self {
        BoardEvent::BoardTimeout {
            command: kind.as_str().to_string(),
            device_id: device_id.into(),
        }
    }

    /// Board registered.
    pub fn created(mac_address: impl Into<String>, topic: impl Into<String>) -> Self {
        BoardEvent::BoardCreate {
            mac_address: mac_address.into(),
            topic: topic.into(),
        }
    }

    /// Event name as it appears in the `event` field.
    pub fn name(&self) -> &'static str {
        match self {
            BoardEvent::BoardCreate { .. } => "board_create",
            BoardEvent::BoardUpdate { .. } => "board_update",
            BoardEvent::BoardTimeout { .. } => "board_timeout",
        }
    }

    /// Board the event refers to.
    pub fn device_id(&self) -> &str {
        match self {
            BoardEvent::BoardCreate { mac_address, .. } => mac_address,
            BoardEvent::BoardUpdate { mac_address, .. } => mac_address,
            BoardEvent::BoardTimeout { device_id, .. } => device_id,
        }
    }
}
