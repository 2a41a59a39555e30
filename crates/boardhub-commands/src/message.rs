//! Command messages sent to boards.

use boardhub_core::LockKind;
use serde::{Deserialize, Serialize};

/// Command payload published on a board topic.
///
/// Serialized as `{"command": "state", "value": true, "job_id": "..."}` or
/// `{"command": "firmware", "url": "...", "version": "...", "job_id": "..."}`.
/// Boards that echo `job_id` in their reply get exact job matching.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum CommandMessage {
    /// Switch the board on or off.
    State {
        value: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        job_id: Option<String>,
    },
    /// Download and flash a firmware image.
    Firmware {
        url: String,
        version: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        job_id: Option<String>,
    },
}

impl CommandMessage {
    pub fn state(value: bool) -> Self {
        CommandMessage::State {
            value,
            job_id: None,
        }
    }

    pub fn firmware(url: impl Into<String>, version: impl Into<String>) -> Self {
        CommandMessage::Firmware {
            url: url.into(),
            version: version.into(),
            job_id: None,
        }
    }

    /// Lock kind guarding this command.
    pub fn kind(&self) -> LockKind {
        match self {
            CommandMessage::State { .. } => LockKind::Pending,
            CommandMessage::Firmware { .. } => LockKind::Flashing,
        }
    }

    pub fn job_id(&self) -> Option<&str> {
        match self {
            CommandMessage::State { job_id, .. } | CommandMessage::Firmware { job_id, .. } => {
                job_id.as_deref()
            }
        }
    }

    /// Copy of this command tagged with `job_id`.
    pub fn with_job_id(&self, job: impl Into<String>) -> Self {
        let mut tagged = self.clone();
        match &mut tagged {
            CommandMessage::State { job_id, .. } | CommandMessage::Firmware { job_id, .. } => {
                *job_id = Some(job.into());
            }
        }
        tagged
    }

    /// JSON bytes for the wire.
    pub fn to_payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}
