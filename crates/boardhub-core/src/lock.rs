//! Lock kinds and lock keys.
//!
//! A lock marks an operation in flight for one board. Keys have the form
//! `{kind}:{device_id}:{job_id}`. Device ids are MAC addresses and contain
//! colons themselves, so the kind is everything before the first colon and
//! the job id everything after the last one.

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Length of generated job identifiers.
pub const JOB_ID_LEN: usize = 12;

/// Operation category guarded by a lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockKind {
    /// Activity toggle in flight.
    Pending,
    /// Firmware flash in flight.
    Flashing,
}

impl LockKind {
    /// Every lock kind, in key order.
    pub const ALL: [LockKind; 2] = [LockKind::Pending, LockKind::Flashing];

    /// Key prefix for this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            LockKind::Pending => "pending",
            LockKind::Flashing => "flashing",
        }
    }

    /// Command name used in replies and notification events.
    pub fn command_name(&self) -> &'static str {
        match self {
            LockKind::Pending => "state",
            LockKind::Flashing => "flash",
        }
    }

    /// Parse a key prefix.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(LockKind::Pending),
            "flashing" => Some(LockKind::Flashing),
            _ => None,
        }
    }
}

impl std::fmt::Display for LockKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fully qualified lock key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockKey {
    pub kind: LockKind,
    pub device_id: String,
    pub job_id: String,
}

impl LockKey {
    /// Create a key for an existing job.
    pub fn new(kind: LockKind, device_id: impl Into<String>, job_id: impl Into<String>) -> Self {
        Self {
            kind,
            device_id: device_id.into(),
            job_id: job_id.into(),
        }
    }

    /// Create a key with a freshly generated job id.
    pub fn generate(kind: LockKind, device_id: impl Into<String>) -> Self {
        Self::new(kind, device_id, generate_job_id())
    }

    /// Prefix shared by every lock of `kind` on `device_id`.
    ///
    /// Prefix matches must still compare the device id exactly: the prefix
    /// for `AA` also matches keys of a device named `AA:BB`.
    pub fn prefix(kind: LockKind, device_id: &str) -> String {
        format!("{}:{}:", kind.as_str(), device_id)
    }

    /// Parse a key string back into its parts.
    pub fn parse(key: &str) -> Option<Self> {
        let (kind, rest) = key.split_once(':')?;
        let (device_id, job_id) = rest.rsplit_once(':')?;
        if device_id.is_empty() || job_id.is_empty() {
            return None;
        }
        Some(Self::new(LockKind::parse(kind)?, device_id, job_id))
    }
}

impl std::fmt::Display for LockKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.kind.as_str(), self.device_id, self.job_id)
    }
}

/// Random alphanumeric job identifier.
pub fn generate_job_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(JOB_ID_LEN)
        .map(char::from)
        .collect()
}
