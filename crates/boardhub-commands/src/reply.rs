//! Replies published by boards.
//!
//! Wire shape: `{"type": "state", "mac_address": "...", "value": true}` or
//! `{"type": "flash", "mac_address": "...", "version": "1.2.0"}`, with an
//! optional `job_id` echoed from the command.

use boardhub_core::LockKind;
use serde_json::{Map, Value};
use thiserror::Error;

/// A parsed board reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    State {
        mac_address: String,
        value: bool,
        job_id: Option<String>,
    },
    Flash {
        mac_address: String,
        version: String,
        job_id: Option<String>,
    },
    /// Valid JSON object with a missing or unrecognised `type`.
    Unknown { reply_type: Option<String> },
}

/// Reasons a payload cannot be turned into a [`Reply`]. None of them go away
/// on retry.
#[derive(Debug, Error)]
pub enum ReplyError {
    #[error("invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("payload is not a JSON object")]
    NotAnObject,

    #[error("{reply_type} reply missing field `{field}`")]
    MissingField {
        reply_type: &'static str,
        field: &'static str,
    },

    #[error("field `{field}` has an invalid value: {value}")]
    InvalidField { field: &'static str, value: String },
}

fn required<'a>(
    obj: &'a Map<String, Value>,
    reply_type: &'static str,
    field: &'static str,
) -> Result<&'a Value, ReplyError> {
    match obj.get(field) {
        Some(Value::Null) | None => Err(ReplyError::MissingField { reply_type, field }),
        Some(value) => Ok(value),
    }
}

fn mac_address(obj: &Map<String, Value>, reply_type: &'static str) -> Result<String, ReplyError> {
    match required(obj, reply_type, "mac_address")? {
        Value::String(s) if !s.trim().is_empty() => Ok(s.clone()),
        other => Err(ReplyError::InvalidField {
            field: "mac_address",
            value: other.to_string(),
        }),
    }
}

/// Boards send booleans; some firmware sends 0/1 instead.
fn flag(value: &Value) -> Result<bool, ReplyError> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::Number(n) if n.as_u64() == Some(0) => Ok(false),
        Value::Number(n) if n.as_u64() == Some(1) => Ok(true),
        other => Err(ReplyError::InvalidField {
            field: "value",
            value: other.to_string(),
        }),
    }
}

fn version(value: &Value) -> Result<String, ReplyError> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(ReplyError::InvalidField {
            field: "version",
            value: other.to_string(),
        }),
    }
}

fn job_id(obj: &Map<String, Value>) -> Option<String> {
    obj.get("job_id")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

impl Reply {
    /// Parse a raw payload.
    pub fn parse(payload: &str) -> Result<Reply, ReplyError> {
        let value: Value = serde_json::from_str(payload)?;
        let Value::Object(obj) = value else {
            return Err(ReplyError::NotAnObject);
        };

        match obj.get("type").and_then(Value::as_str) {
            Some("state") => Ok(Reply::State {
                mac_address: mac_address(&obj, "state")?,
                value: flag(required(&obj, "state", "value")?)?,
                job_id: job_id(&obj),
            }),
            Some("flash") => Ok(Reply::Flash {
                mac_address: mac_address(&obj, "flash")?,
                version: version(required(&obj, "flash", "version")?)?,
                job_id: job_id(&obj),
            }),
            other => Ok(Reply::Unknown {
                reply_type: other.map(str::to_string),
            }),
        }
    }

    /// Lock kind this reply settles.
    pub fn kind(&self) -> Option<LockKind> {
        match self {
            Reply::State { .. } => Some(LockKind::Pending),
            Reply::Flash { .. } => Some(LockKind::Flashing),
            Reply::Unknown { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_state() {
        let reply =
            Reply::parse(r#"{"type":"state","mac_address":"AA:BB","value":false}"#).unwrap();
        assert_eq!(
            reply,
            Reply::State {
                mac_address: "AA:BB".to_string(),
                value: false,
                job_id: None,
            }
        );
        assert_eq!(reply.kind(), Some(LockKind::Pending));
    }

    #[test]
    fn test_parse_flash_with_job() {
        let reply = Reply::parse(
            r#"{"type":"flash","mac_address":"AA:BB","version":"2.0.1","job_id":"x1y2z3x1y2z3"}"#,
        )
        .unwrap();
        assert!(matches!(
            reply,
            Reply::Flash { ref version, job_id: Some(ref job), .. }
                if version == "2.0.1" && job == "x1y2z3x1y2z3"
        ));
    }

    #[test]
    fn test_numeric_flag() {
        let reply = Reply::parse(r#"{"type":"state","mac_address":"m","value":1}"#).unwrap();
        assert!(matches!(reply, Reply::State { value: true, .. }));
        assert!(Reply::parse(r#"{"type":"state","mac_address":"m","value":"yes"}"#).is_err());
    }

    #[test]
    fn test_missing_fields() {
        let err = Reply::parse(r#"{"type":"state","mac_address":"m"}"#).unwrap_err();
        assert!(matches!(err, ReplyError::MissingField { field: "value", .. }));

        let err = Reply::parse(r#"{"type":"flash","version":"1"}"#).unwrap_err();
        assert!(matches!(err, ReplyError::MissingField { field: "mac_address", .. }));

        let err = Reply::parse(r#"{"type":"state","mac_address":null,"value":true}"#).unwrap_err();
        assert!(matches!(err, ReplyError::MissingField { .. }));
    }

    #[test]
    fn test_unknown_and_malformed() {
        assert_eq!(
            Reply::parse(r#"{"type":"reboot"}"#).unwrap(),
            Reply::Unknown {
                reply_type: Some("reboot".to_string())
            }
        );
        assert_eq!(
            Reply::parse(r#"{"mac_address":"m"}"#).unwrap(),
            Reply::Unknown { reply_type: None }
        );
        assert!(matches!(
            Reply::parse("{not json"),
            Err(ReplyError::InvalidJson(_))
        ));
        assert!(matches!(Reply::parse("[1,2]"), Err(ReplyError::NotAnObject)));
    }
}
