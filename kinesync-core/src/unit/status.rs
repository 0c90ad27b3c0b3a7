use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::info;

use crate::error::{Result, SyncError};
use crate::index::ObjectStoreIndex;

/// Lifecycle of a work unit: `pending -> processing -> done | error`.
///
/// `error` units stay eligible, so a rerun moves them back to `processing`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitState {
    /// Never claimed.
    #[default]
    Pending,
    /// Claimed by the worker named in the record.
    Processing,
    /// Engine succeeded.
    Done,
    /// Engine failed, timed out or could not be supervised.
    Error,
}

impl UnitState {
    /// Wire spelling.
    pub fn as_str(self) -> &'static str {
        match self {
            UnitState::Pending => "pending",
            UnitState::Processing => "processing",
            UnitState::Done => "done",
            UnitState::Error => "error",
        }
    }

    /// True for `done` and `error`.
    pub fn is_terminal(self) -> bool {
        matches!(self, UnitState::Done | UnitState::Error)
    }
}

/// Authoritative state of one work unit, stored as `_subject.json` or
/// `_trial.json` next to the unit's data.
///
/// Unknown fields written by other tools survive a read-modify-write through
/// `extra`. A record without `state` reads as `pending`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusRecord {
    /// Current state.
    #[serde(default)]
    pub state: UnitState,
    /// When the record was last written.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    /// Worker that wrote the record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<String>,
    /// Every other field, preserved verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl StatusRecord {
    /// Fresh record stamped now.
    pub fn new(state: UnitState, worker: &str) -> Self {
        Self {
            state,
            updated_at: Some(Utc::now()),
            worker: Some(worker.to_string()),
            extra: Map::new(),
        }
    }

    /// Keep `self`'s extra fields while moving to `state`.
    pub fn advance(&self, state: UnitState, worker: &str) -> Self {
        Self {
            state,
            updated_at: Some(Utc::now()),
            worker: Some(worker.to_string()),
            extra: self.extra.clone(),
        }
    }

    /// Set one extra field.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.extra.insert(key.to_string(), value.into());
        self
    }

    /// Engine exit code recorded by a failed run.
    pub fn exit_code(&self) -> Option<i64> {
        self.extra.get("exit_code").and_then(Value::as_i64)
    }

    /// Time since the record was last written, when it carries a stamp.
    pub fn age(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        self.updated_at.map(|at| now - at)
    }

    /// Decode a record; anything but a JSON object is
    /// [`SyncError::CorruptStatus`].
    pub fn parse(path: &str, bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|err| SyncError::CorruptStatus {
            path: path.to_string(),
            reason: err.to_string(),
        })
    }
}

/// Read the record at `path`. An absent object means `pending`.
pub async fn read_status(index: &ObjectStoreIndex, path: &str) -> Result<StatusRecord> {
    if !index.exists(path) {
        return Ok(StatusRecord::default());
    }
    match index.get_bytes(path).await {
        Ok(bytes) => StatusRecord::parse(path, &bytes),
        // Deleted remotely since the last refresh.
        Err(err) if err.is_not_found() => Ok(StatusRecord::default()),
        Err(err) => Err(err),
    }
}

/// Replace the record at `path`.
pub async fn write_status(index: &ObjectStoreIndex, path: &str, record: &StatusRecord) -> Result<()> {
    index.upload_json(path, record).await?;
    info!(unit = %path, state = record.state.as_str(), "status written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unknown_fields_survive_round_trip() {
        let raw = br#"{"state":"done","mass_kg":71.5,"sex":"f"}"#;
        let record = StatusRecord::parse("s/_subject.json", raw).unwrap();
        assert_eq!(record.state, UnitState::Done);

        let next = record.advance(UnitState::Processing, "w1");
        let value = serde_json::to_value(&next).unwrap();
        assert_eq!(value["state"], "processing");
        assert_eq!(value["mass_kg"], 71.5);
        assert_eq!(value["worker"], "w1");
    }

    #[test]
    fn missing_state_reads_as_pending() {
        let record = StatusRecord::parse("s/_subject.json", b"{}").unwrap();
        assert_eq!(record.state, UnitState::Pending);
    }

    #[test]
    fn garbage_is_corrupt() {
        for raw in [&b"not json"[..], br#"{"state":"exploded"}"#, b"[1,2]"] {
            let err = StatusRecord::parse("s/_trial.json", raw).unwrap_err();
            assert!(matches!(err, SyncError::CorruptStatus { .. }), "{err}");
        }
    }

    #[test]
    fn exit_code_comes_from_extra() {
        let record = StatusRecord::new(UnitState::Error, "w1").with("exit_code", json!(3));
        assert_eq!(record.exit_code(), Some(3));
        assert!(record.state.is_terminal());
    }
}
