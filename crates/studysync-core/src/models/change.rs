//! Offline change model

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{Error, Result};

/// A unique identifier for a queued change, using UUID v7 (time-sortable)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChangeId(Uuid);

impl ChangeId {
    /// Create a new unique change ID using UUID v7
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Get the string representation of this ID
    #[must_use]
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for ChangeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ChangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ChangeId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Identifier of a remote collection / document family (e.g. `organizations`).
///
/// Partitions the change queue and selects the local table partition and the
/// remote collection. Only ASCII alphanumerics, `-` and `_` are accepted so the
/// key can be embedded in URLs and SQL parameters verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SourceSyncKey(String);

impl SourceSyncKey {
    pub fn new(value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(Error::InvalidInput("source key must not be empty".into()));
        }
        if !trimmed
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(Error::InvalidInput(format!(
                "source key '{trimmed}' may only contain letters, digits, '-' and '_'"
            )));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceSyncKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for SourceSyncKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl TryFrom<String> for SourceSyncKey {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<SourceSyncKey> for String {
    fn from(value: SourceSyncKey) -> Self {
        value.0
    }
}

/// Kind of mutation recorded in the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOperation {
    Upsert,
    Delete,
}

impl ChangeOperation {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Upsert => "upsert",
            Self::Delete => "delete",
        }
    }
}

impl FromStr for ChangeOperation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "upsert" => Ok(Self::Upsert),
            "delete" => Ok(Self::Delete),
            other => Err(Error::Database(format!("unknown change operation '{other}'"))),
        }
    }
}

/// A pending offline mutation.
///
/// At most one change exists per `(source_key, document_id)`; enqueuing a newer
/// one replaces the payload and issues a fresh `id`, so an in-flight drain that
/// acknowledges the old `id` leaves the newer intent in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfflineChange {
    pub id: ChangeId,
    pub source_key: SourceSyncKey,
    pub operation: ChangeOperation,
    /// JSON-encoded document payload; `None` for deletions
    pub payload: Option<Vec<u8>>,
    pub document_id: String,
    /// Watermark the local write was stamped with (Unix ms)
    pub updated_at: i64,
    /// When the change entered the queue (Unix ms)
    pub enqueued_at: i64,
}

impl OfflineChange {
    /// Record an upsert of `payload` for `document_id`
    pub fn upsert(
        source_key: SourceSyncKey,
        document_id: impl Into<String>,
        payload: &serde_json::Value,
        updated_at: i64,
    ) -> Result<Self> {
        Ok(Self {
            id: ChangeId::new(),
            source_key,
            operation: ChangeOperation::Upsert,
            payload: Some(serde_json::to_vec(payload)?),
            document_id: document_id.into(),
            updated_at,
            enqueued_at: chrono::Utc::now().timestamp_millis(),
        })
    }

    /// Record a deletion (tombstone) of `document_id`
    #[must_use]
    pub fn delete(source_key: SourceSyncKey, document_id: impl Into<String>, updated_at: i64) -> Self {
        Self {
            id: ChangeId::new(),
            source_key,
            operation: ChangeOperation::Delete,
            payload: None,
            document_id: document_id.into(),
            updated_at,
            enqueued_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Decode the payload as JSON
    pub fn payload_json(&self) -> Result<Option<serde_json::Value>> {
        self.payload
            .as_deref()
            .map(serde_json::from_slice::<serde_json::Value>)
            .transpose()
            .map_err(Error::from)
    }
}

/// A change the backend refused for good, held for manual resolution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParkedChange {
    pub change: OfflineChange,
    pub reason: String,
    pub parked_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn change_id_parse_roundtrip() {
        let id = ChangeId::new();
        let parsed: ChangeId = id.as_str().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn source_key_validation() {
        assert!(SourceSyncKey::new("calendar-settings").is_ok());
        assert!(SourceSyncKey::new("home_works2").is_ok());
        assert!(SourceSyncKey::new("  ").is_err());
        assert!(SourceSyncKey::new("../etc").is_err());
        assert_eq!(
            SourceSyncKey::new(" organizations ").unwrap().as_str(),
            "organizations"
        );
    }

    #[test]
    fn source_key_deserialize_rejects_invalid() {
        let parsed: std::result::Result<SourceSyncKey, _> = serde_json::from_str("\"a b\"");
        assert!(parsed.is_err());
    }

    #[test]
    fn upsert_change_carries_json_payload() {
        let key = SourceSyncKey::new("organizations").unwrap();
        let change =
            OfflineChange::upsert(key, "org-1", &serde_json::json!({"name": "Lyceum"}), 100)
                .unwrap();
        assert_eq!(change.operation, ChangeOperation::Upsert);
        assert_eq!(
            change.payload_json().unwrap(),
            Some(serde_json::json!({"name": "Lyceum"}))
        );
    }

    #[test]
    fn delete_change_has_no_payload() {
        let key = SourceSyncKey::new("organizations").unwrap();
        let change = OfflineChange::delete(key, "org-1", 100);
        assert!(change.payload.is_none());
        assert_eq!(change.payload_json().unwrap(), None);
    }

    #[test]
    fn operation_parse() {
        assert_eq!("upsert".parse::<ChangeOperation>().unwrap(), ChangeOperation::Upsert);
        assert_eq!("delete".parse::<ChangeOperation>().unwrap(), ChangeOperation::Delete);
        assert!("merge".parse::<ChangeOperation>().is_err());
    }
}
