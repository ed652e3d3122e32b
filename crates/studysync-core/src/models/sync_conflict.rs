//! Sync conflict model

use serde::{Deserialize, Serialize};

/// Recorded sync conflict resolved by a deterministic strategy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConflict {
    /// Conflict row identifier
    pub id: i64,
    /// Source the document belongs to
    pub source_key: String,
    /// Document involved in the conflict
    pub document_id: String,
    /// Local watermark when the conflict occurred
    pub local_updated_at: i64,
    /// Incoming (remote or realtime) watermark
    pub incoming_updated_at: i64,
    /// Resolution timestamp (unix ms)
    pub resolved_at: i64,
    /// Resolution strategy name
    pub strategy: String,
}

/// How a conflict was resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    /// Remote copy was newer (or equal); the queued local write was dropped
    RemoteWins,
    /// Local write was sent although the remote copy was newer
    LocalOverwrites,
    /// Realtime event older than the local row was ignored
    StaleEvent,
    /// Local row newer than remote with nothing queued; remote copy restored
    RemoteAuthoritative,
}

impl ConflictStrategy {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RemoteWins => "remote_wins",
            Self::LocalOverwrites => "local_overwrites",
            Self::StaleEvent => "stale_event",
            Self::RemoteAuthoritative => "remote_authoritative",
        }
    }
}
