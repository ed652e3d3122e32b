//! Realtime change-feed event model

use serde::{Deserialize, Serialize};

use super::Document;
use crate::error::{Error, Result};

/// Operation reported by the realtime channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RealtimeOperation {
    Create,
    Update,
    Delete,
}

/// One event delivered on a collection subscription.
///
/// Wire form: `{ "event": "update", "document_id": "..", "payload": {..}, "updated_at": 123 }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealtimeEvent {
    #[serde(rename = "event")]
    pub operation: RealtimeOperation,
    pub document_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<i64>,
}

impl RealtimeEvent {
    /// Watermark of the event, falling back to the payload's `updated_at` field
    pub fn watermark(&self) -> Option<i64> {
        self.updated_at.or_else(|| {
            self.payload
                .as_ref()
                .and_then(|payload| payload.get("updated_at"))
                .and_then(serde_json::Value::as_i64)
        })
    }

    /// Convert a create/update event into the document it carries
    pub fn to_document(&self) -> Result<Document> {
        if self.operation == RealtimeOperation::Delete {
            return Err(Error::InvalidInput(format!(
                "delete event for '{}' carries no document",
                self.document_id
            )));
        }
        let updated_at = self.watermark().ok_or_else(|| {
            Error::InvalidInput(format!(
                "realtime event for '{}' is missing updated_at",
                self.document_id
            ))
        })?;
        let mut payload = self.payload.clone().ok_or_else(|| {
            Error::InvalidInput(format!(
                "realtime event for '{}' is missing its payload",
                self.document_id
            ))
        })?;
        if let Some(fields) = payload.as_object_mut() {
            fields.remove("id");
            fields.remove("updated_at");
        }
        Document::new(self.document_id.clone(), updated_at, payload)
    }
}
