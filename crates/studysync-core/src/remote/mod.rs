//! Remote document store adapters

mod http;
mod memory;
mod realtime;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::models::{Document, DocumentQuery, MetadataModel, RealtimeEvent, SourceSyncKey};

pub use http::HttpRemoteStore;
pub use memory::{FailureKind, MemoryBackend, MemoryRemoteStore, RemoteOp};
pub use realtime::WebSocketRealtime;

/// Client for one remote collection, scoped by owner.
///
/// The remote copy is the source of truth. Implementations only move
/// documents; reconciliation lives in the sync coordinator.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    fn source(&self) -> &SourceSyncKey;

    async fn get(&self, owner: &str, id: &str) -> Result<Option<Document>>;

    async fn list(&self, owner: &str, query: &DocumentQuery) -> Result<Vec<Document>>;

    /// Insert a document that must not exist yet
    async fn create(&self, owner: &str, document: &Document) -> Result<Document>;

    /// Replace a document that must already exist
    async fn update(&self, owner: &str, document: &Document) -> Result<Document>;

    /// Insert or replace. Re-sending the same document is harmless.
    async fn upsert(&self, owner: &str, document: &Document) -> Result<Document>;

    /// Fails with `Error::NotFound` when the document does not exist
    async fn delete_by_id(&self, owner: &str, id: &str) -> Result<()>;

    async fn delete_by_filter(&self, owner: &str, query: &DocumentQuery) -> Result<usize>;

    /// `(id, updated_at)` projection of every document
    async fn metadata(&self, owner: &str) -> Result<Vec<MetadataModel>>;

    /// Open a realtime change feed for this collection
    async fn subscribe(&self, owner: &str) -> Result<RealtimeSubscription>;
}

/// Live change feed. Dropping it stops the background reader.
pub struct RealtimeSubscription {
    events: mpsc::Receiver<RealtimeEvent>,
    reader: Option<JoinHandle<()>>,
}

impl RealtimeSubscription {
    pub const fn new(events: mpsc::Receiver<RealtimeEvent>, reader: JoinHandle<()>) -> Self {
        Self {
            events,
            reader: Some(reader),
        }
    }

    /// Next event, `None` once the feed is closed
    pub async fn next(&mut self) -> Option<RealtimeEvent> {
        self.events.recv().await
    }
}

impl std::fmt::Debug for RealtimeSubscription {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("RealtimeSubscription")
            .field("buffered", &self.events.len())
            .field("closed", &self.events.is_closed())
            .field("reading", &self.reader.as_ref().is_some_and(|reader| !reader.is_finished()))
            .finish()
    }
}

impl Drop for RealtimeSubscription {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}
