//! In-process backend used by tests and local development

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, watch};

use super::{RealtimeSubscription, RemoteStore};
use crate::error::{Error, Result};
use crate::models::{
    Document, DocumentQuery, MetadataModel, RealtimeEvent, RealtimeOperation, SourceSyncKey,
};

const EVENT_BUFFER: usize = 256;
const SUBSCRIPTION_BUFFER: usize = 64;

/// Failure to inject into the next write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Transient,
    Permission,
    Validation,
    /// The write is applied but its reply cannot be decoded
    GarbledReply,
}

impl FailureKind {
    fn into_error(self, id: &str) -> Error {
        match self {
            Self::Transient => Error::TransientNetwork(format!("injected timeout writing '{id}'")),
            Self::Permission => Error::Permission(format!("injected denial writing '{id}'")),
            Self::Validation => Error::Validation(format!("injected rejection of '{id}'")),
            Self::GarbledReply => Error::Serialization(serde::de::Error::custom(format!(
                "injected undecodable reply writing '{id}'"
            ))),
        }
    }
}

/// One accepted write, in arrival order
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteOp {
    Upsert {
        source: String,
        id: String,
        updated_at: i64,
        payload: serde_json::Value,
    },
    Delete {
        source: String,
        id: String,
    },
}

type Partition = BTreeMap<String, Document>;
type Broadcast = (SourceSyncKey, String, RealtimeEvent);

struct BackendState {
    partitions: HashMap<(SourceSyncKey, String), Partition>,
    online: bool,
    monotonic: bool,
    next_failures: VecDeque<FailureKind>,
    document_failures: HashMap<String, FailureKind>,
    ops: Vec<RemoteOp>,
}

/// Shared fake server holding every collection
pub struct MemoryBackend {
    state: Mutex<BackendState>,
    events: broadcast::Sender<Broadcast>,
    disconnect: watch::Sender<u64>,
}

impl MemoryBackend {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let (disconnect, _) = watch::channel(0);
        Arc::new(Self {
            state: Mutex::new(BackendState {
                partitions: HashMap::new(),
                online: true,
                monotonic: false,
                next_failures: VecDeque::new(),
                document_failures: HashMap::new(),
                ops: Vec::new(),
            }),
            events,
            disconnect,
        })
    }

    /// Client for one collection of this backend
    pub fn store(self: &Arc<Self>, source: SourceSyncKey) -> Arc<MemoryRemoteStore> {
        Arc::new(MemoryRemoteStore {
            backend: Arc::clone(self),
            source,
        })
    }

    fn state(&self) -> MutexGuard<'_, BackendState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Toggle reachability. Going offline also drops every subscription.
    pub fn set_online(&self, online: bool) {
        self.state().online = online;
        if !online {
            self.drop_subscriptions();
        }
    }

    /// Reject writes older than the stored `updated_at` with a conflict
    pub fn set_monotonic(&self, monotonic: bool) {
        self.state().monotonic = monotonic;
    }

    /// Fail the next write with the given kind
    pub fn fail_next(&self, kind: FailureKind) {
        self.state().next_failures.push_back(kind);
    }

    /// Fail every write to `id` until cleared
    pub fn fail_document(&self, id: impl Into<String>, kind: FailureKind) {
        self.state().document_failures.insert(id.into(), kind);
    }

    pub fn clear_failures(&self) {
        let mut state = self.state();
        state.next_failures.clear();
        state.document_failures.clear();
    }

    /// Close every open realtime feed, as a network drop would
    pub fn drop_subscriptions(&self) {
        self.disconnect.send_modify(|generation| *generation += 1);
    }

    /// Accepted writes so far
    pub fn ops(&self) -> Vec<RemoteOp> {
        self.state().ops.clone()
    }

    pub fn document(&self, source: &SourceSyncKey, owner: &str, id: &str) -> Option<Document> {
        self.state()
            .partitions
            .get(&(source.clone(), owner.to_string()))
            .and_then(|partition| partition.get(id))
            .cloned()
    }

    pub fn documents(&self, source: &SourceSyncKey, owner: &str) -> Vec<Document> {
        self.state()
            .partitions
            .get(&(source.clone(), owner.to_string()))
            .map(|partition| partition.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Write as another device would: no failure injection, no op log.
    pub fn put(&self, source: &SourceSyncKey, owner: &str, document: Document) {
        let existed = {
            let mut state = self.state();
            state
                .partitions
                .entry((source.clone(), owner.to_string()))
                .or_default()
                .insert(document.id.clone(), document.clone())
                .is_some()
        };
        self.emit(source, owner, &document, existed);
    }

    /// Delete as another device would
    pub fn remove(&self, source: &SourceSyncKey, owner: &str, id: &str) -> bool {
        let removed = {
            let mut state = self.state();
            state
                .partitions
                .get_mut(&(source.clone(), owner.to_string()))
                .and_then(|partition| partition.remove(id))
                .is_some()
        };
        if removed {
            self.emit_delete(source, owner, id);
        }
        removed
    }

    fn emit(&self, source: &SourceSyncKey, owner: &str, document: &Document, existed: bool) {
        let event = RealtimeEvent {
            operation: if existed {
                RealtimeOperation::Update
            } else {
                RealtimeOperation::Create
            },
            document_id: document.id.clone(),
            payload: Some(document.payload.clone()),
            updated_at: Some(document.updated_at),
        };
        let _ = self.events.send((source.clone(), owner.to_string(), event));
    }

    fn emit_delete(&self, source: &SourceSyncKey, owner: &str, id: &str) {
        let event = RealtimeEvent {
            operation: RealtimeOperation::Delete,
            document_id: id.to_string(),
            payload: None,
            updated_at: None,
        };
        let _ = self.events.send((source.clone(), owner.to_string(), event));
    }

    fn ensure_online(state: &BackendState) -> Result<()> {
        if state.online {
            Ok(())
        } else {
            Err(Error::TransientNetwork("backend unreachable".into()))
        }
    }

    /// Fails a refused write up front. A garbled reply is returned instead,
    /// for the caller to report after applying the write.
    fn check_write(state: &mut BackendState, id: &str) -> Result<Option<Error>> {
        Self::ensure_online(state)?;
        let injected = state
            .next_failures
            .pop_front()
            .or_else(|| state.document_failures.get(id).copied());
        match injected {
            None => Ok(None),
            Some(FailureKind::GarbledReply) => Ok(Some(FailureKind::GarbledReply.into_error(id))),
            Some(kind) => Err(kind.into_error(id)),
        }
    }
}

/// `RemoteStore` over a `MemoryBackend` collection
pub struct MemoryRemoteStore {
    backend: Arc<MemoryBackend>,
    source: SourceSyncKey,
}

/// How a write treats an existing document
#[derive(Clone, Copy)]
enum WriteMode {
    Create,
    Update,
    Upsert,
}

impl MemoryRemoteStore {
    pub fn backend(&self) -> &Arc<MemoryBackend> {
        &self.backend
    }

    fn partition_key(&self, owner: &str) -> (SourceSyncKey, String) {
        (self.source.clone(), owner.to_string())
    }

    fn write(&self, owner: &str, document: &Document, mode: WriteMode) -> Result<Document> {
        let (existed, garbled) = {
            let mut state = self.backend.state();
            let garbled = MemoryBackend::check_write(&mut state, &document.id)?;
            let monotonic = state.monotonic;
            let partition = state.partitions.entry(self.partition_key(owner)).or_default();

            match (mode, partition.get(&document.id)) {
                (WriteMode::Create, Some(_)) => {
                    return Err(Error::Conflict(format!(
                        "document '{}' already exists",
                        document.id
                    )))
                }
                (WriteMode::Update, None) => {
                    return Err(Error::NotFound(format!("document '{}'", document.id)))
                }
                (_, Some(existing)) if monotonic && existing.updated_at > document.updated_at => {
                    return Err(Error::Conflict(format!(
                        "document '{}' is at {} on the server, refusing {}",
                        document.id, existing.updated_at, document.updated_at
                    )))
                }
                _ => {}
            }

            let existed = partition
                .insert(document.id.clone(), document.clone())
                .is_some();
            state.ops.push(RemoteOp::Upsert {
                source: self.source.to_string(),
                id: document.id.clone(),
                updated_at: document.updated_at,
                payload: document.payload.clone(),
            });
            (existed, garbled)
        };
        self.backend.emit(&self.source, owner, document, existed);
        match garbled {
            Some(error) => Err(error),
            None => Ok(document.clone()),
        }
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    fn source(&self) -> &SourceSyncKey {
        &self.source
    }

    async fn get(&self, owner: &str, id: &str) -> Result<Option<Document>> {
        let state = self.backend.state();
        MemoryBackend::ensure_online(&state)?;
        Ok(state
            .partitions
            .get(&self.partition_key(owner))
            .and_then(|partition| partition.get(id))
            .cloned())
    }

    async fn list(&self, owner: &str, query: &DocumentQuery) -> Result<Vec<Document>> {
        query.validate()?;
        let state = self.backend.state();
        MemoryBackend::ensure_online(&state)?;
        let mut documents: Vec<Document> = state
            .partitions
            .get(&self.partition_key(owner))
            .map(|partition| {
                partition
                    .values()
                    .filter(|document| query.matches(&document.payload))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        documents.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.id.cmp(&b.id)));
        Ok(query.page(documents))
    }

    async fn create(&self, owner: &str, document: &Document) -> Result<Document> {
        self.write(owner, document, WriteMode::Create)
    }

    async fn update(&self, owner: &str, document: &Document) -> Result<Document> {
        self.write(owner, document, WriteMode::Update)
    }

    async fn upsert(&self, owner: &str, document: &Document) -> Result<Document> {
        self.write(owner, document, WriteMode::Upsert)
    }

    async fn delete_by_id(&self, owner: &str, id: &str) -> Result<()> {
        let garbled = {
            let mut state = self.backend.state();
            let garbled = MemoryBackend::check_write(&mut state, id)?;
            let removed = state
                .partitions
                .get_mut(&self.partition_key(owner))
                .and_then(|partition| partition.remove(id));
            if removed.is_none() {
                return Err(Error::NotFound(format!("document '{id}'")));
            }
            state.ops.push(RemoteOp::Delete {
                source: self.source.to_string(),
                id: id.to_string(),
            });
            garbled
        };
        self.backend.emit_delete(&self.source, owner, id);
        garbled.map_or(Ok(()), Err)
    }

    async fn delete_by_filter(&self, owner: &str, query: &DocumentQuery) -> Result<usize> {
        query.validate()?;
        let removed: Vec<String> = {
            let mut state = self.backend.state();
            MemoryBackend::ensure_online(&state)?;
            let Some(partition) = state.partitions.get_mut(&self.partition_key(owner)) else {
                return Ok(0);
            };
            let ids: Vec<String> = partition
                .values()
                .filter(|document| query.matches(&document.payload))
                .map(|document| document.id.clone())
                .collect();
            for id in &ids {
                partition.remove(id);
            }
            for id in &ids {
                state.ops.push(RemoteOp::Delete {
                    source: self.source.to_string(),
                    id: id.clone(),
                });
            }
            ids
        };
        for id in &removed {
            self.backend.emit_delete(&self.source, owner, id);
        }
        Ok(removed.len())
    }

    async fn metadata(&self, owner: &str) -> Result<Vec<MetadataModel>> {
        let state = self.backend.state();
        MemoryBackend::ensure_online(&state)?;
        Ok(state
            .partitions
            .get(&self.partition_key(owner))
            .map(|partition| partition.values().map(Document::metadata).collect())
            .unwrap_or_default())
    }

    async fn subscribe(&self, owner: &str) -> Result<RealtimeSubscription> {
        MemoryBackend::ensure_online(&self.backend.state())?;

        let mut events = self.backend.events.subscribe();
        let mut disconnect = self.backend.disconnect.subscribe();
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let source = self.source.clone();
        let owner = owner.to_string();

        let reader = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = disconnect.changed() => break,
                    received = events.recv() => match received {
                        Ok((event_source, event_owner, event)) => {
                            if event_source == source
                                && event_owner == owner
                                && tx.send(event).await.is_err()
                            {
                                break;
                            }
                        }
                        // Missed events: close the feed so the consumer resyncs.
                        Err(broadcast::error::RecvError::Lagged(_) | broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });

        Ok(RealtimeSubscription::new(rx, reader))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const OWNER: &str = "user-1";

    fn setup() -> (Arc<MemoryBackend>, Arc<MemoryRemoteStore>) {
        let backend = MemoryBackend::new();
        let store = backend.store(SourceSyncKey::new("homeworks").unwrap());
        (backend, store)
    }

    fn doc(id: &str, updated_at: i64) -> Document {
        Document::new(id, updated_at, json!({"title": id})).unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_crud_semantics() {
        let (backend, store) = setup();

        store.create(OWNER, &doc("a", 1)).await.unwrap();
        assert!(matches!(store.create(OWNER, &doc("a", 2)).await, Err(Error::Conflict(_))));
        assert!(matches!(store.update(OWNER, &doc("b", 2)).await, Err(Error::NotFound(_))));
        store.update(OWNER, &doc("a", 3)).await.unwrap();
        store.upsert(OWNER, &doc("b", 4)).await.unwrap();

        assert_eq!(store.get(OWNER, "a").await.unwrap().unwrap().updated_at, 3);
        assert_eq!(store.metadata(OWNER).await.unwrap().len(), 2);
        assert!(store.metadata("other-user").await.unwrap().is_empty());

        store.delete_by_id(OWNER, "a").await.unwrap();
        assert!(matches!(store.delete_by_id(OWNER, "a").await, Err(Error::NotFound(_))));
        assert_eq!(backend.ops().len(), 4);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_monotonic_validation() {
        let (backend, store) = setup();
        backend.set_monotonic(true);

        store.upsert(OWNER, &doc("a", 200)).await.unwrap();
        assert!(matches!(store.upsert(OWNER, &doc("a", 150)).await, Err(Error::Conflict(_))));
        // Same stamp again is an idempotent retry.
        store.upsert(OWNER, &doc("a", 200)).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failure_injection_and_offline() {
        let (backend, store) = setup();

        backend.fail_next(FailureKind::Validation);
        assert!(matches!(store.upsert(OWNER, &doc("a", 1)).await, Err(Error::Validation(_))));
        store.upsert(OWNER, &doc("a", 1)).await.unwrap();

        backend.fail_document("b", FailureKind::Permission);
        assert!(store.upsert(OWNER, &doc("b", 1)).await.unwrap_err().is_rejection());
        backend.clear_failures();
        store.upsert(OWNER, &doc("b", 1)).await.unwrap();

        backend.fail_next(FailureKind::GarbledReply);
        assert!(matches!(store.upsert(OWNER, &doc("c", 3)).await, Err(Error::Serialization(_))));
        assert_eq!(store.get(OWNER, "c").await.unwrap().map(|d| d.updated_at), Some(3));

        backend.set_online(false);
        assert!(store.get(OWNER, "a").await.unwrap_err().is_retryable());
        assert!(store.subscribe(OWNER).await.is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_delete_by_filter_and_list() {
        let (_backend, store) = setup();
        for (id, week) in [("a", 1), ("b", 2), ("c", 1)] {
            let document = Document::new(id, 1, json!({"week": week})).unwrap();
            store.upsert(OWNER, &document).await.unwrap();
        }

        let week1 = DocumentQuery::all().where_eq("week", 1);
        assert_eq!(store.list(OWNER, &week1).await.unwrap().len(), 2);
        assert_eq!(store.delete_by_filter(OWNER, &week1).await.unwrap(), 2);
        assert_eq!(store.list(OWNER, &DocumentQuery::all()).await.unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_subscription_receives_own_collection_only() {
        let (backend, store) = setup();
        let mut subscription = store.subscribe(OWNER).await.unwrap();

        let other = backend.store(SourceSyncKey::new("subjects").unwrap());
        other.upsert(OWNER, &doc("x", 1)).await.unwrap();
        store.upsert("other-user", &doc("y", 1)).await.unwrap();
        store.upsert(OWNER, &doc("a", 5)).await.unwrap();
        store.upsert(OWNER, &doc("a", 6)).await.unwrap();
        store.delete_by_id(OWNER, "a").await.unwrap();

        let created = subscription.next().await.unwrap();
        assert_eq!(created.operation, RealtimeOperation::Create);
        assert_eq!(created.document_id, "a");
        assert_eq!(created.updated_at, Some(5));
        assert_eq!(subscription.next().await.unwrap().operation, RealtimeOperation::Update);
        assert_eq!(subscription.next().await.unwrap().operation, RealtimeOperation::Delete);

        backend.drop_subscriptions();
        assert!(subscription.next().await.is_none());
    }
}
