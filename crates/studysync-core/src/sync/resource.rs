//! Typed facades over a coordinator

use std::marker::PhantomData;
use std::sync::Arc;

use futures::Stream;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;

use super::coordinator::SyncCoordinator;
use crate::db::LocalChange;
use crate::error::Result;
use crate::models::{ChangeId, Document, DocumentQuery, MetadataModel};

/// A decoded document
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Record<T> {
    pub id: String,
    pub updated_at: i64,
    pub value: T,
}

impl<T: DeserializeOwned> Record<T> {
    pub fn from_document(document: Document) -> Result<Self> {
        Ok(Self {
            id: document.id,
            updated_at: document.updated_at,
            value: serde_json::from_value(document.payload)?,
        })
    }
}

fn decode<T: DeserializeOwned>(document: Option<Document>) -> Result<Option<Record<T>>> {
    document.map(Record::from_document).transpose()
}

/// Re-read `id` after every local write that touches it
fn watch_document<T>(
    coordinator: Arc<SyncCoordinator>,
    id: Result<String>,
) -> impl Stream<Item = Result<Option<Record<T>>>> + Send + 'static
where
    T: DeserializeOwned + Send + 'static,
{
    async_stream::stream! {
        let id = match id {
            Ok(id) => id,
            Err(error) => {
                yield Err(error);
                return;
            }
        };
        let mut changes = coordinator.observe();
        loop {
            let current = coordinator.get(&id).await.and_then(decode::<T>);
            let failed = current.is_err();
            yield current;
            if failed {
                return;
            }
            loop {
                match changes.recv().await {
                    Ok(LocalChange::Upserted(changed)) if changed == id => break,
                    Ok(LocalChange::Deleted(ids)) if ids.contains(&id) => break,
                    Ok(LocalChange::Cleared) | Err(RecvError::Lagged(_)) => break,
                    Ok(_) => {}
                    Err(RecvError::Closed) => return,
                }
            }
        }
    }
}

/// Collection keyed by document id (organizations, homework, ...)
pub struct MultipleDocuments<T> {
    coordinator: Arc<SyncCoordinator>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for MultipleDocuments<T> {
    fn clone(&self) -> Self {
        Self::new(Arc::clone(&self.coordinator))
    }
}

impl<T> MultipleDocuments<T> {
    pub const fn new(coordinator: Arc<SyncCoordinator>) -> Self {
        Self {
            coordinator,
            _marker: PhantomData,
        }
    }

    pub const fn coordinator(&self) -> &Arc<SyncCoordinator> {
        &self.coordinator
    }
}

impl<T> MultipleDocuments<T>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    pub async fn add_or_update(&self, id: &str, value: &T) -> Result<Record<T>> {
        let document = self
            .coordinator
            .write(id, serde_json::to_value(value)?)
            .await?;
        Record::from_document(document)
    }

    /// Add under a fresh time-ordered id
    pub async fn insert(&self, value: &T) -> Result<Record<T>> {
        self.add_or_update(&ChangeId::new().as_str(), value).await
    }

    pub async fn get(&self, id: &str) -> Result<Option<Record<T>>> {
        decode(self.coordinator.get(id).await?)
    }

    pub async fn list(&self, query: &DocumentQuery) -> Result<Vec<Record<T>>> {
        self.coordinator
            .list(query)
            .await?
            .into_iter()
            .map(Record::from_document)
            .collect()
    }

    pub async fn fetch_metadata(&self) -> Result<Vec<MetadataModel>> {
        self.coordinator.metadata().await
    }

    pub async fn delete_by_id(&self, id: &str) -> Result<bool> {
        Ok(self.coordinator.remove(&[id.to_string()]).await? > 0)
    }

    pub async fn delete_by_ids(&self, ids: &[String]) -> Result<usize> {
        self.coordinator.remove(ids).await
    }

    /// Delete every local document matching the query, queued like any delete
    pub async fn delete_where(&self, query: &DocumentQuery) -> Result<usize> {
        let ids: Vec<String> = self
            .coordinator
            .list(query)
            .await?
            .into_iter()
            .map(|document| document.id)
            .collect();
        self.coordinator.remove(&ids).await
    }

    /// Delete matching documents on the backend directly. Needs connectivity.
    pub async fn purge_remote(&self, query: &DocumentQuery) -> Result<usize> {
        self.coordinator.purge_remote(query).await
    }

    /// Current value of `id`, then a new item after each local change to it
    pub fn fetch(
        &self,
        id: impl Into<String>,
    ) -> impl Stream<Item = Result<Option<Record<T>>>> + Send + 'static {
        watch_document(Arc::clone(&self.coordinator), Ok(id.into()))
    }

    /// Query result, re-evaluated after every local change to the source
    pub fn watch_list(
        &self,
        query: DocumentQuery,
    ) -> impl Stream<Item = Result<Vec<Record<T>>>> + Send + 'static {
        let coordinator = Arc::clone(&self.coordinator);
        async_stream::stream! {
            let mut changes = coordinator.observe();
            loop {
                let current: Result<Vec<Record<T>>> = match coordinator.list(&query).await {
                    Ok(documents) => documents.into_iter().map(Record::from_document).collect(),
                    Err(error) => Err(error),
                };
                let failed = current.is_err();
                yield current;
                if failed {
                    return;
                }
                if let Err(RecvError::Closed) = changes.recv().await {
                    return;
                }
            }
        }
    }
}

/// One document per user, stored under the user id (settings, ...)
pub struct SingleDocument<T> {
    coordinator: Arc<SyncCoordinator>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for SingleDocument<T> {
    fn clone(&self) -> Self {
        Self::new(Arc::clone(&self.coordinator))
    }
}

impl<T> SingleDocument<T> {
    pub const fn new(coordinator: Arc<SyncCoordinator>) -> Self {
        Self {
            coordinator,
            _marker: PhantomData,
        }
    }

    pub const fn coordinator(&self) -> &Arc<SyncCoordinator> {
        &self.coordinator
    }
}

impl<T> SingleDocument<T>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    pub async fn add_or_update(&self, value: &T) -> Result<Record<T>> {
        let owner = self.coordinator.owner()?;
        let document = self
            .coordinator
            .write(&owner, serde_json::to_value(value)?)
            .await?;
        Record::from_document(document)
    }

    pub async fn get(&self) -> Result<Option<Record<T>>> {
        let owner = self.coordinator.owner()?;
        decode(self.coordinator.get(&owner).await?)
    }

    /// Watermark of the local copy, a pending write included
    pub async fn fetch_metadata(&self) -> Result<Option<MetadataModel>> {
        let owner = self.coordinator.owner()?;
        Ok(self
            .coordinator
            .get(&owner)
            .await?
            .map(|document| document.metadata()))
    }

    pub async fn delete(&self) -> Result<bool> {
        let owner = self.coordinator.owner()?;
        Ok(self.coordinator.remove(&[owner]).await? > 0)
    }

    /// Current value, then a new item after each local change to it
    pub fn fetch(&self) -> impl Stream<Item = Result<Option<Record<T>>>> + Send + 'static {
        watch_document(Arc::clone(&self.coordinator), self.coordinator.owner())
    }
}
