//! Source key to coordinator wiring, built once at startup

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::cancel::CancelSignal;
use super::coordinator::{SyncContext, SyncCoordinator, SyncReport};
use super::resource::{MultipleDocuments, SingleDocument};
use crate::db::{ChangeQueue, ConflictLog, LibSqlLocalStore, LocalStore};
use crate::error::{Error, Result};
use crate::models::{ChangeId, OfflineChange, SourceSyncKey};
use crate::remote::RemoteStore;
use crate::services::DatabaseService;

/// Shape of a synced resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    /// One document per user, keyed by the user id
    Single,
    /// A collection keyed by document id
    Multiple,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Single => "single",
            Self::Multiple => "multiple",
        })
    }
}

struct Entry {
    kind: ResourceKind,
    coordinator: Arc<SyncCoordinator>,
}

/// Outcome of syncing every registered source
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncSummary {
    pub reports: Vec<SyncReport>,
    /// Sources whose cycle failed, with the error message
    pub failures: Vec<(SourceSyncKey, String)>,
}

impl SyncSummary {
    pub fn retry_needed(&self) -> bool {
        !self.failures.is_empty() || self.reports.iter().any(|report| report.retry_needed)
    }
}

pub struct SyncRegistryBuilder {
    service: DatabaseService,
    context: SyncContext,
    entries: BTreeMap<SourceSyncKey, Entry>,
}

impl SyncRegistryBuilder {
    /// Register a source backed by the shared libSQL replica
    pub fn register(self, kind: ResourceKind, remote: Arc<dyn RemoteStore>) -> Result<Self> {
        let local = Arc::new(LibSqlLocalStore::new(
            self.service.clone(),
            remote.source().clone(),
        ));
        self.register_with(kind, local, remote)
    }

    /// Register a source with its own local store
    pub fn register_with(
        mut self,
        kind: ResourceKind,
        local: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteStore>,
    ) -> Result<Self> {
        let source = remote.source().clone();
        if self.entries.contains_key(&source) {
            return Err(Error::InvalidInput(format!(
                "source '{source}' is registered twice"
            )));
        }
        let coordinator = SyncCoordinator::new(local, remote, self.context.clone())?;
        self.entries.insert(
            source,
            Entry {
                kind,
                coordinator: Arc::new(coordinator),
            },
        );
        Ok(self)
    }

    pub fn build(self) -> SyncRegistry {
        SyncRegistry {
            service: self.service,
            context: self.context,
            entries: self.entries,
        }
    }
}

/// Every synced source and its coordinator
pub struct SyncRegistry {
    service: DatabaseService,
    context: SyncContext,
    entries: BTreeMap<SourceSyncKey, Entry>,
}

impl SyncRegistry {
    pub fn builder(service: DatabaseService, context: SyncContext) -> SyncRegistryBuilder {
        SyncRegistryBuilder {
            service,
            context,
            entries: BTreeMap::new(),
        }
    }

    pub const fn service(&self) -> &DatabaseService {
        &self.service
    }

    pub const fn context(&self) -> &SyncContext {
        &self.context
    }

    pub fn queue(&self) -> &Arc<dyn ChangeQueue> {
        &self.context.queue
    }

    pub fn conflicts(&self) -> &Arc<dyn ConflictLog> {
        &self.context.conflicts
    }

    pub fn get(&self, source: &SourceSyncKey) -> Result<&Arc<SyncCoordinator>> {
        self.entries
            .get(source)
            .map(|entry| &entry.coordinator)
            .ok_or_else(|| Error::NotFound(format!("source '{source}' is not registered")))
    }

    pub fn kind(&self, source: &SourceSyncKey) -> Option<ResourceKind> {
        self.entries.get(source).map(|entry| entry.kind)
    }

    /// Registered sources in key order
    pub fn sources(&self) -> impl Iterator<Item = (&SourceSyncKey, ResourceKind)> {
        self.entries.iter().map(|(source, entry)| (source, entry.kind))
    }

    pub fn coordinators(&self) -> impl Iterator<Item = &Arc<SyncCoordinator>> {
        self.entries.values().map(|entry| &entry.coordinator)
    }

    fn expect_kind(&self, source: &SourceSyncKey, kind: ResourceKind) -> Result<Arc<SyncCoordinator>> {
        let entry = self
            .entries
            .get(source)
            .ok_or_else(|| Error::NotFound(format!("source '{source}' is not registered")))?;
        if entry.kind != kind {
            return Err(Error::InvalidInput(format!(
                "source '{source}' is a {} resource, not {kind}",
                entry.kind
            )));
        }
        Ok(Arc::clone(&entry.coordinator))
    }

    pub fn single<T>(&self, source: &SourceSyncKey) -> Result<SingleDocument<T>>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
    {
        Ok(SingleDocument::new(self.expect_kind(source, ResourceKind::Single)?))
    }

    pub fn multiple<T>(&self, source: &SourceSyncKey) -> Result<MultipleDocuments<T>>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
    {
        Ok(MultipleDocuments::new(self.expect_kind(source, ResourceKind::Multiple)?))
    }

    pub async fn sync_source(&self, source: &SourceSyncKey, cancel: &CancelSignal) -> Result<SyncReport> {
        self.get(source)?.sync(cancel).await
    }

    /// Sync every source in turn. One source failing does not stop the
    /// others, except for local storage failures which abort the run.
    pub async fn sync_all(&self, cancel: &CancelSignal) -> Result<SyncSummary> {
        let mut summary = SyncSummary::default();
        for (source, entry) in &self.entries {
            if cancel.is_cancelled() {
                break;
            }
            match entry.coordinator.sync(cancel).await {
                Ok(report) => summary.reports.push(report),
                Err(error) if error.is_local_storage() => return Err(error),
                Err(error) => {
                    tracing::warn!(source = %source, "sync failed: {error}");
                    summary.failures.push((source.clone(), error.to_string()));
                }
            }
        }
        Ok(summary)
    }

    /// Move a parked change back into its queue and wake its coordinator
    pub async fn requeue_parked(&self, id: &ChangeId) -> Result<OfflineChange> {
        let change = self.context.queue.requeue_parked(id).await?;
        if let Ok(coordinator) = self.get(&change.source_key) {
            coordinator.request_sync();
        }
        Ok(change)
    }
}
