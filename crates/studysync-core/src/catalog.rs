//! The study-data sources the application syncs, and registry wiring for them.

use std::sync::Arc;

use crate::config::{BackendConfig, EngineConfig};
use crate::error::Result;
use crate::models::{Organization, Settings, SourceSyncKey};
use crate::remote::{HttpRemoteStore, MemoryBackend, RemoteStore};
use crate::services::DatabaseService;
use crate::sync::{MultipleDocuments, ResourceKind, SingleDocument, SyncContext, SyncRegistry};

pub const ORGANIZATIONS: &str = "organizations";
pub const SCHEDULES: &str = "schedules";
pub const HOMEWORKS: &str = "homeworks";
pub const SUBJECTS: &str = "subjects";
pub const EMPLOYEES: &str = "employees";
pub const SETTINGS: &str = "settings";
pub const CALENDAR_SETTINGS: &str = "calendar-settings";

/// Every synced source with its shape
pub const SOURCES: [(&str, ResourceKind); 7] = [
    (ORGANIZATIONS, ResourceKind::Multiple),
    (SCHEDULES, ResourceKind::Multiple),
    (HOMEWORKS, ResourceKind::Multiple),
    (SUBJECTS, ResourceKind::Multiple),
    (EMPLOYEES, ResourceKind::Multiple),
    (SETTINGS, ResourceKind::Single),
    (CALENDAR_SETTINGS, ResourceKind::Single),
];

pub fn source_key(name: &str) -> Result<SourceSyncKey> {
    SourceSyncKey::new(name)
}

/// Register every catalog source, building its remote with `remote_for`
pub fn build_registry(
    service: &DatabaseService,
    context: SyncContext,
    mut remote_for: impl FnMut(SourceSyncKey) -> Result<Arc<dyn RemoteStore>>,
) -> Result<SyncRegistry> {
    let mut builder = SyncRegistry::builder(service.clone(), context);
    for (name, kind) in SOURCES {
        builder = builder.register(kind, remote_for(source_key(name)?)?)?;
    }
    Ok(builder.build())
}

/// Catalog registry over the HTTP backend, one connection pool for all sources
pub fn http_registry(
    service: &DatabaseService,
    context: SyncContext,
    backend: BackendConfig,
    config: &EngineConfig,
) -> Result<SyncRegistry> {
    backend.validate()?;
    let client = reqwest::Client::builder()
        .timeout(backend.request_timeout())
        .build()?;
    let backend = Arc::new(backend);
    let capacity = config.channel_capacity;
    build_registry(service, context, |source| {
        Ok(Arc::new(HttpRemoteStore::with_client(
            client.clone(),
            Arc::clone(&backend),
            source,
            capacity,
        )))
    })
}

/// Catalog registry over an in-process backend
pub fn memory_registry(
    service: &DatabaseService,
    context: SyncContext,
    backend: &Arc<MemoryBackend>,
) -> Result<SyncRegistry> {
    build_registry(service, context, |source| Ok(backend.store(source)))
}

pub fn organizations(registry: &SyncRegistry) -> Result<MultipleDocuments<Organization>> {
    registry.multiple(&source_key(ORGANIZATIONS)?)
}

pub fn settings(registry: &SyncRegistry) -> Result<SingleDocument<Settings>> {
    registry.single(&source_key(SETTINGS)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::SessionHandle;

    #[tokio::test(flavor = "multi_thread")]
    async fn memory_registry_registers_whole_catalog() {
        let service = DatabaseService::open_in_memory().await.unwrap();
        let context = SyncContext::new(&service, Arc::new(SessionHandle::signed_in("user-1")));
        let registry = memory_registry(&service, context, &MemoryBackend::new()).unwrap();

        assert_eq!(registry.sources().count(), SOURCES.len());
        assert_eq!(
            registry.kind(&source_key(CALENDAR_SETTINGS).unwrap()),
            Some(ResourceKind::Single)
        );
        assert!(organizations(&registry).is_ok());
        assert!(settings(&registry).is_ok());
        assert!(registry
            .single::<Settings>(&source_key(HOMEWORKS).unwrap())
            .is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn http_registry_rejects_invalid_backend() {
        let service = DatabaseService::open_in_memory().await.unwrap();
        let context = SyncContext::new(&service, Arc::new(SessionHandle::signed_in("user-1")));
        let mut backend = BackendConfig::new("https://api.example.com", "key").unwrap();
        backend.realtime_url = Some("https://not-a-socket.example.com".into());

        assert!(http_registry(&service, context, backend, &EngineConfig::default()).is_err());
    }
}
