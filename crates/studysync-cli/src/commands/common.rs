use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use studysync_core::catalog;
use studysync_core::models::{parse_filter, ParkedChange, SyncConflict};
use studysync_core::providers::SessionHandle;
use studysync_core::remote::MemoryBackend;
use studysync_core::sync::{DiffReport, ResourceKind, SyncCoordinator};
use studysync_core::config::normalize_text_option;
use studysync_core::{
    BackendConfig, DatabaseService, Document, DocumentQuery, EngineConfig, OfflineChange,
    SourceSyncKey, SyncContext, SyncRegistry, SyncReport,
};

use crate::config_profiles::CliProfilesConfig;
use crate::error::CliError;

const PREVIEW_CHARS: usize = 60;

/// Where remote calls go
pub enum RemoteMode {
    Http(BackendConfig),
    /// In-process backend, used by tests
    Memory(Arc<MemoryBackend>),
    /// No backend configured; local commands only
    Detached,
}

/// Profile settings after env overrides
#[derive(Debug)]
pub struct ResolvedProfile {
    pub name: String,
    pub user_id: String,
    pub backend: Option<BackendConfig>,
}

/// Resolve the profile, letting `STUDYSYNC_*` variables override it
pub fn resolve_profile(explicit: Option<&str>) -> Result<ResolvedProfile, CliError> {
    let config = CliProfilesConfig::load().map_err(CliError::Config)?;
    let env_backend = BackendConfig::from_env()?;
    let env_user = normalize_text_option(env::var("STUDYSYNC_USER_ID").ok());
    resolve_profile_from(&config, explicit, env_backend, env_user)
}

pub fn resolve_profile_from(
    config: &CliProfilesConfig,
    explicit: Option<&str>,
    env_backend: Option<BackendConfig>,
    env_user: Option<String>,
) -> Result<ResolvedProfile, CliError> {
    let name = config.resolve_profile_name(explicit);
    let profile = config.profile(&name).cloned().unwrap_or_default();
    let backend = match env_backend {
        Some(backend) => Some(backend),
        None => profile.backend().map_err(CliError::Config)?,
    };
    Ok(ResolvedProfile {
        user_id: env_user.unwrap_or_else(|| profile.user_id()),
        name,
        backend,
    })
}

/// Open database plus the catalog registry for one user
pub struct Workspace {
    pub registry: Arc<SyncRegistry>,
    pub engine: EngineConfig,
    remote_configured: bool,
}

impl Workspace {
    pub async fn open(db_path: &Path, profile: ResolvedProfile) -> Result<Self, CliError> {
        let service = open_database(db_path).await?;
        let remote = profile
            .backend
            .map_or(RemoteMode::Detached, RemoteMode::Http);
        Self::with_remote(service, &profile.user_id, EngineConfig::from_env()?, remote)
    }

    pub fn with_remote(
        service: DatabaseService,
        user_id: &str,
        engine: EngineConfig,
        remote: RemoteMode,
    ) -> Result<Self, CliError> {
        let session = Arc::new(SessionHandle::signed_in(user_id));
        let context = SyncContext::new(&service, session).with_policy(engine.policy());
        let (registry, remote_configured) = match remote {
            RemoteMode::Http(backend) => (
                catalog::http_registry(&service, context, backend, &engine)?,
                true,
            ),
            RemoteMode::Memory(backend) => {
                (catalog::memory_registry(&service, context, &backend)?, true)
            }
            RemoteMode::Detached => {
                let backend = MemoryBackend::new();
                backend.set_online(false);
                (catalog::memory_registry(&service, context, &backend)?, false)
            }
        };
        Ok(Self {
            registry: Arc::new(registry),
            engine,
            remote_configured,
        })
    }

    pub const fn require_backend(&self) -> Result<(), CliError> {
        if self.remote_configured {
            Ok(())
        } else {
            Err(CliError::SyncNotConfigured)
        }
    }

    pub fn coordinator(&self, source: &str) -> Result<&Arc<SyncCoordinator>, CliError> {
        Ok(self.registry.get(&source_key(source)?)?)
    }

    pub fn kind(&self, source: &str) -> Result<ResourceKind, CliError> {
        let key = source_key(source)?;
        self.registry.get(&key)?;
        Ok(self.registry.kind(&key).unwrap_or(ResourceKind::Multiple))
    }
}

pub fn source_key(raw: &str) -> Result<SourceSyncKey, CliError> {
    Ok(SourceSyncKey::new(raw)?)
}

pub fn resolve_db_path(cli_db_path: Option<PathBuf>) -> PathBuf {
    cli_db_path
        .or_else(|| env::var_os("STUDYSYNC_DB_PATH").map(PathBuf::from))
        .unwrap_or_else(default_db_path)
}

pub fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("studysync")
        .join("studysync.db")
}

pub async fn open_database(path: &Path) -> Result<DatabaseService, CliError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(DatabaseService::open_path(path.to_path_buf()).await?)
}

/// Build a query from `field=value` filters
pub fn build_query(filters: &[String], limit: Option<usize>) -> Result<DocumentQuery, CliError> {
    let mut query = DocumentQuery::all();
    for raw in filters {
        let filter = parse_filter(raw)?;
        query = query.where_eq(filter.field, filter.value);
    }
    if let Some(limit) = limit {
        query = query.limit(limit);
    }
    query.validate()?;
    Ok(query)
}

pub fn parse_document_json(raw: &str) -> Result<serde_json::Value, CliError> {
    let value: serde_json::Value = serde_json::from_str(raw.trim())
        .map_err(|error| CliError::InvalidDocument(error.to_string()))?;
    if value.is_object() {
        Ok(value)
    } else {
        Err(CliError::InvalidDocument(format!("got {value}")))
    }
}

pub fn normalize_document_id(id: &str) -> Result<String, CliError> {
    let id = id.trim();
    if id.is_empty() {
        Err(CliError::EmptyDocumentId)
    } else {
        Ok(id.to_string())
    }
}

#[derive(Debug, Serialize)]
pub struct DocumentItem {
    pub id: String,
    pub updated_at: i64,
    pub updated_at_iso: String,
    pub payload: serde_json::Value,
}

pub fn document_to_item(document: &Document) -> DocumentItem {
    DocumentItem {
        id: document.id.clone(),
        updated_at: document.updated_at,
        updated_at_iso: format_sync_timestamp(document.updated_at),
        payload: document.payload.clone(),
    }
}

pub fn document_preview(payload: &serde_json::Value, max_chars: usize) -> String {
    let rendered = payload.to_string();
    if rendered.chars().count() <= max_chars {
        rendered
    } else {
        let mut truncated: String = rendered.chars().take(max_chars.saturating_sub(3)).collect();
        truncated.push_str("...");
        truncated
    }
}

pub fn format_document_lines(documents: &[Document]) -> Vec<String> {
    documents
        .iter()
        .map(|document| {
            format!(
                "{}  {}  {}",
                document.id,
                format_sync_timestamp(document.updated_at),
                document_preview(&document.payload, PREVIEW_CHARS)
            )
        })
        .collect()
}

#[derive(Debug, Serialize)]
pub struct ChangeItem {
    pub id: String,
    pub source: String,
    pub document_id: String,
    pub operation: String,
    pub updated_at: i64,
    pub enqueued_at: i64,
}

pub fn change_to_item(change: &OfflineChange) -> ChangeItem {
    ChangeItem {
        id: change.id.to_string(),
        source: change.source_key.to_string(),
        document_id: change.document_id.clone(),
        operation: change.operation.as_str().to_string(),
        updated_at: change.updated_at,
        enqueued_at: change.enqueued_at,
    }
}

pub fn format_change_lines(changes: &[OfflineChange]) -> Vec<String> {
    changes
        .iter()
        .map(|change| {
            format!(
                "{}  {:<6}  {}/{}  updated={}",
                change.id,
                change.operation.as_str(),
                change.source_key,
                change.document_id,
                change.updated_at
            )
        })
        .collect()
}

#[derive(Debug, Serialize)]
pub struct ParkedItem {
    #[serde(flatten)]
    pub change: ChangeItem,
    pub reason: String,
    pub parked_at: i64,
    pub parked_at_iso: String,
}

pub fn parked_to_item(parked: &ParkedChange) -> ParkedItem {
    ParkedItem {
        change: change_to_item(&parked.change),
        reason: parked.reason.clone(),
        parked_at: parked.parked_at,
        parked_at_iso: format_sync_timestamp(parked.parked_at),
    }
}

pub fn format_parked_lines(parked: &[ParkedChange]) -> Vec<String> {
    parked
        .iter()
        .map(|entry| {
            format!(
                "{}  {:<6}  {}/{}  parked {}: {}",
                entry.change.id,
                entry.change.operation.as_str(),
                entry.change.source_key,
                entry.change.document_id,
                format_sync_timestamp(entry.parked_at),
                entry.reason
            )
        })
        .collect()
}

#[derive(Debug, Serialize)]
pub struct SyncConflictItem {
    pub id: i64,
    pub source: String,
    pub document_id: String,
    pub local_updated_at: i64,
    pub incoming_updated_at: i64,
    pub resolved_at: i64,
    pub resolved_at_iso: String,
    pub strategy: String,
}

pub fn sync_conflict_to_item(conflict: &SyncConflict) -> SyncConflictItem {
    SyncConflictItem {
        id: conflict.id,
        source: conflict.source_key.clone(),
        document_id: conflict.document_id.clone(),
        local_updated_at: conflict.local_updated_at,
        incoming_updated_at: conflict.incoming_updated_at,
        resolved_at: conflict.resolved_at,
        resolved_at_iso: format_sync_timestamp(conflict.resolved_at),
        strategy: conflict.strategy.clone(),
    }
}

pub fn format_sync_conflict_lines(conflicts: &[SyncConflict]) -> Vec<String> {
    conflicts
        .iter()
        .map(|conflict| {
            format!(
                "{}  {:<20}  {}/{}  local={} incoming={}",
                format_sync_timestamp(conflict.resolved_at),
                conflict.strategy,
                conflict.source_key,
                conflict.document_id,
                conflict.local_updated_at,
                conflict.incoming_updated_at
            )
        })
        .collect()
}

pub fn format_sync_timestamp(timestamp_ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(timestamp_ms).map_or_else(
        || timestamp_ms.to_string(),
        |date_time| date_time.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
    )
}

pub fn format_sync_report(report: &SyncReport) -> String {
    let mut line = format!(
        "{}: pushed {}, superseded {}, parked {}, skipped {}",
        report.source, report.pushed, report.superseded, report.parked, report.skipped
    );
    if let Some(DiffReport {
        fetched,
        updated,
        deleted,
        protected,
        ..
    }) = report.diff
    {
        line.push_str(&format!(
            "; fetched {fetched}, updated {updated}, deleted {deleted}, protected {protected}"
        ));
    }
    let flags: Vec<&str> = [
        (report.blocked, "queue blocked"),
        (report.retry_needed, "retry needed"),
        (report.cancelled, "cancelled"),
        (report.coalesced, "already running"),
    ]
    .into_iter()
    .filter_map(|(set, label)| set.then_some(label))
    .collect();
    if !flags.is_empty() {
        line.push_str(&format!(" ({})", flags.join(", ")));
    }
    line
}
