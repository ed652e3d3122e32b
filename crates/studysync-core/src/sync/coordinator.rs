//! Per-source reconciliation: queue drain, metadata diff, realtime apply.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{broadcast, watch, Mutex, Notify};

use super::cancel::CancelSignal;
use super::policy::{ConflictPolicy, PoisonPolicy, SyncPolicy};
use crate::db::{ChangeQueue, ConflictLog, LibSqlChangeQueue, LibSqlConflictLog, LocalChange, LocalStore};
use crate::error::{Error, Result};
use crate::models::{
    ChangeOperation, ConflictStrategy, Document, DocumentQuery, MetadataModel, OfflineChange,
    RealtimeEvent, RealtimeOperation, SourceSyncKey,
};
use crate::providers::{CleanupHook, Clock, SessionProvider, SystemClock};
use crate::remote::{RealtimeSubscription, RemoteStore};
use crate::services::DatabaseService;

/// Where a coordinator is in its cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncPhase {
    Idle,
    Draining,
    Diffing,
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::Draining => "draining",
            Self::Diffing => "diffing",
        })
    }
}

/// Outcome of the metadata diff
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DiffReport {
    /// Remote-only documents copied in
    pub fetched: usize,
    /// Local copies overwritten by a different remote version
    pub updated: usize,
    /// Local-only documents removed
    pub deleted: usize,
    /// Documents skipped because a local change is still queued
    pub protected: usize,
    pub unchanged: usize,
    /// Overwrites of a newer local copy or tombstone that nothing had queued
    pub conflicts: usize,
    /// Tombstones dropped once the remote agreed
    pub purged: usize,
}

/// Outcome of one `sync` call
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub source: SourceSyncKey,
    pub pushed: usize,
    pub superseded: usize,
    pub skipped: usize,
    pub parked: usize,
    /// A refused entry holds the head of the queue
    pub blocked: bool,
    /// A transient failure stopped the cycle; try again later
    pub retry_needed: bool,
    pub cancelled: bool,
    /// Another cycle was running; this request was folded into it
    pub coalesced: bool,
    pub diff: Option<DiffReport>,
}

impl SyncReport {
    fn new(source: SourceSyncKey) -> Self {
        Self {
            source,
            pushed: 0,
            superseded: 0,
            skipped: 0,
            parked: 0,
            blocked: false,
            retry_needed: false,
            cancelled: false,
            coalesced: false,
            diff: None,
        }
    }

    /// The drain stopped early, so no diff ran
    pub const fn interrupted(&self) -> bool {
        self.blocked || self.retry_needed || self.cancelled
    }
}

/// What happened to a realtime event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    Applied,
    /// Older than the local row
    Stale,
    /// A queued local upsert shields the document from a remote delete
    Protected,
    /// Nothing to do (malformed event, delete of an unknown document)
    Ignored,
}

/// Collaborators shared by every coordinator
#[derive(Clone)]
pub struct SyncContext {
    pub queue: Arc<dyn ChangeQueue>,
    pub conflicts: Arc<dyn ConflictLog>,
    pub session: Arc<dyn SessionProvider>,
    pub clock: Arc<dyn Clock>,
    pub policy: SyncPolicy,
    pub cleanup: Option<Arc<dyn CleanupHook>>,
}

impl SyncContext {
    /// Queue and conflict log in `service`, system clock, default policies
    pub fn new(service: &DatabaseService, session: Arc<dyn SessionProvider>) -> Self {
        Self {
            queue: Arc::new(LibSqlChangeQueue::new(service.clone())),
            conflicts: Arc::new(LibSqlConflictLog::new(service.clone())),
            session,
            clock: Arc::new(SystemClock),
            policy: SyncPolicy::default(),
            cleanup: None,
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub const fn with_policy(mut self, policy: SyncPolicy) -> Self {
        self.policy = policy;
        self
    }

    #[must_use]
    pub fn with_cleanup(mut self, cleanup: Arc<dyn CleanupHook>) -> Self {
        self.cleanup = Some(cleanup);
        self
    }
}

/// Keeps one source's local replica and remote collection converged.
///
/// Cycles are serialized per source and coalesced: a `sync` that arrives while
/// a cycle runs returns immediately and the running caller performs one more
/// cycle. Local writes, queue edits and replica writes made by the sync path
/// share a write guard, so a write that lands mid-cycle is never clobbered.
pub struct SyncCoordinator {
    source: SourceSyncKey,
    local: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteStore>,
    context: SyncContext,
    cycle: Mutex<()>,
    rerun: AtomicBool,
    write_guard: Mutex<()>,
    phase: watch::Sender<SyncPhase>,
    trigger: Notify,
}

impl SyncCoordinator {
    pub fn new(
        local: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteStore>,
        context: SyncContext,
    ) -> Result<Self> {
        if local.source() != remote.source() {
            return Err(Error::InvalidInput(format!(
                "local store '{}' and remote store '{}' serve different sources",
                local.source(),
                remote.source()
            )));
        }
        let (phase, _) = watch::channel(SyncPhase::Idle);
        Ok(Self {
            source: local.source().clone(),
            local,
            remote,
            context,
            cycle: Mutex::new(()),
            rerun: AtomicBool::new(false),
            write_guard: Mutex::new(()),
            phase,
            trigger: Notify::new(),
        })
    }

    pub const fn source(&self) -> &SourceSyncKey {
        &self.source
    }

    pub fn policy(&self) -> SyncPolicy {
        self.context.policy
    }

    pub fn phase(&self) -> watch::Receiver<SyncPhase> {
        self.phase.subscribe()
    }

    /// Current user id, required for anything that touches the replica
    pub fn owner(&self) -> Result<String> {
        self.context
            .session
            .user_id()
            .ok_or_else(|| Error::Permission("no signed-in user".into()))
    }

    /// Ask the engine to run a cycle soon
    pub fn request_sync(&self) {
        self.trigger.notify_one();
    }

    /// Resolves on the next `request_sync`
    pub async fn sync_requested(&self) {
        self.trigger.notified().await;
    }

    // Reads

    pub async fn get(&self, id: &str) -> Result<Option<Document>> {
        self.local.get(&self.owner()?, id).await
    }

    pub async fn list(&self, query: &DocumentQuery) -> Result<Vec<Document>> {
        self.local.list(&self.owner()?, query).await
    }

    /// Local metadata, pending writes included
    pub async fn metadata(&self) -> Result<Vec<MetadataModel>> {
        self.local.metadata(&self.owner()?).await
    }

    pub fn observe(&self) -> broadcast::Receiver<LocalChange> {
        self.local.observe()
    }

    pub async fn pending(&self) -> Result<Vec<OfflineChange>> {
        self.context.queue.list_by_source(&self.source).await
    }

    pub async fn pending_count(&self) -> Result<usize> {
        self.context.queue.count_by_source(&self.source).await
    }

    pub async fn subscribe(&self) -> Result<RealtimeSubscription> {
        self.remote.subscribe(&self.owner()?).await
    }

    // Local writes

    /// Stamp for a local write: the clock, bumped past the stored watermark so
    /// the write always wins locally.
    async fn next_stamp(&self, owner: &str, id: &str) -> Result<i64> {
        let now = self.context.clock.now_millis();
        Ok(match self.local.watermark(owner, id).await? {
            Some(watermark) if watermark >= now => watermark + 1,
            _ => now,
        })
    }

    /// Optimistically write a document: queue the intent, then update the replica.
    pub async fn write(&self, id: &str, payload: serde_json::Value) -> Result<Document> {
        let owner = self.owner()?;
        let document = {
            let _guard = self.write_guard.lock().await;
            let updated_at = self.next_stamp(&owner, id).await?;
            let document = Document::new(id, updated_at, payload)?;
            let change =
                OfflineChange::upsert(self.source.clone(), id, &document.payload, updated_at)?;
            self.context.queue.enqueue(&[change]).await?;
            self.local.upsert(&owner, &document).await?;
            document
        };
        tracing::debug!(source = %self.source, document = id, "queued upsert");
        self.request_sync();
        Ok(document)
    }

    /// Optimistically delete documents. Returns how many live rows were removed.
    pub async fn remove(&self, ids: &[String]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let owner = self.owner()?;
        let removed = {
            let _guard = self.write_guard.lock().await;
            let mut stamped = Vec::with_capacity(ids.len());
            for id in ids {
                stamped.push((id, self.next_stamp(&owner, id).await?));
            }
            let changes: Vec<OfflineChange> = stamped
                .iter()
                .map(|(id, stamp)| OfflineChange::delete(self.source.clone(), id.as_str(), *stamp))
                .collect();
            self.context.queue.enqueue(&changes).await?;

            let mut removed = Vec::new();
            for (id, stamp) in stamped {
                if self.local.delete(&owner, id, stamp).await? {
                    removed.push(id.clone());
                }
            }
            removed
        };
        tracing::debug!(source = %self.source, count = ids.len(), "queued deletes");
        self.run_cleanup(&removed).await;
        self.request_sync();
        Ok(removed.len())
    }

    async fn run_cleanup(&self, ids: &[String]) {
        if ids.is_empty() {
            return;
        }
        if let Some(cleanup) = &self.context.cleanup {
            if let Err(error) = cleanup.on_deleted(&self.source, ids).await {
                tracing::warn!(source = %self.source, "cleanup after delete failed: {error}");
            }
        }
    }

    // Cycle

    /// Drain the queue, then diff against the remote.
    ///
    /// Returns `Err` for local storage failures, a missing session, and remote
    /// errors that stop the diff for good. Everything else is in the report.
    pub async fn sync(&self, cancel: &CancelSignal) -> Result<SyncReport> {
        let mut last = None;
        loop {
            self.rerun.store(true, Ordering::SeqCst);
            let Ok(guard) = self.cycle.try_lock() else {
                tracing::debug!(source = %self.source, "cycle running, request coalesced");
                return Ok(last.unwrap_or_else(|| {
                    let mut report = SyncReport::new(self.source.clone());
                    report.coalesced = true;
                    report
                }));
            };
            self.rerun.store(false, Ordering::SeqCst);

            let outcome = self.run_cycle(cancel).await;
            self.phase.send_replace(SyncPhase::Idle);
            drop(guard);

            let report = outcome?;
            if report.interrupted() || cancel.is_cancelled() || !self.rerun.load(Ordering::SeqCst) {
                return Ok(report);
            }
            last = Some(report);
        }
    }

    async fn run_cycle(&self, cancel: &CancelSignal) -> Result<SyncReport> {
        let owner = self.owner()?;
        let mut report = SyncReport::new(self.source.clone());

        self.phase.send_replace(SyncPhase::Draining);
        if let Err(error) = self.drain(&owner, cancel, &mut report).await {
            if error.is_local_storage() {
                tracing::error!(source = %self.source, "local storage failed during drain: {error}");
            }
            return Err(error);
        }
        if report.interrupted() {
            tracing::info!(
                source = %self.source,
                pushed = report.pushed,
                blocked = report.blocked,
                retry = report.retry_needed,
                cancelled = report.cancelled,
                "drain interrupted, diff skipped"
            );
            return Ok(report);
        }

        self.phase.send_replace(SyncPhase::Diffing);
        match self.diff(&owner, cancel).await {
            Ok(diff) => report.diff = Some(diff),
            Err(Error::Cancelled) => report.cancelled = true,
            Err(error) if error.is_retryable() => {
                tracing::warn!(source = %self.source, "diff failed, will retry: {error}");
                report.retry_needed = true;
            }
            Err(error) => {
                if error.is_local_storage() {
                    tracing::error!(source = %self.source, "local storage failed during diff: {error}");
                }
                return Err(error);
            }
        }

        let diff = report.diff.unwrap_or_default();
        tracing::info!(
            source = %self.source,
            pushed = report.pushed,
            superseded = report.superseded,
            parked = report.parked,
            skipped = report.skipped,
            fetched = diff.fetched,
            updated = diff.updated,
            deleted = diff.deleted,
            protected = diff.protected,
            "sync cycle finished"
        );
        Ok(report)
    }

    async fn remote_watermarks(&self, owner: &str) -> Result<HashMap<String, i64>> {
        Ok(self
            .remote
            .metadata(owner)
            .await?
            .into_iter()
            .map(|entry| (entry.document_id, entry.updated_at))
            .collect())
    }

    async fn drain(&self, owner: &str, cancel: &CancelSignal, report: &mut SyncReport) -> Result<()> {
        let changes = self.context.queue.list_by_source(&self.source).await?;
        if changes.is_empty() {
            return Ok(());
        }

        let remote = match self.remote_watermarks(owner).await {
            Ok(remote) => remote,
            Err(error) if error.is_retryable() => {
                tracing::warn!(source = %self.source, "remote metadata unavailable: {error}");
                report.retry_needed = true;
                return Ok(());
            }
            Err(error) => return Err(error),
        };

        for change in changes {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }

            let remote_at = remote.get(&change.document_id).copied();
            if change.operation == ChangeOperation::Upsert && remote_at == Some(change.updated_at) {
                tracing::debug!(
                    source = %self.source,
                    document = %change.document_id,
                    "remote already holds this version, acknowledging"
                );
                self.acknowledge(&change).await?;
                report.pushed += 1;
                continue;
            }
            if let Some(remote_at) = remote_at.filter(|remote_at| change.updated_at < *remote_at) {
                match self.context.policy.conflict {
                    ConflictPolicy::TimestampWins => {
                        self.supersede(&change, remote_at).await?;
                        report.superseded += 1;
                        continue;
                    }
                    ConflictPolicy::LocalOverwrites => {
                        tracing::warn!(
                            source = %self.source,
                            document = %change.document_id,
                            local = change.updated_at,
                            remote = remote_at,
                            "sending local change over a newer remote copy"
                        );
                        self.context
                            .conflicts
                            .record(
                                &self.source,
                                &change.document_id,
                                change.updated_at,
                                remote_at,
                                ConflictStrategy::LocalOverwrites,
                            )
                            .await?;
                    }
                }
            }

            match self.push(owner, &change).await {
                Ok(()) => report.pushed += 1,
                Err(Error::Conflict(message)) => {
                    tracing::debug!(source = %self.source, document = %change.document_id, "remote refused as stale: {message}");
                    self.supersede(&change, remote_at.unwrap_or(change.updated_at))
                        .await?;
                    report.superseded += 1;
                }
                Err(error) if error.is_local_storage() => return Err(error),
                Err(error) if error.is_rejection() => match self.context.policy.poison {
                    PoisonPolicy::Block => {
                        tracing::warn!(
                            source = %self.source,
                            document = %change.document_id,
                            "remote refused change, queue blocked: {error}"
                        );
                        report.blocked = true;
                        break;
                    }
                    PoisonPolicy::Skip => {
                        tracing::warn!(
                            source = %self.source,
                            document = %change.document_id,
                            "remote refused change, dropping it: {error}"
                        );
                        self.context.queue.remove_by_id(&change.id).await?;
                        report.skipped += 1;
                    }
                    PoisonPolicy::Park => {
                        tracing::warn!(
                            source = %self.source,
                            document = %change.document_id,
                            "remote refused change, parking it: {error}"
                        );
                        self.context
                            .queue
                            .park(&change, &error.to_string(), self.context.clock.now_millis())
                            .await?;
                        report.parked += 1;
                    }
                },
                // The remote may have applied the change, so it stays queued.
                Err(error) => {
                    tracing::warn!(
                        source = %self.source,
                        document = %change.document_id,
                        "push failed, draining stops here: {error}"
                    );
                    report.retry_needed = true;
                    break;
                }
            }
        }
        Ok(())
    }

    /// Send one queued change and remove it once acknowledged
    async fn push(&self, owner: &str, change: &OfflineChange) -> Result<()> {
        tracing::debug!(
            source = %self.source,
            document = %change.document_id,
            operation = change.operation.as_str(),
            "pushing change"
        );
        match change.operation {
            ChangeOperation::Upsert => {
                let document = outgoing_document(change)?;
                let stored = self.remote.upsert(owner, &document).await?;
                self.acknowledge(change).await?;
                self.apply_document(owner, &stored).await?;
            }
            ChangeOperation::Delete => {
                match self.remote.delete_by_id(owner, &change.document_id).await {
                    Ok(()) | Err(Error::NotFound(_)) => {}
                    Err(error) => return Err(error),
                }
                self.acknowledge(change).await?;
            }
        }
        Ok(())
    }

    async fn acknowledge(&self, change: &OfflineChange) -> Result<()> {
        let _guard = self.write_guard.lock().await;
        if !self.context.queue.remove_by_id(&change.id).await? {
            tracing::debug!(
                source = %self.source,
                document = %change.document_id,
                "acknowledged change was replaced by a newer one"
            );
        }
        Ok(())
    }

    async fn supersede(&self, change: &OfflineChange, remote_at: i64) -> Result<()> {
        tracing::warn!(
            source = %self.source,
            document = %change.document_id,
            local = change.updated_at,
            remote = remote_at,
            "remote copy is newer, dropping queued change"
        );
        {
            let _guard = self.write_guard.lock().await;
            self.context.queue.remove_by_id(&change.id).await?;
        }
        self.context
            .conflicts
            .record(
                &self.source,
                &change.document_id,
                change.updated_at,
                remote_at,
                ConflictStrategy::RemoteWins,
            )
            .await
    }

    /// Store a document the remote reported, unless it is older than the local row
    async fn apply_document(&self, owner: &str, document: &Document) -> Result<bool> {
        let _guard = self.write_guard.lock().await;
        if let Some(pending) = self
            .context
            .queue
            .get_pending(&self.source, &document.id)
            .await?
        {
            if pending.updated_at > document.updated_at {
                return Ok(false);
            }
        }
        match self.local.watermark(owner, &document.id).await? {
            Some(watermark) if watermark > document.updated_at => Ok(false),
            _ => {
                self.local.upsert(owner, document).await?;
                Ok(true)
            }
        }
    }

    async fn diff(&self, owner: &str, cancel: &CancelSignal) -> Result<DiffReport> {
        let remote = self.remote_watermarks(owner).await?;
        let local: HashMap<String, i64> = self
            .local
            .metadata(owner)
            .await?
            .into_iter()
            .map(|entry| (entry.document_id, entry.updated_at))
            .collect();
        let pending: HashSet<String> = self
            .context
            .queue
            .pending_document_ids(&self.source)
            .await?
            .into_iter()
            .collect();

        let mut report = DiffReport::default();

        let mut remote_ids: Vec<(&String, i64)> = remote.iter().map(|(id, at)| (id, *at)).collect();
        remote_ids.sort();
        for (id, remote_at) in remote_ids {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if pending.contains(id) {
                report.protected += 1;
                continue;
            }
            let local_at = local.get(id).copied();
            if local_at == Some(remote_at) {
                report.unchanged += 1;
                continue;
            }

            let Some(document) = self.remote.get(owner, id).await? else {
                // Deleted after the metadata read; the next diff removes it.
                continue;
            };
            let tombstone_at = match local_at {
                None => self.local.watermark(owner, id).await?,
                Some(_) => None,
            };
            if !self.store_remote_copy(owner, &document, local_at).await? {
                report.protected += 1;
                continue;
            }
            match local_at {
                None => {
                    report.fetched += 1;
                    if let Some(deleted_at) = tombstone_at.filter(|deleted_at| *deleted_at > remote_at) {
                        tracing::warn!(
                            source = %self.source,
                            document = %id,
                            local = deleted_at,
                            remote = remote_at,
                            "local delete never reached the remote, restoring remote"
                        );
                        self.context
                            .conflicts
                            .record(
                                &self.source,
                                id,
                                deleted_at,
                                remote_at,
                                ConflictStrategy::RemoteAuthoritative,
                            )
                            .await?;
                        report.conflicts += 1;
                    }
                }
                Some(local_at) if local_at < remote_at => report.updated += 1,
                Some(local_at) => {
                    tracing::warn!(
                        source = %self.source,
                        document = %id,
                        local = local_at,
                        remote = remote_at,
                        "local copy newer than remote with nothing queued, restoring remote"
                    );
                    self.context
                        .conflicts
                        .record(
                            &self.source,
                            id,
                            local_at,
                            remote_at,
                            ConflictStrategy::RemoteAuthoritative,
                        )
                        .await?;
                    report.updated += 1;
                    report.conflicts += 1;
                }
            }
        }

        let mut local_only: Vec<(&String, i64)> = local
            .iter()
            .filter(|(id, _)| !remote.contains_key(*id))
            .map(|(id, at)| (id, *at))
            .collect();
        local_only.sort();
        let mut removed = Vec::new();
        for (id, local_at) in local_only {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if pending.contains(id) {
                report.protected += 1;
                continue;
            }
            if self.remove_local_copy(owner, id, local_at).await? {
                removed.push(id.clone());
            } else {
                report.protected += 1;
            }
        }
        report.deleted = removed.len();
        self.run_cleanup(&removed).await;

        report.purged = self.purge_tombstones(owner).await?;
        Ok(report)
    }

    /// Write a fetched remote copy unless the local row changed since `expected`
    /// was read or a local change got queued meanwhile.
    async fn store_remote_copy(
        &self,
        owner: &str,
        document: &Document,
        expected: Option<i64>,
    ) -> Result<bool> {
        let _guard = self.write_guard.lock().await;
        if self
            .context
            .queue
            .get_pending(&self.source, &document.id)
            .await?
            .is_some()
        {
            return Ok(false);
        }
        let live = self
            .local
            .get(owner, &document.id)
            .await?
            .map(|current| current.updated_at);
        let unchanged = match live {
            None => true,
            Some(current) => Some(current) == expected || current <= document.updated_at,
        };
        if unchanged {
            self.local.upsert(owner, document).await?;
        }
        Ok(unchanged)
    }

    /// Drop tombstones the diff has settled. Ids with a queued change keep theirs.
    async fn purge_tombstones(&self, owner: &str) -> Result<usize> {
        let _guard = self.write_guard.lock().await;
        let pending = self.context.queue.pending_document_ids(&self.source).await?;
        let purged = self.local.purge_tombstones(owner, &pending).await?;
        if purged > 0 {
            tracing::debug!(source = %self.source, purged, "purged tombstones");
        }
        Ok(purged)
    }

    async fn remove_local_copy(&self, owner: &str, id: &str, expected: i64) -> Result<bool> {
        let _guard = self.write_guard.lock().await;
        if self
            .context
            .queue
            .get_pending(&self.source, id)
            .await?
            .is_some()
        {
            return Ok(false);
        }
        if self.local.watermark(owner, id).await? != Some(expected) {
            return Ok(false);
        }
        self.local.delete(owner, id, expected).await
    }

    // Realtime

    /// Apply one realtime event to the replica.
    ///
    /// Create/update lands when it is at least as new as the local row,
    /// tombstones included. Delete lands unless a local upsert is queued or
    /// its own stamp is older than the local row.
    pub async fn apply_event(&self, event: &RealtimeEvent) -> Result<EventOutcome> {
        let owner = self.owner()?;
        match event.operation {
            RealtimeOperation::Create | RealtimeOperation::Update => {
                let document = match event.to_document() {
                    Ok(document) => document,
                    Err(error) => {
                        tracing::warn!(source = %self.source, "dropping malformed realtime event: {error}");
                        return Ok(EventOutcome::Ignored);
                    }
                };
                let local_at = {
                    let _guard = self.write_guard.lock().await;
                    match self.local.watermark(&owner, &document.id).await? {
                        Some(local_at) if local_at > document.updated_at => Some(local_at),
                        _ => {
                            self.local.upsert(&owner, &document).await?;
                            None
                        }
                    }
                };
                if let Some(local_at) = local_at {
                    tracing::debug!(
                        source = %self.source,
                        document = %document.id,
                        local = local_at,
                        incoming = document.updated_at,
                        "ignoring stale realtime event"
                    );
                    self.context
                        .conflicts
                        .record(
                            &self.source,
                            &document.id,
                            local_at,
                            document.updated_at,
                            ConflictStrategy::StaleEvent,
                        )
                        .await?;
                    return Ok(EventOutcome::Stale);
                }
                Ok(EventOutcome::Applied)
            }
            RealtimeOperation::Delete => {
                let (removed, stale) = {
                    let _guard = self.write_guard.lock().await;
                    let pending = self
                        .context
                        .queue
                        .get_pending(&self.source, &event.document_id)
                        .await?;
                    if pending.is_some_and(|change| change.operation == ChangeOperation::Upsert) {
                        tracing::debug!(
                            source = %self.source,
                            document = %event.document_id,
                            "remote delete shielded by a queued upsert"
                        );
                        return Ok(EventOutcome::Protected);
                    }
                    let Some(local_at) = self.local.watermark(&owner, &event.document_id).await?
                    else {
                        return Ok(EventOutcome::Ignored);
                    };
                    match event.watermark() {
                        Some(incoming) if incoming < local_at => (false, Some((local_at, incoming))),
                        incoming => {
                            let stamp = incoming
                                .unwrap_or_else(|| self.context.clock.now_millis())
                                .max(local_at);
                            (self.local.delete(&owner, &event.document_id, stamp).await?, None)
                        }
                    }
                };
                if let Some((local_at, incoming)) = stale {
                    tracing::debug!(
                        source = %self.source,
                        document = %event.document_id,
                        local = local_at,
                        incoming,
                        "ignoring stale realtime delete"
                    );
                    self.context
                        .conflicts
                        .record(
                            &self.source,
                            &event.document_id,
                            local_at,
                            incoming,
                            ConflictStrategy::StaleEvent,
                        )
                        .await?;
                    return Ok(EventOutcome::Stale);
                }
                if removed {
                    self.run_cleanup(std::slice::from_ref(&event.document_id))
                        .await;
                    Ok(EventOutcome::Applied)
                } else {
                    Ok(EventOutcome::Ignored)
                }
            }
        }
    }

    // Maintenance

    /// Delete matching documents on the remote, then drop their local copies.
    /// Requires connectivity; documents with queued changes keep them.
    pub async fn purge_remote(&self, query: &DocumentQuery) -> Result<usize> {
        query.validate()?;
        let owner = self.owner()?;
        let purged = self.remote.delete_by_filter(&owner, query).await?;

        let unpaged = DocumentQuery {
            filters: query.filters.clone(),
            ..DocumentQuery::default()
        };
        let mut removed = Vec::new();
        for document in self.local.list(&owner, &unpaged).await? {
            if self
                .remove_local_copy(&owner, &document.id, document.updated_at)
                .await?
            {
                removed.push(document.id);
            }
        }
        tracing::info!(
            source = %self.source,
            remote = purged,
            local = removed.len(),
            "purged documents"
        );
        self.run_cleanup(&removed).await;
        Ok(purged)
    }

    /// Forget everything queued and cached for the current user.
    /// Returns `(queued changes dropped, local rows dropped)`.
    pub async fn reset(&self) -> Result<(usize, usize)> {
        let owner = self.owner()?;
        let _guard = self.write_guard.lock().await;
        let queued = self.context.queue.clear_source(&self.source).await?;
        let rows = self.local.clear(&owner).await?;
        tracing::info!(source = %self.source, queued, rows, "reset source");
        Ok((queued, rows))
    }
}

/// Document a queued upsert sends. A queued change that cannot produce one is
/// refused like a remote validation failure, so the poison policy handles it.
fn outgoing_document(change: &OfflineChange) -> Result<Document> {
    let unusable = |reason: String| {
        Error::Validation(format!(
            "queued upsert of '{}' is unusable: {reason}",
            change.document_id
        ))
    };
    let payload = change
        .payload_json()
        .map_err(|error| unusable(error.to_string()))?
        .ok_or_else(|| unusable("no payload".into()))?;
    Document::new(change.document_id.clone(), change.updated_at, payload)
        .map_err(|error| unusable(error.to_string()))
}
