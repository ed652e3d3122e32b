//! Durable offline change queue

use async_trait::async_trait;
use libsql::{Row, Value};

use crate::error::{Error, Result};
use crate::models::{ChangeId, OfflineChange, ParkedChange, SourceSyncKey};
use crate::services::DatabaseService;

const CHANGE_COLUMNS: &str =
    "id, source_key, document_id, operation, payload, updated_at, enqueued_at";

/// Pending offline mutations, partitioned by source.
///
/// Holds at most one change per `(source_key, document_id)`. Entries leave the
/// queue only when the remote acknowledged them or when they are parked.
#[async_trait]
pub trait ChangeQueue: Send + Sync {
    /// Insert or replace the pending change for each document, atomically.
    async fn enqueue(&self, changes: &[OfflineChange]) -> Result<()>;

    /// Pending changes for a source in FIFO order
    async fn list_by_source(&self, source: &SourceSyncKey) -> Result<Vec<OfflineChange>>;

    /// Pending change for a single document, if any
    async fn get_pending(
        &self,
        source: &SourceSyncKey,
        document_id: &str,
    ) -> Result<Option<OfflineChange>>;

    /// Ids of documents with a pending change
    async fn pending_document_ids(&self, source: &SourceSyncKey) -> Result<Vec<String>>;

    async fn count_by_source(&self, source: &SourceSyncKey) -> Result<usize>;

    /// Sources with at least one pending change
    async fn sources(&self) -> Result<Vec<SourceSyncKey>>;

    /// Remove a change by id. Returns `false` when it was already replaced or removed.
    async fn remove_by_id(&self, id: &ChangeId) -> Result<bool>;

    async fn remove_by_ids(&self, ids: &[ChangeId]) -> Result<usize>;

    async fn clear_source(&self, source: &SourceSyncKey) -> Result<usize>;

    /// Move a change the backend refused out of the queue, stamped `parked_at` (millis)
    async fn park(&self, change: &OfflineChange, reason: &str, parked_at: i64) -> Result<()>;

    async fn list_parked(&self, source: Option<&SourceSyncKey>) -> Result<Vec<ParkedChange>>;

    /// Put a parked change back at the end of its queue
    async fn requeue_parked(&self, id: &ChangeId) -> Result<OfflineChange>;

    async fn discard_parked(&self, id: &ChangeId) -> Result<bool>;
}

/// libSQL implementation of `ChangeQueue`
#[derive(Clone)]
pub struct LibSqlChangeQueue {
    service: DatabaseService,
}

impl LibSqlChangeQueue {
    pub const fn new(service: DatabaseService) -> Self {
        Self { service }
    }

    /// Parse a change from a row selected with `CHANGE_COLUMNS`
    fn parse_change(row: &Row) -> Result<OfflineChange> {
        let id: String = row.get(0)?;
        let source_key: String = row.get(1)?;
        let operation: String = row.get(3)?;
        let payload = match row.get_value(4)? {
            Value::Null => None,
            Value::Blob(bytes) => Some(bytes),
            Value::Text(text) => Some(text.into_bytes()),
            other => {
                return Err(Error::Database(format!(
                    "unexpected payload column type for change {id}: {other:?}"
                )))
            }
        };

        Ok(OfflineChange {
            id: id
                .parse()
                .map_err(|_| Error::Database(format!("invalid change id '{id}'")))?,
            source_key: SourceSyncKey::new(source_key)?,
            operation: operation.parse()?,
            payload,
            document_id: row.get(2)?,
            updated_at: row.get(5)?,
            enqueued_at: row.get(6)?,
        })
    }

    fn payload_value(change: &OfflineChange) -> Value {
        change
            .payload
            .as_ref()
            .map_or(Value::Null, |bytes| Value::Blob(bytes.clone()))
    }

    fn change_params(change: &OfflineChange) -> Vec<Value> {
        vec![
            Value::from(change.id.as_str()),
            Value::from(change.source_key.as_str()),
            Value::from(change.document_id.as_str()),
            Value::from(change.operation.as_str()),
            Self::payload_value(change),
            Value::from(change.updated_at),
            Value::from(change.enqueued_at),
        ]
    }
}

#[async_trait]
impl ChangeQueue for LibSqlChangeQueue {
    async fn enqueue(&self, changes: &[OfflineChange]) -> Result<()> {
        if changes.is_empty() {
            return Ok(());
        }

        // Replacing in place keeps the slot's position and gives it a new id.
        let statements = changes
            .iter()
            .map(|change| {
                (
                    "INSERT INTO offline_changes (id, source_key, document_id, operation, payload, updated_at, enqueued_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                     ON CONFLICT(source_key, document_id) DO UPDATE SET
                        id = excluded.id,
                        operation = excluded.operation,
                        payload = excluded.payload,
                        updated_at = excluded.updated_at,
                        enqueued_at = excluded.enqueued_at",
                    Self::change_params(change),
                )
            })
            .collect();

        let db = self.service.lock().await;
        db.execute_atomic(statements).await?;
        for change in changes {
            tracing::debug!(
                source = %change.source_key,
                document = %change.document_id,
                operation = change.operation.as_str(),
                "Queued offline change {}",
                change.id
            );
        }
        Ok(())
    }

    async fn list_by_source(&self, source: &SourceSyncKey) -> Result<Vec<OfflineChange>> {
        let db = self.service.lock().await;
        let mut rows = db
            .connection()
            .query(
                &format!(
                    "SELECT {CHANGE_COLUMNS} FROM offline_changes WHERE source_key = ? ORDER BY seq ASC"
                ),
                [source.as_str()],
            )
            .await?;

        let mut changes = Vec::new();
        while let Some(row) = rows.next().await? {
            changes.push(Self::parse_change(&row)?);
        }
        Ok(changes)
    }

    async fn get_pending(
        &self,
        source: &SourceSyncKey,
        document_id: &str,
    ) -> Result<Option<OfflineChange>> {
        let db = self.service.lock().await;
        let mut rows = db
            .connection()
            .query(
                &format!(
                    "SELECT {CHANGE_COLUMNS} FROM offline_changes WHERE source_key = ? AND document_id = ?"
                ),
                [source.as_str(), document_id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(Self::parse_change(&row)?)),
            None => Ok(None),
        }
    }

    async fn pending_document_ids(&self, source: &SourceSyncKey) -> Result<Vec<String>> {
        let db = self.service.lock().await;
        let mut rows = db
            .connection()
            .query(
                "SELECT document_id FROM offline_changes WHERE source_key = ? ORDER BY seq ASC",
                [source.as_str()],
            )
            .await?;

        let mut ids = Vec::new();
        while let Some(row) = rows.next().await? {
            ids.push(row.get::<String>(0)?);
        }
        Ok(ids)
    }

    async fn count_by_source(&self, source: &SourceSyncKey) -> Result<usize> {
        let db = self.service.lock().await;
        let mut rows = db
            .connection()
            .query(
                "SELECT COUNT(*) FROM offline_changes WHERE source_key = ?",
                [source.as_str()],
            )
            .await?;

        let count = match rows.next().await? {
            Some(row) => row.get::<i64>(0)?,
            None => 0,
        };
        Ok(usize::try_from(count).unwrap_or_default())
    }

    async fn sources(&self) -> Result<Vec<SourceSyncKey>> {
        let db = self.service.lock().await;
        let mut rows = db
            .connection()
            .query(
                "SELECT DISTINCT source_key FROM offline_changes ORDER BY source_key",
                (),
            )
            .await?;

        let mut sources = Vec::new();
        while let Some(row) = rows.next().await? {
            sources.push(SourceSyncKey::new(row.get::<String>(0)?)?);
        }
        Ok(sources)
    }

    async fn remove_by_id(&self, id: &ChangeId) -> Result<bool> {
        let db = self.service.lock().await;
        let affected = db
            .connection()
            .execute("DELETE FROM offline_changes WHERE id = ?", [id.as_str()])
            .await?;
        Ok(affected > 0)
    }

    async fn remove_by_ids(&self, ids: &[ChangeId]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let statements = ids
            .iter()
            .map(|id| {
                (
                    "DELETE FROM offline_changes WHERE id = ?",
                    vec![Value::from(id.as_str())],
                )
            })
            .collect();

        let db = self.service.lock().await;
        let affected = db.execute_atomic(statements).await?;
        Ok(usize::try_from(affected).unwrap_or_default())
    }

    async fn clear_source(&self, source: &SourceSyncKey) -> Result<usize> {
        let db = self.service.lock().await;
        let affected = db
            .connection()
            .execute(
                "DELETE FROM offline_changes WHERE source_key = ?",
                [source.as_str()],
            )
            .await?;
        tracing::info!(source = %source, "Cleared {affected} queued changes");
        Ok(usize::try_from(affected).unwrap_or_default())
    }

    async fn park(&self, change: &OfflineChange, reason: &str, parked_at: i64) -> Result<()> {
        let mut insert = Self::change_params(change);
        insert.push(Value::from(parked_at));
        insert.push(Value::from(reason));

        let db = self.service.lock().await;
        db.execute_atomic(vec![
            (
                "DELETE FROM offline_changes WHERE id = ?",
                vec![Value::from(change.id.as_str())],
            ),
            (
                "INSERT OR REPLACE INTO parked_changes (id, source_key, document_id, operation, payload, updated_at, enqueued_at, parked_at, reason)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                insert,
            ),
        ])
        .await?;

        tracing::warn!(
            source = %change.source_key,
            document = %change.document_id,
            "Parked change {}: {reason}",
            change.id
        );
        Ok(())
    }

    async fn list_parked(&self, source: Option<&SourceSyncKey>) -> Result<Vec<ParkedChange>> {
        let db = self.service.lock().await;
        let sql = format!(
            "SELECT {CHANGE_COLUMNS}, reason, parked_at FROM parked_changes
             WHERE (?1 IS NULL OR source_key = ?1)
             ORDER BY parked_at ASC, id ASC"
        );
        let filter = source.map_or(Value::Null, |key| Value::from(key.as_str()));
        let mut rows = db.connection().query(&sql, vec![filter]).await?;

        let mut parked = Vec::new();
        while let Some(row) = rows.next().await? {
            parked.push(ParkedChange {
                change: Self::parse_change(&row)?,
                reason: row.get(7)?,
                parked_at: row.get(8)?,
            });
        }
        Ok(parked)
    }

    async fn requeue_parked(&self, id: &ChangeId) -> Result<OfflineChange> {
        let db = self.service.lock().await;
        let conn = db.connection();

        let mut rows = conn
            .query(
                &format!("SELECT {CHANGE_COLUMNS} FROM parked_changes WHERE id = ?"),
                [id.as_str()],
            )
            .await?;
        let Some(row) = rows.next().await? else {
            return Err(Error::NotFound(format!("parked change {id}")));
        };
        let change = Self::parse_change(&row)?;
        drop(rows);

        let mut rows = conn
            .query(
                "SELECT id FROM offline_changes WHERE source_key = ? AND document_id = ?",
                [change.source_key.as_str(), change.document_id.as_str()],
            )
            .await?;
        if let Some(row) = rows.next().await? {
            let pending: String = row.get(0)?;
            return Err(Error::InvalidInput(format!(
                "document '{}' already has a newer pending change {pending}",
                change.document_id
            )));
        }
        drop(rows);

        db.execute_atomic(vec![
            (
                "DELETE FROM parked_changes WHERE id = ?",
                vec![Value::from(id.as_str())],
            ),
            (
                "INSERT INTO offline_changes (id, source_key, document_id, operation, payload, updated_at, enqueued_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                Self::change_params(&change),
            ),
        ])
        .await?;

        tracing::info!(
            source = %change.source_key,
            document = %change.document_id,
            "Requeued parked change {id}"
        );
        Ok(change)
    }

    async fn discard_parked(&self, id: &ChangeId) -> Result<bool> {
        let db = self.service.lock().await;
        let affected = db
            .connection()
            .execute("DELETE FROM parked_changes WHERE id = ?", [id.as_str()])
            .await?;
        Ok(affected > 0)
    }
}
