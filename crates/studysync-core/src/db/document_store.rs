//! Local document store

#![allow(clippy::cast_possible_wrap)] // SQLite uses i64 for LIMIT/OFFSET

use async_trait::async_trait;
use libsql::{Connection, Row, Value};
use tokio::sync::broadcast;

use crate::error::{Error, Result};
use crate::models::{Document, DocumentQuery, MetadataModel, SourceSyncKey};
use crate::services::DatabaseService;

const CHANGE_CHANNEL_CAPACITY: usize = 64;

/// Notification emitted after a local write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalChange {
    Upserted(String),
    Deleted(Vec<String>),
    Cleared,
}

/// On-device copy of one source, scoped by owner.
///
/// Plain CRUD plus the metadata projection; it has no notion of the queue or
/// the remote. Deletions leave a tombstone that keeps the deletion watermark.
#[async_trait]
pub trait LocalStore: Send + Sync {
    fn source(&self) -> &SourceSyncKey;

    /// Live document by id
    async fn get(&self, owner: &str, id: &str) -> Result<Option<Document>>;

    /// Live documents matching the query, newest first
    async fn list(&self, owner: &str, query: &DocumentQuery) -> Result<Vec<Document>>;

    /// `(id, updated_at)` of every live document
    async fn metadata(&self, owner: &str) -> Result<Vec<MetadataModel>>;

    /// Stored watermark for a document, tombstones included
    async fn watermark(&self, owner: &str, id: &str) -> Result<Option<i64>>;

    async fn upsert(&self, owner: &str, document: &Document) -> Result<()>;

    /// Tombstone a document. Returns whether a live row was removed.
    async fn delete(&self, owner: &str, id: &str, deleted_at: i64) -> Result<bool>;

    async fn delete_many(&self, owner: &str, ids: &[String], deleted_at: i64) -> Result<usize>;

    /// Drop every row, tombstones included
    async fn clear(&self, owner: &str) -> Result<usize>;

    /// Drop tombstones, except those for `keep`
    async fn purge_tombstones(&self, owner: &str, keep: &[String]) -> Result<usize>;

    /// Subscribe to write notifications
    fn observe(&self) -> broadcast::Receiver<LocalChange>;
}

/// libSQL implementation of `LocalStore` over the shared `documents` table
pub struct LibSqlLocalStore {
    service: DatabaseService,
    source: SourceSyncKey,
    changes: broadcast::Sender<LocalChange>,
}

impl LibSqlLocalStore {
    pub fn new(service: DatabaseService, source: SourceSyncKey) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            service,
            source,
            changes,
        }
    }

    fn notify(&self, change: LocalChange) {
        // No subscribers is fine.
        let _ = self.changes.send(change);
    }

    fn parse_document(row: &Row) -> Result<Document> {
        let id: String = row.get(0)?;
        let payload: String = row.get(1)?;
        Ok(Document {
            id,
            payload: serde_json::from_str(&payload)?,
            updated_at: row.get(2)?,
        })
    }

    /// SQL value a `json_extract` result is compared against
    fn filter_value(value: &serde_json::Value) -> Result<Option<Value>> {
        Ok(match value {
            serde_json::Value::Null => None,
            serde_json::Value::Bool(flag) => Some(Value::Integer(i64::from(*flag))),
            serde_json::Value::Number(number) => Some(match number.as_i64() {
                Some(integer) => Value::Integer(integer),
                None => Value::Real(number.as_f64().unwrap_or_default()),
            }),
            serde_json::Value::String(text) => Some(Value::Text(text.clone())),
            other => {
                return Err(Error::InvalidInput(format!(
                    "cannot filter on non-scalar value {other}"
                )))
            }
        })
    }

    async fn live_ids(&self, conn: &Connection, owner: &str, ids: &[String]) -> Result<Vec<String>> {
        let mut live = Vec::new();
        for id in ids {
            let mut rows = conn
                .query(
                    "SELECT 1 FROM documents
                     WHERE source_key = ? AND owner_id = ? AND id = ? AND is_deleted = 0",
                    [self.source.as_str(), owner, id.as_str()],
                )
                .await?;
            if rows.next().await?.is_some() {
                live.push(id.clone());
            }
        }
        Ok(live)
    }

    fn tombstone_statement(&self, owner: &str, id: &str, deleted_at: i64) -> (&'static str, Vec<Value>) {
        (
            "INSERT INTO documents (source_key, owner_id, id, payload, updated_at, is_deleted)
             VALUES (?1, ?2, ?3, '{}', ?4, 1)
             ON CONFLICT(source_key, owner_id, id) DO UPDATE SET
                payload = '{}',
                updated_at = MAX(documents.updated_at, excluded.updated_at),
                is_deleted = 1",
            vec![
                Value::from(self.source.as_str()),
                Value::from(owner),
                Value::from(id),
                Value::from(deleted_at),
            ],
        )
    }
}

#[async_trait]
impl LocalStore for LibSqlLocalStore {
    fn source(&self) -> &SourceSyncKey {
        &self.source
    }

    async fn get(&self, owner: &str, id: &str) -> Result<Option<Document>> {
        let db = self.service.lock().await;
        let mut rows = db
            .connection()
            .query(
                "SELECT id, payload, updated_at FROM documents
                 WHERE source_key = ? AND owner_id = ? AND id = ? AND is_deleted = 0",
                [self.source.as_str(), owner, id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(Self::parse_document(&row)?)),
            None => Ok(None),
        }
    }

    async fn list(&self, owner: &str, query: &DocumentQuery) -> Result<Vec<Document>> {
        query.validate()?;

        let mut sql = String::from(
            "SELECT id, payload, updated_at FROM documents
             WHERE source_key = ? AND owner_id = ? AND is_deleted = 0",
        );
        let mut params = vec![Value::from(self.source.as_str()), Value::from(owner)];
        for filter in &query.filters {
            // Field names are validated to [A-Za-z0-9_], safe inside the JSON path.
            match Self::filter_value(&filter.value)? {
                Some(value) => {
                    sql.push_str(&format!(" AND json_extract(payload, '$.{}') = ?", filter.field));
                    params.push(value);
                }
                None => {
                    sql.push_str(&format!(" AND json_extract(payload, '$.{}') IS NULL", filter.field));
                }
            }
        }
        sql.push_str(" ORDER BY updated_at DESC, id ASC LIMIT ? OFFSET ?");
        params.push(Value::Integer(query.limit.map_or(-1, |limit| limit as i64)));
        params.push(Value::Integer(query.offset as i64));

        let db = self.service.lock().await;
        let mut rows = db.connection().query(&sql, params).await?;

        let mut documents = Vec::new();
        while let Some(row) = rows.next().await? {
            documents.push(Self::parse_document(&row)?);
        }
        Ok(documents)
    }

    async fn metadata(&self, owner: &str) -> Result<Vec<MetadataModel>> {
        let db = self.service.lock().await;
        let mut rows = db
            .connection()
            .query(
                "SELECT id, updated_at FROM documents
                 WHERE source_key = ? AND owner_id = ? AND is_deleted = 0
                 ORDER BY id ASC",
                [self.source.as_str(), owner],
            )
            .await?;

        let mut metadata = Vec::new();
        while let Some(row) = rows.next().await? {
            metadata.push(MetadataModel {
                document_id: row.get(0)?,
                updated_at: row.get(1)?,
            });
        }
        Ok(metadata)
    }

    async fn watermark(&self, owner: &str, id: &str) -> Result<Option<i64>> {
        let db = self.service.lock().await;
        let mut rows = db
            .connection()
            .query(
                "SELECT updated_at FROM documents WHERE source_key = ? AND owner_id = ? AND id = ?",
                [self.source.as_str(), owner, id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    async fn upsert(&self, owner: &str, document: &Document) -> Result<()> {
        let payload = serde_json::to_string(&document.payload)?;
        {
            let db = self.service.lock().await;
            db.connection()
                .execute(
                    "INSERT INTO documents (source_key, owner_id, id, payload, updated_at, is_deleted)
                     VALUES (?1, ?2, ?3, ?4, ?5, 0)
                     ON CONFLICT(source_key, owner_id, id) DO UPDATE SET
                        payload = excluded.payload,
                        updated_at = excluded.updated_at,
                        is_deleted = 0",
                    vec![
                        Value::from(self.source.as_str()),
                        Value::from(owner),
                        Value::from(document.id.as_str()),
                        Value::from(payload),
                        Value::from(document.updated_at),
                    ],
                )
                .await?;
        }
        self.notify(LocalChange::Upserted(document.id.clone()));
        Ok(())
    }

    async fn delete(&self, owner: &str, id: &str, deleted_at: i64) -> Result<bool> {
        let ids = [id.to_string()];
        Ok(self.delete_many(owner, &ids, deleted_at).await? > 0)
    }

    async fn delete_many(&self, owner: &str, ids: &[String], deleted_at: i64) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }

        let removed = {
            let db = self.service.lock().await;
            let live = self.live_ids(db.connection(), owner, ids).await?;
            let statements = ids
                .iter()
                .map(|id| self.tombstone_statement(owner, id, deleted_at))
                .collect();
            db.execute_atomic(statements).await?;
            live
        };

        let count = removed.len();
        if count > 0 {
            self.notify(LocalChange::Deleted(removed));
        }
        Ok(count)
    }

    async fn clear(&self, owner: &str) -> Result<usize> {
        let affected = {
            let db = self.service.lock().await;
            db.connection()
                .execute(
                    "DELETE FROM documents WHERE source_key = ? AND owner_id = ?",
                    [self.source.as_str(), owner],
                )
                .await?
        };
        self.notify(LocalChange::Cleared);
        Ok(usize::try_from(affected).unwrap_or_default())
    }

    async fn purge_tombstones(&self, owner: &str, keep: &[String]) -> Result<usize> {
        let mut sql = String::from(
            "DELETE FROM documents WHERE source_key = ? AND owner_id = ? AND is_deleted = 1",
        );
        let mut params = vec![Value::from(self.source.as_str()), Value::from(owner)];
        if !keep.is_empty() {
            let placeholders = vec!["?"; keep.len()].join(", ");
            sql.push_str(&format!(" AND id NOT IN ({placeholders})"));
            params.extend(keep.iter().map(|id| Value::from(id.as_str())));
        }

        let db = self.service.lock().await;
        let affected = db.connection().execute(&sql, params).await?;
        Ok(usize::try_from(affected).unwrap_or_default())
    }

    fn observe(&self) -> broadcast::Receiver<LocalChange> {
        self.changes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const OWNER: &str = "user-1";

    async fn setup(source: &str) -> LibSqlLocalStore {
        let service = DatabaseService::open_in_memory().await.unwrap();
        LibSqlLocalStore::new(service, SourceSyncKey::new(source).unwrap())
    }

    fn doc(id: &str, updated_at: i64, payload: serde_json::Value) -> Document {
        Document::new(id, updated_at, payload).unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_upsert_and_get() {
        let store = setup("homeworks").await;
        let homework = doc("hw-1", 10, json!({"title": "Essay", "done": false}));
        store.upsert(OWNER, &homework).await.unwrap();

        assert_eq!(store.get(OWNER, "hw-1").await.unwrap(), Some(homework.clone()));
        assert_eq!(store.get("someone-else", "hw-1").await.unwrap(), None);

        let updated = doc("hw-1", 20, json!({"title": "Essay", "done": true}));
        store.upsert(OWNER, &updated).await.unwrap();
        assert_eq!(store.get(OWNER, "hw-1").await.unwrap(), Some(updated));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_sources_are_partitioned() {
        let service = DatabaseService::open_in_memory().await.unwrap();
        let subjects = LibSqlLocalStore::new(service.clone(), SourceSyncKey::new("subjects").unwrap());
        let employees = LibSqlLocalStore::new(service, SourceSyncKey::new("employees").unwrap());

        subjects.upsert(OWNER, &doc("x", 1, json!({}))).await.unwrap();
        assert!(employees.get(OWNER, "x").await.unwrap().is_none());
        assert_eq!(subjects.metadata(OWNER).await.unwrap().len(), 1);
        assert!(employees.metadata(OWNER).await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_list_filters_and_pages() {
        let store = setup("homeworks").await;
        store
            .upsert(OWNER, &doc("a", 1, json!({"subject_id": "math", "week": 3, "done": true})))
            .await
            .unwrap();
        store
            .upsert(OWNER, &doc("b", 2, json!({"subject_id": "math", "week": 4, "done": false})))
            .await
            .unwrap();
        store
            .upsert(OWNER, &doc("c", 3, json!({"subject_id": "art", "week": 3})))
            .await
            .unwrap();

        let all = store.list(OWNER, &DocumentQuery::all()).await.unwrap();
        let ids: Vec<_> = all.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "b", "a"]);

        let math = store
            .list(OWNER, &DocumentQuery::all().where_eq("subject_id", "math"))
            .await
            .unwrap();
        assert_eq!(math.len(), 2);

        let week3_math = store
            .list(
                OWNER,
                &DocumentQuery::all().where_eq("subject_id", "math").where_eq("week", 3),
            )
            .await
            .unwrap();
        assert_eq!(week3_math.len(), 1);
        assert_eq!(week3_math[0].id, "a");

        let done = store
            .list(OWNER, &DocumentQuery::all().where_eq("done", true))
            .await
            .unwrap();
        assert_eq!(done.len(), 1);

        let missing_done = store
            .list(OWNER, &DocumentQuery::all().where_eq("done", serde_json::Value::Null))
            .await
            .unwrap();
        assert_eq!(missing_done.len(), 1);
        assert_eq!(missing_done[0].id, "c");

        let page = store
            .list(OWNER, &DocumentQuery::all().offset(1).limit(1))
            .await
            .unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].id, "b");

        assert!(store
            .list(OWNER, &DocumentQuery::all().where_eq("bad field", 1))
            .await
            .is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_delete_leaves_tombstone() {
        let store = setup("subjects").await;
        store.upsert(OWNER, &doc("math", 10, json!({}))).await.unwrap();

        assert!(store.delete(OWNER, "math", 15).await.unwrap());
        assert!(!store.delete(OWNER, "math", 16).await.unwrap());
        assert!(store.get(OWNER, "math").await.unwrap().is_none());
        assert!(store.metadata(OWNER).await.unwrap().is_empty());
        assert_eq!(store.watermark(OWNER, "math").await.unwrap(), Some(16));

        // Unknown ids still get a tombstone.
        assert!(!store.delete(OWNER, "ghost", 20).await.unwrap());
        assert_eq!(store.watermark(OWNER, "ghost").await.unwrap(), Some(20));

        // Tombstones never move the watermark backwards.
        store.delete(OWNER, "ghost", 5).await.unwrap();
        assert_eq!(store.watermark(OWNER, "ghost").await.unwrap(), Some(20));

        assert_eq!(store.purge_tombstones(OWNER, &["ghost".to_string()]).await.unwrap(), 1);
        assert_eq!(store.watermark(OWNER, "math").await.unwrap(), None);
        assert_eq!(store.watermark(OWNER, "ghost").await.unwrap(), Some(20));

        store.upsert(OWNER, &doc("live", 30, json!({}))).await.unwrap();
        assert_eq!(store.purge_tombstones(OWNER, &[]).await.unwrap(), 1);
        assert_eq!(store.watermark(OWNER, "live").await.unwrap(), Some(30));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_upsert_revives_tombstone() {
        let store = setup("subjects").await;
        store.delete(OWNER, "math", 10).await.unwrap();
        store.upsert(OWNER, &doc("math", 11, json!({"name": "Math"}))).await.unwrap();
        assert_eq!(
            store.metadata(OWNER).await.unwrap(),
            vec![MetadataModel {
                document_id: "math".into(),
                updated_at: 11
            }]
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_delete_many_and_clear() {
        let store = setup("subjects").await;
        for id in ["a", "b", "c"] {
            store.upsert(OWNER, &doc(id, 1, json!({}))).await.unwrap();
        }
        let removed = store
            .delete_many(OWNER, &["a".into(), "b".into(), "zzz".into()], 2)
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.metadata(OWNER).await.unwrap().len(), 1);

        // Live row plus three tombstones.
        assert_eq!(store.clear(OWNER).await.unwrap(), 4);
        assert!(store.metadata(OWNER).await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_observe_reports_writes() {
        let store = setup("subjects").await;
        let mut changes = store.observe();

        store.upsert(OWNER, &doc("a", 1, json!({}))).await.unwrap();
        store.delete(OWNER, "a", 2).await.unwrap();
        store.clear(OWNER).await.unwrap();

        assert_eq!(changes.recv().await.unwrap(), LocalChange::Upserted("a".into()));
        assert_eq!(changes.recv().await.unwrap(), LocalChange::Deleted(vec!["a".into()]));
        assert_eq!(changes.recv().await.unwrap(), LocalChange::Cleared);
    }
}
