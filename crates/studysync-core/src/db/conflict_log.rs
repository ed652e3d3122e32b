//! Conflict log repository

#![allow(clippy::cast_possible_wrap)] // SQLite uses i64 for LIMIT

use async_trait::async_trait;
use libsql::Value;

use crate::error::Result;
use crate::models::{ConflictStrategy, SourceSyncKey, SyncConflict};
use crate::services::DatabaseService;

/// Append-only record of conflicts resolved during sync
#[async_trait]
pub trait ConflictLog: Send + Sync {
    async fn record(
        &self,
        source: &SourceSyncKey,
        document_id: &str,
        local_updated_at: i64,
        incoming_updated_at: i64,
        strategy: ConflictStrategy,
    ) -> Result<()>;

    /// Most recent conflicts first
    async fn list(&self, limit: usize) -> Result<Vec<SyncConflict>>;
}

/// libSQL implementation of `ConflictLog`
#[derive(Clone)]
pub struct LibSqlConflictLog {
    service: DatabaseService,
}

impl LibSqlConflictLog {
    pub const fn new(service: DatabaseService) -> Self {
        Self { service }
    }
}

#[async_trait]
impl ConflictLog for LibSqlConflictLog {
    async fn record(
        &self,
        source: &SourceSyncKey,
        document_id: &str,
        local_updated_at: i64,
        incoming_updated_at: i64,
        strategy: ConflictStrategy,
    ) -> Result<()> {
        let resolved_at = chrono::Utc::now().timestamp_millis();
        let db = self.service.lock().await;
        db.connection()
            .execute(
                "INSERT INTO sync_conflicts (source_key, document_id, local_updated_at, incoming_updated_at, resolved_at, strategy)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                vec![
                    Value::from(source.as_str()),
                    Value::from(document_id),
                    Value::from(local_updated_at),
                    Value::from(incoming_updated_at),
                    Value::from(resolved_at),
                    Value::from(strategy.as_str()),
                ],
            )
            .await?;

        tracing::info!(
            source = %source,
            document = document_id,
            local_updated_at,
            incoming_updated_at,
            "Resolved sync conflict with {}",
            strategy.as_str()
        );
        Ok(())
    }

    async fn list(&self, limit: usize) -> Result<Vec<SyncConflict>> {
        let db = self.service.lock().await;
        let mut rows = db
            .connection()
            .query(
                "SELECT id, source_key, document_id, local_updated_at, incoming_updated_at, resolved_at, strategy
                 FROM sync_conflicts
                 ORDER BY resolved_at DESC, id DESC
                 LIMIT ?",
                [limit as i64],
            )
            .await?;

        let mut conflicts = Vec::new();
        while let Some(row) = rows.next().await? {
            conflicts.push(SyncConflict {
                id: row.get(0)?,
                source_key: row.get(1)?,
                document_id: row.get(2)?,
                local_updated_at: row.get(3)?,
                incoming_updated_at: row.get(4)?,
                resolved_at: row.get(5)?,
                strategy: row.get(6)?,
            });
        }
        Ok(conflicts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread")]
    async fn test_record_and_list_newest_first() {
        let log = LibSqlConflictLog::new(DatabaseService::open_in_memory().await.unwrap());
        let source = SourceSyncKey::new("homeworks").unwrap();

        log.record(&source, "hw-1", 150, 200, ConflictStrategy::RemoteWins)
            .await
            .unwrap();
        log.record(&source, "hw-2", 95, 90, ConflictStrategy::StaleEvent)
            .await
            .unwrap();

        let conflicts = log.list(10).await.unwrap();
        assert_eq!(conflicts.len(), 2);
        assert_eq!(conflicts[0].document_id, "hw-2");
        assert_eq!(conflicts[0].strategy, "stale_event");
        assert_eq!(conflicts[1].local_updated_at, 150);
        assert_eq!(conflicts[1].incoming_updated_at, 200);
        assert_eq!(conflicts[1].source_key, "homeworks");

        assert_eq!(log.list(1).await.unwrap().len(), 1);
    }
}
