//! Database migrations

use crate::error::Result;
use libsql::Connection;

/// Current schema version
const CURRENT_VERSION: i32 = 2;

/// Run all pending migrations
pub async fn run(conn: &Connection) -> Result<()> {
    let version = get_version(conn).await?;

    if version < 1 {
        migrate_v1(conn).await?;
    }
    if version < 2 {
        migrate_v2(conn).await?;
    }

    Ok(())
}

/// Get the current schema version
async fn get_version(conn: &Connection) -> Result<i32> {
    let mut rows = conn
        .query(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
            (),
        )
        .await?;

    let exists: bool = if let Some(row) = rows.next().await? {
        row.get::<i32>(0)? != 0
    } else {
        false
    };

    if !exists {
        return Ok(0);
    }

    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM schema_version", ())
        .await?;

    let version: i32 = if let Some(row) = rows.next().await? {
        row.get(0)?
    } else {
        0
    };

    Ok(version)
}

async fn apply(conn: &Connection, statements: &[&str]) -> Result<()> {
    conn.execute("BEGIN TRANSACTION", ()).await?;

    for stmt in statements {
        if let Err(e) = conn.execute(stmt, ()).await {
            conn.execute("ROLLBACK", ()).await.ok();
            return Err(e.into());
        }
    }

    if let Err(e) = conn.execute("COMMIT", ()).await {
        conn.execute("ROLLBACK", ()).await.ok();
        return Err(e.into());
    }

    Ok(())
}

/// Migration to version 1: local replica and offline queue
async fn migrate_v1(conn: &Connection) -> Result<()> {
    let statements = [
        // Schema version tracking
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        )",
        // Local replica, one partition per (source, owner). Deletions are
        // tombstones that keep the deletion watermark.
        "CREATE TABLE IF NOT EXISTS documents (
            source_key TEXT NOT NULL,
            owner_id TEXT NOT NULL,
            id TEXT NOT NULL,
            payload TEXT NOT NULL,
            updated_at INTEGER NOT NULL,
            is_deleted INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (source_key, owner_id, id)
        )",
        "CREATE INDEX IF NOT EXISTS idx_documents_updated ON documents(source_key, owner_id, updated_at DESC)",
        "CREATE INDEX IF NOT EXISTS idx_documents_deleted ON documents(is_deleted)",
        // Pending offline mutations, one slot per document
        "CREATE TABLE IF NOT EXISTS offline_changes (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT NOT NULL UNIQUE,
            source_key TEXT NOT NULL,
            document_id TEXT NOT NULL,
            operation TEXT NOT NULL CHECK (operation IN ('upsert', 'delete')),
            payload BLOB,
            updated_at INTEGER NOT NULL,
            enqueued_at INTEGER NOT NULL,
            UNIQUE (source_key, document_id)
        )",
        "CREATE INDEX IF NOT EXISTS idx_offline_changes_source ON offline_changes(source_key, seq)",
        // Changes the backend refused for good, awaiting manual resolution
        "CREATE TABLE IF NOT EXISTS parked_changes (
            id TEXT PRIMARY KEY,
            source_key TEXT NOT NULL,
            document_id TEXT NOT NULL,
            operation TEXT NOT NULL,
            payload BLOB,
            updated_at INTEGER NOT NULL,
            enqueued_at INTEGER NOT NULL,
            parked_at INTEGER NOT NULL,
            reason TEXT NOT NULL
        )",
        "CREATE INDEX IF NOT EXISTS idx_parked_changes_source ON parked_changes(source_key, parked_at)",
        // Record migration version
        "INSERT INTO schema_version (version) VALUES (1)",
    ];

    apply(conn, &statements).await?;
    tracing::info!("Migrated database to version 1");
    Ok(())
}

/// Migration to version 2: conflict log
async fn migrate_v2(conn: &Connection) -> Result<()> {
    let statements = [
        "CREATE TABLE IF NOT EXISTS sync_conflicts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            source_key TEXT NOT NULL,
            document_id TEXT NOT NULL,
            local_updated_at INTEGER NOT NULL,
            incoming_updated_at INTEGER NOT NULL,
            resolved_at INTEGER NOT NULL,
            strategy TEXT NOT NULL
        )",
        "CREATE INDEX IF NOT EXISTS idx_sync_conflicts_document ON sync_conflicts(source_key, document_id)",
        "CREATE INDEX IF NOT EXISTS idx_sync_conflicts_resolved_at ON sync_conflicts(resolved_at DESC)",
        "INSERT INTO schema_version (version) VALUES (2)",
    ];

    apply(conn, &statements).await?;
    tracing::info!("Migrated database to version {CURRENT_VERSION}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use libsql::Builder;

    async fn setup() -> Connection {
        let db = Builder::new_local(":memory:").build().await.unwrap();
        db.connect().unwrap()
    }

    async fn table_exists(conn: &Connection, name: &str) -> bool {
        let mut rows = conn
            .query(
                "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?)",
                [name],
            )
            .await
            .unwrap();

        rows.next()
            .await
            .unwrap()
            .is_some_and(|row| row.get::<i32>(0).unwrap() != 0)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_migrations() {
        let conn = setup().await;
        run(&conn).await.unwrap();

        let version = get_version(&conn).await.unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_migrations_idempotent() {
        let conn = setup().await;
        run(&conn).await.unwrap();
        run(&conn).await.unwrap(); // Should not fail

        let version = get_version(&conn).await.unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_migrations_create_sync_tables() {
        let conn = setup().await;
        run(&conn).await.unwrap();

        for table in ["documents", "offline_changes", "parked_changes", "sync_conflicts"] {
            assert!(table_exists(&conn, table).await, "missing table {table}");
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_offline_changes_unique_per_document() {
        let conn = setup().await;
        run(&conn).await.unwrap();

        conn.execute(
            "INSERT INTO offline_changes (id, source_key, document_id, operation, updated_at, enqueued_at)
             VALUES ('a', 'subjects', 'math', 'delete', 1, 1)",
            (),
        )
        .await
        .unwrap();
        let duplicate = conn
            .execute(
                "INSERT INTO offline_changes (id, source_key, document_id, operation, updated_at, enqueued_at)
                 VALUES ('b', 'subjects', 'math', 'delete', 2, 2)",
                (),
            )
            .await;
        assert!(duplicate.is_err());
    }
}
