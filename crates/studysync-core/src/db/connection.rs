//! Database connection management

use crate::error::Result;
use libsql::{Builder, Connection, Database as LibSqlDatabase, Value};
use std::path::Path;

use super::migrations;

/// Database wrapper for the local libSQL replica
pub struct Database {
    // Keeps the database handle alive for the lifetime of the connection.
    _db: LibSqlDatabase,
    conn: Connection,
}

impl Database {
    /// Open a local database at the given path, creating it if it doesn't exist
    ///
    /// Runs migrations automatically.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        let db = Builder::new_local(&path_str).build().await?;
        let conn = db.connect()?;

        let database = Self { _db: db, conn };
        database.configure().await?;
        database.migrate().await?;
        Ok(database)
    }

    /// Open an in-memory database (useful for testing)
    pub async fn open_in_memory() -> Result<Self> {
        let db = Builder::new_local(":memory:").build().await?;
        let conn = db.connect()?;

        let database = Self { _db: db, conn };
        database.configure().await?;
        database.migrate().await?;
        Ok(database)
    }

    /// Configure `SQLite` for durability of the offline queue
    async fn configure(&self) -> Result<()> {
        // WAL is unavailable for in-memory databases; ignore the refusal there.
        self.conn
            .execute("PRAGMA journal_mode = WAL;", ())
            .await
            .ok();
        self.conn
            .execute("PRAGMA synchronous = FULL;", ())
            .await
            .ok();
        self.conn.execute("PRAGMA foreign_keys = ON;", ()).await?;
        self.conn
            .execute("PRAGMA cache_size = 10000;", ())
            .await
            .ok();
        Ok(())
    }

    /// Run database migrations
    async fn migrate(&self) -> Result<()> {
        migrations::run(&self.conn).await
    }

    /// Get a reference to the underlying connection
    pub const fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Execute statements as one transaction, rolling back on the first failure.
    ///
    /// Returns the total number of affected rows.
    pub async fn execute_atomic(&self, statements: Vec<(&str, Vec<Value>)>) -> Result<u64> {
        self.conn.execute("BEGIN IMMEDIATE", ()).await?;

        let mut affected = 0;
        for (sql, params) in statements {
            match self.conn.execute(sql, params).await {
                Ok(count) => affected += count,
                Err(e) => {
                    self.conn.execute("ROLLBACK", ()).await.ok();
                    return Err(e.into());
                }
            }
        }

        if let Err(e) = self.conn.execute("COMMIT", ()).await {
            self.conn.execute("ROLLBACK", ()).await.ok();
            return Err(e.into());
        }

        Ok(affected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test(flavor = "multi_thread")]
    async fn test_open_in_memory() {
        let db = Database::open_in_memory().await.unwrap();
        let mut rows = db.connection().query("SELECT 1", ()).await.unwrap();
        let row = rows.next().await.unwrap().unwrap();
        assert_eq!(row.get::<i32>(0).unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_open_file_survives_reopen() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("studysync.db");

        {
            let db = Database::open(&path).await.unwrap();
            db.connection()
                .execute(
                    "INSERT INTO offline_changes (id, source_key, document_id, operation, payload, updated_at, enqueued_at)
                     VALUES ('c1', 'organizations', 'org-1', 'delete', NULL, 1, 1)",
                    (),
                )
                .await
                .unwrap();
        }

        let db = Database::open(&path).await.unwrap();
        let mut rows = db
            .connection()
            .query("SELECT COUNT(*) FROM offline_changes", ())
            .await
            .unwrap();
        let row = rows.next().await.unwrap().unwrap();
        assert_eq!(row.get::<i64>(0).unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_execute_atomic_rolls_back_on_failure() {
        let db = Database::open_in_memory().await.unwrap();
        let insert = "INSERT INTO offline_changes (id, source_key, document_id, operation, payload, updated_at, enqueued_at)
                      VALUES (?1, 'subjects', ?2, 'delete', NULL, 1, 1)";

        let result = db
            .execute_atomic(vec![
                (insert, vec![Value::from("c1"), Value::from("math")]),
                // Same document twice violates the per-document slot.
                (insert, vec![Value::from("c2"), Value::from("math")]),
            ])
            .await;
        assert!(result.is_err());

        let mut rows = db
            .connection()
            .query("SELECT COUNT(*) FROM offline_changes", ())
            .await
            .unwrap();
        let row = rows.next().await.unwrap().unwrap();
        assert_eq!(row.get::<i64>(0).unwrap(), 0);
    }
}
