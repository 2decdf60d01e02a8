//! SQLite connection management for the per-job store.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};

use crate::domain::errors::{GatorError, GatorResult};

/// Connection manager for one store file. The pool is capped at a single
/// connection so all writes serialize through one writer.
pub struct StoreConnection {
    pool: SqlitePool,
}

impl StoreConnection {
    /// Open (creating if missing) the store at `path` with WAL enabled.
    pub async fn open(path: &Path) -> GatorResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let url = format!("sqlite:{}", path.display());
        let options = SqliteConnectOptions::from_str(&url)
            .map_err(|err| GatorError::Store(format!("invalid store path: {err}")))?
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5))
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await
            .map_err(|err| GatorError::Store(format!("failed to open store: {err}")))?;

        Ok(Self { pool })
    }

    /// Open an in-memory store (tests and dry runs).
    pub async fn open_in_memory() -> GatorResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|err| GatorError::Store(format!("failed to open store: {err}")))?;
        Ok(Self { pool })
    }

    /// Apply schema migrations.
    pub async fn migrate(&self) -> GatorResult<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|err| GatorError::Store(format!("migration failed: {err}")))?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_and_migrate_in_memory() {
        let conn = StoreConnection::open_in_memory()
            .await
            .expect("failed to open store");
        conn.migrate().await.expect("failed to migrate");
        assert!(!conn.pool().is_closed());
        conn.close().await;
    }

    #[tokio::test]
    async fn test_open_on_disk_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/track/db.sqlite");
        let conn = StoreConnection::open(&path).await.expect("open failed");
        conn.migrate().await.expect("migrate failed");
        conn.close().await;
        assert!(path.exists());
    }
}
