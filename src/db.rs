// SQLite database shared by the index and resume-token stores
use crate::error::StoreError;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use std::path::Path;
use std::time::Duration;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS index_entries (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        content_hash TEXT NOT NULL,
        content_size INTEGER NOT NULL,
        backend_id TEXT NOT NULL,
        remote_ref TEXT NOT NULL,
        link TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        UNIQUE (content_hash, content_size, backend_id)
    )",
    "CREATE TABLE IF NOT EXISTS transfer_sessions (
        content_hash TEXT NOT NULL,
        content_size INTEGER NOT NULL,
        backend_id TEXT NOT NULL,
        handle TEXT NOT NULL,
        chunk_size INTEGER NOT NULL,
        attempt INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        PRIMARY KEY (content_hash, content_size, backend_id)
    )",
];

/// Handle to the on-disk state database
///
/// WAL mode lets readers see a consistent snapshot while another process
/// writes; SQLite's file lock serializes writers, and the busy timeout makes
/// concurrent invocations queue instead of failing.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Create or open the database at path
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full)
            .busy_timeout(Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.migrate().await?;
        tracing::debug!("Opened state database: {}", path.display());
        Ok(db)
    }

    /// Private in-memory database; a single connection keeps every query on
    /// the same memory image
    #[cfg(test)]
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options: SqliteConnectOptions = "sqlite::memory:".parse()?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(*statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Flush and release every connection
    pub async fn close(&self) {
        self.pool.close().await;
    }
}
