//! Connection pools for the snapshot database.
//!
//! Snapshot writes are serialized through a one-connection writer pool while
//! run listings and snapshot loads share a read-only pool. The database runs
//! in WAL mode so readers never block the writer.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

const DATABASE_FILE: &str = "weft.db";
const READER_CONNECTIONS: u32 = 8;
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Reader and writer pools over one SQLite file.
#[derive(Clone)]
pub struct DatabasePool {
    /// Read-only, up to eight connections.
    pub reader: SqlitePool,
    /// Single connection; every snapshot upsert goes through it.
    pub writer: SqlitePool,
}

impl DatabasePool {
    /// Connect to `database_url` and apply pending migrations.
    ///
    /// The writer is opened and migrated first, so the reader pool never sees
    /// a schema older than the code expects.
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT)
            .create_if_missing(true);

        let writer = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options.clone())
            .await?;
        sqlx::migrate!("../../migrations").run(&writer).await?;

        let reader = SqlitePoolOptions::new()
            .max_connections(READER_CONNECTIONS)
            .connect_with(options.read_only(true))
            .await?;

        tracing::debug!(url = database_url, "snapshot database ready");
        Ok(Self { reader, writer })
    }

    /// Open `{data_dir}/weft.db`, creating the directory if needed.
    pub async fn open_in(data_dir: &Path) -> Result<Self, sqlx::Error> {
        tokio::fs::create_dir_all(data_dir).await?;
        let url = format!("sqlite://{}?mode=rwc", data_dir.join(DATABASE_FILE).display());
        tracing::info!(path = %data_dir.display(), "opening snapshot database");
        Self::new(&url).await
    }
}

/// Data directory from `WEFT_DATA_DIR`, falling back to `~/.weft`.
pub fn default_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("WEFT_DATA_DIR") {
        return PathBuf::from(dir);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".weft")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn temp_pool() -> (TempDir, DatabasePool) {
        let dir = TempDir::new().unwrap();
        let pool = DatabasePool::open_in(dir.path()).await.unwrap();
        (dir, pool)
    }

    #[tokio::test]
    async fn migrations_create_the_snapshot_table() {
        let (_dir, pool) = temp_pool().await;

        let tables: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type = 'table' \
             AND name NOT LIKE 'sqlite_%' AND name != '_sqlx_migrations'",
        )
        .fetch_all(&pool.reader)
        .await
        .unwrap();
        assert_eq!(tables, vec![("workflow_snapshots".to_string(),)]);
    }

    #[tokio::test]
    async fn writer_runs_in_wal_mode() {
        let (_dir, pool) = temp_pool().await;
        let (mode,): (String,) = sqlx::query_as("PRAGMA journal_mode")
            .fetch_one(&pool.writer)
            .await
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
    }

    #[tokio::test]
    async fn run_key_is_unique_per_workflow() {
        let (_dir, pool) = temp_pool().await;
        let insert = "INSERT INTO workflow_snapshots \
             (workflow_name, run_id, status, snapshot, created_at, updated_at) \
             VALUES (?1, 'run-1', 'pending', '{}', '2026-01-01', '2026-01-01')";

        sqlx::query(insert).bind("wf").execute(&pool.writer).await.unwrap();
        sqlx::query(insert).bind("other").execute(&pool.writer).await.unwrap();
        let duplicate = sqlx::query(insert).bind("wf").execute(&pool.writer).await;
        assert!(duplicate.is_err());

        let (rows,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM workflow_snapshots")
            .fetch_one(&pool.reader)
            .await
            .unwrap();
        assert_eq!(rows, 2);
    }

    #[tokio::test]
    async fn reader_pool_rejects_writes() {
        let (_dir, pool) = temp_pool().await;
        let write = sqlx::query("DELETE FROM workflow_snapshots")
            .execute(&pool.reader)
            .await;
        assert!(write.is_err());
    }

    #[tokio::test]
    async fn open_in_creates_missing_directories() {
        let dir = TempDir::new().unwrap();
        let data_dir = dir.path().join("nested").join("weft");

        let _pool = DatabasePool::open_in(&data_dir).await.unwrap();
        assert!(data_dir.join(DATABASE_FILE).exists());
    }
}
