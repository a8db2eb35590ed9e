/// Database layer for roster-warden
///
/// Both durable stores (identity cache, access list) are plain SQLite
/// files opened through this pool constructor. WAL journaling plus a busy
/// timeout lets several independent processes share one file, serialized
/// by SQLite's own locking.
use crate::error::{WardenError, WardenResult};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::time::Duration;

/// Database connection options
#[derive(Debug, Clone)]
pub struct DatabaseOptions {
    pub max_connections: u32,
    pub busy_timeout: Duration,
}

impl Default for DatabaseOptions {
    fn default() -> Self {
        Self {
            max_connections: 5,
            busy_timeout: Duration::from_secs(5),
        }
    }
}

/// Create a SQLite connection pool for a store file, creating the file
/// and its parent directory if missing.
pub async fn create_pool(path: &Path, options: DatabaseOptions) -> WardenResult<SqlitePool> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }

    let pool = SqlitePoolOptions::new()
        .max_connections(options.max_connections)
        .connect_with(
            SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal)
                .foreign_keys(true)
                .busy_timeout(options.busy_timeout),
        )
        .await
        .map_err(WardenError::Database)?;

    Ok(pool)
}

/// Single-connection in-memory pool for tests. A larger pool against
/// `:memory:` would hand each connection its own empty database.
#[cfg(test)]
pub async fn memory_pool() -> SqlitePool {
    SqlitePoolOptions::new()
        .max_connections(1)
        .connect(":memory:")
        .await
        .unwrap()
}
