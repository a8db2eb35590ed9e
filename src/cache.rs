/// Identity Cache - durable handle-to-identity store with sliding TTL
///
/// Keyed by member handle. A hit refreshes the entry's sliding window;
/// rows only ever leave the table through `remove` or the `sweep`
/// operation, which evicts every entry whose window has lapsed.
///
/// Timestamps are stored as Unix-epoch milliseconds and the TTL as whole
/// seconds; the public API speaks `chrono` types.
use crate::{
    directory::Identity,
    error::{WardenError, WardenResult},
};
use chrono::{DateTime, Duration, Utc};
use sqlx::{Row, SqlitePool};
use std::path::Path;

/// One cached identity resolution
#[derive(Debug, Clone)]
pub struct CachedIdentity {
    pub handle: String,
    pub account_id: String,
    pub display_name: String,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub ttl: Duration,
}

impl CachedIdentity {
    /// The identity this entry resolves to
    pub fn identity(&self) -> Identity {
        Identity {
            handle: self.handle.clone(),
            display_name: self.display_name.clone(),
            account_id: self.account_id.clone(),
        }
    }
}

/// Durable identity cache over a SQLite file
#[derive(Clone)]
pub struct IdentityCache {
    db: SqlitePool,
}

impl IdentityCache {
    /// Open or create a cache file
    pub async fn open(path: &Path) -> WardenResult<Self> {
        let db = crate::db::create_pool(path, crate::db::DatabaseOptions::default()).await?;
        Self::from_pool(db).await
    }

    /// Wrap an existing pool, creating the schema if missing
    pub async fn from_pool(db: SqlitePool) -> WardenResult<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS identity_cache (
                handle       TEXT PRIMARY KEY NOT NULL,
                account_id   TEXT NOT NULL,
                display_name TEXT NOT NULL DEFAULT '',
                created_at   INTEGER NOT NULL,
                last_seen_at INTEGER NOT NULL,
                ttl_seconds  INTEGER NOT NULL
            )
            "#,
        )
        .execute(&db)
        .await
        .map_err(WardenError::Database)?;

        Ok(Self { db })
    }

    /// Look up a cached identity by handle. A hit refreshes the sliding
    /// window to `now`. Expiry is not consulted here: presence in the
    /// table is a hit, and eviction happens only through `sweep`.
    pub async fn get(
        &self,
        handle: &str,
        now: DateTime<Utc>,
    ) -> WardenResult<Option<CachedIdentity>> {
        let result = sqlx::query(
            r#"
            SELECT handle, account_id, display_name, created_at, last_seen_at, ttl_seconds
            FROM identity_cache
            WHERE handle = ?1
            LIMIT 1
            "#,
        )
        .bind(handle)
        .fetch_optional(&self.db)
        .await
        .map_err(WardenError::Database)?;

        let row = match result {
            Some(row) => row,
            None => return Ok(None),
        };

        let entry = CachedIdentity {
            handle: row.try_get("handle")?,
            account_id: row.try_get("account_id")?,
            display_name: row.try_get("display_name")?,
            created_at: datetime_from_millis(row.try_get("created_at")?)?,
            last_seen_at: datetime_from_millis(row.try_get("last_seen_at")?)?,
            ttl: Duration::seconds(row.try_get("ttl_seconds")?),
        };

        sqlx::query("UPDATE identity_cache SET last_seen_at = ?1 WHERE handle = ?2")
            .bind(now.timestamp_millis())
            .bind(handle)
            .execute(&self.db)
            .await
            .map_err(WardenError::Database)?;

        Ok(Some(entry))
    }

    /// Insert or refresh a cache entry. An existing entry keeps its
    /// `created_at`; everything else is replaced and the window restarts
    /// at `now`.
    pub async fn put(
        &self,
        handle: &str,
        identity: &Identity,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> WardenResult<()> {
        sqlx::query(
            r#"
            INSERT INTO identity_cache
                (handle, account_id, display_name, created_at, last_seen_at, ttl_seconds)
            VALUES (?1, ?2, ?3, ?4, ?4, ?5)
            ON CONFLICT(handle) DO UPDATE SET
                account_id = excluded.account_id,
                display_name = excluded.display_name,
                last_seen_at = excluded.last_seen_at,
                ttl_seconds = excluded.ttl_seconds
            "#,
        )
        .bind(handle)
        .bind(&identity.account_id)
        .bind(&identity.display_name)
        .bind(now.timestamp_millis())
        .bind(ttl.num_seconds())
        .execute(&self.db)
        .await
        .map_err(WardenError::Database)?;

        Ok(())
    }

    /// Remove an entry by handle. Returns whether an entry was removed.
    pub async fn remove(&self, handle: &str) -> WardenResult<bool> {
        let result = sqlx::query("DELETE FROM identity_cache WHERE handle = ?1")
            .bind(handle)
            .execute(&self.db)
            .await
            .map_err(WardenError::Database)?;

        Ok(result.rows_affected() > 0)
    }

    /// Evict every entry whose sliding window has lapsed
    /// (`now >= last_seen_at + ttl`). Returns the count evicted.
    pub async fn sweep(&self, now: DateTime<Utc>) -> WardenResult<u64> {
        let result =
            sqlx::query("DELETE FROM identity_cache WHERE last_seen_at + ttl_seconds * 1000 <= ?1")
                .bind(now.timestamp_millis())
                .execute(&self.db)
                .await
                .map_err(WardenError::Database)?;

        Ok(result.rows_affected())
    }

    /// Number of entries currently cached
    pub async fn len(&self) -> WardenResult<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM identity_cache")
            .fetch_one(&self.db)
            .await
            .map_err(WardenError::Database)?;

        Ok(count as u64)
    }

    pub fn is_open(&self) -> bool {
        !self.db.is_closed()
    }

    /// Close the underlying pool. Further operations fail with a
    /// pool-closed database error.
    pub async fn close(&self) {
        self.db.close().await;
    }
}

fn datetime_from_millis(ms: i64) -> WardenResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| WardenError::Internal(format!("invalid stored timestamp: {}", ms)))
}
