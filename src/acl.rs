/// Access List Store - durable set of currently-authorized identities
///
/// Keyed by account id. Display-name duplication across entries is fine;
/// account-id duplication is not — adding an existing account id is a
/// no-op. The expire sweep deletes every entry not refreshed since the
/// cutoff, which the reconciler uses as a proxy for "no longer on the
/// roster".
///
/// Timestamps are stored as Unix-epoch milliseconds; the public API
/// speaks `chrono` types.
use crate::error::{WardenError, WardenResult};
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use std::path::Path;

/// One authorized identity
#[derive(Debug, Clone)]
pub struct AclEntry {
    pub account_id: String,
    pub display_name: String,
    pub added_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

/// Durable access list over a SQLite file
#[derive(Clone)]
pub struct AccessList {
    db: SqlitePool,
}

impl AccessList {
    /// Open or create an access list file
    pub async fn open(path: &Path) -> WardenResult<Self> {
        let db = crate::db::create_pool(path, crate::db::DatabaseOptions::default()).await?;
        Self::from_pool(db).await
    }

    /// Wrap an existing pool, creating the schema if missing
    pub async fn from_pool(db: SqlitePool) -> WardenResult<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS allowed_users (
                account_id   TEXT PRIMARY KEY NOT NULL,
                display_name TEXT NOT NULL DEFAULT '',
                added_at     INTEGER NOT NULL,
                last_seen_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&db)
        .await
        .map_err(WardenError::Database)?;

        Ok(Self { db })
    }

    /// Find an entry by account id
    pub async fn find(&self, account_id: &str) -> WardenResult<Option<AclEntry>> {
        let result = sqlx::query(
            r#"
            SELECT account_id, display_name, added_at, last_seen_at
            FROM allowed_users
            WHERE account_id = ?1
            LIMIT 1
            "#,
        )
        .bind(account_id)
        .fetch_optional(&self.db)
        .await
        .map_err(WardenError::Database)?;

        match result {
            Some(row) => Ok(Some(entry_from_row(&row)?)),
            None => Ok(None),
        }
    }

    /// All entries, in no particular order
    pub async fn entries(&self) -> WardenResult<Vec<AclEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT account_id, display_name, added_at, last_seen_at
            FROM allowed_users
            "#,
        )
        .fetch_all(&self.db)
        .await
        .map_err(WardenError::Database)?;

        rows.iter().map(entry_from_row).collect()
    }

    /// Add a new entry with `added_at = last_seen_at = now`. Adding an
    /// account id that already exists changes nothing and returns false.
    pub async fn add(
        &self,
        account_id: &str,
        display_name: &str,
        now: DateTime<Utc>,
    ) -> WardenResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE
            INTO allowed_users (account_id, display_name, added_at, last_seen_at)
            VALUES (?1, ?2, ?3, ?3)
            "#,
        )
        .bind(account_id)
        .bind(display_name)
        .bind(now.timestamp_millis())
        .execute(&self.db)
        .await
        .map_err(WardenError::Database)?;

        Ok(result.rows_affected() > 0)
    }

    /// Remove an entry by account id. Returns whether one was removed.
    pub async fn remove(&self, account_id: &str) -> WardenResult<bool> {
        let result = sqlx::query("DELETE FROM allowed_users WHERE account_id = ?1")
            .bind(account_id)
            .execute(&self.db)
            .await
            .map_err(WardenError::Database)?;

        Ok(result.rows_affected() > 0)
    }

    /// Refresh an entry's `last_seen_at`. Returns false if the account id
    /// has no entry.
    pub async fn touch(&self, account_id: &str, now: DateTime<Utc>) -> WardenResult<bool> {
        let result = sqlx::query("UPDATE allowed_users SET last_seen_at = ?1 WHERE account_id = ?2")
            .bind(now.timestamp_millis())
            .bind(account_id)
            .execute(&self.db)
            .await
            .map_err(WardenError::Database)?;

        Ok(result.rows_affected() > 0)
    }

    /// Delete every entry last seen strictly before `cutoff`. Returns the
    /// count removed.
    pub async fn expire(&self, cutoff: DateTime<Utc>) -> WardenResult<u64> {
        let result = sqlx::query("DELETE FROM allowed_users WHERE last_seen_at < ?1")
            .bind(cutoff.timestamp_millis())
            .execute(&self.db)
            .await
            .map_err(WardenError::Database)?;

        Ok(result.rows_affected())
    }

    /// Number of entries
    pub async fn len(&self) -> WardenResult<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM allowed_users")
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

fn entry_from_row(row: &sqlx::sqlite::SqliteRow) -> WardenResult<AclEntry> {
    Ok(AclEntry {
        account_id: row.try_get("account_id")?,
        display_name: row.try_get("display_name")?,
        added_at: datetime_from_millis(row.try_get("added_at")?)?,
        last_seen_at: datetime_from_millis(row.try_get("last_seen_at")?)?,
    })
}

fn datetime_from_millis(ms: i64) -> WardenResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| WardenError::Internal(format!("invalid stored timestamp: {}", ms)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory_pool;

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    async fn create_test_acl() -> AccessList {
        AccessList::from_pool(memory_pool().await).await.unwrap()
    }

    #[tokio::test]
    async fn find_missing_account_returns_none() {
        let acl = create_test_acl().await;
        assert!(acl.find("bogus_account_id").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn add_then_find() {
        let acl = create_test_acl().await;

        assert!(acl.add("31337", "Test User", t(0)).await.unwrap());

        let entry = acl.find("31337").await.unwrap().unwrap();
        assert_eq!(entry.account_id, "31337");
        assert_eq!(entry.display_name, "Test User");
        assert_eq!(entry.added_at, t(0));
        assert_eq!(entry.last_seen_at, t(0));
    }

    #[tokio::test]
    async fn add_existing_account_is_a_noop() {
        let acl = create_test_acl().await;

        assert!(acl.add("12345", "Test User", t(0)).await.unwrap());
        assert!(!acl.add("12345", "Different", t(10)).await.unwrap());

        // nothing about the original entry changed
        let entry = acl.find("12345").await.unwrap().unwrap();
        assert_eq!(entry.display_name, "Test User");
        assert_eq!(entry.added_at, t(0));
        assert_eq!(entry.last_seen_at, t(0));
        assert_eq!(acl.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn duplicate_display_names_are_separate_entries() {
        let acl = create_test_acl().await;

        assert!(acl.add("12345", "Test User", t(0)).await.unwrap());
        assert!(acl.add("12346", "Test User", t(0)).await.unwrap());

        assert_eq!(acl.find("12345").await.unwrap().unwrap().display_name, "Test User");
        assert_eq!(acl.find("12346").await.unwrap().unwrap().display_name, "Test User");
        assert_eq!(acl.len().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn remove_reports_presence_once() {
        let acl = create_test_acl().await;

        assert!(!acl.remove("12345").await.unwrap());
        assert!(acl.add("12345", "Test User", t(0)).await.unwrap());
        assert!(acl.remove("12345").await.unwrap());
        assert!(!acl.remove("12345").await.unwrap());
    }

    #[tokio::test]
    async fn touch_refreshes_last_seen_only() {
        let acl = create_test_acl().await;

        acl.add("12345", "Test User", t(0)).await.unwrap();
        assert!(acl.touch("12345", t(30)).await.unwrap());
        assert!(!acl.touch("missing", t(30)).await.unwrap());

        let entry = acl.find("12345").await.unwrap().unwrap();
        assert_eq!(entry.added_at, t(0));
        assert_eq!(entry.last_seen_at, t(30));
    }

    #[tokio::test]
    async fn expire_removes_exactly_the_stale_entries() {
        let acl = create_test_acl().await;

        acl.add("1", "Stale", t(0)).await.unwrap();
        acl.add("2", "Fresh", t(10)).await.unwrap();
        acl.add("3", "Newer", t(20)).await.unwrap();

        // strictly-before semantics: last_seen == cutoff survives
        assert_eq!(acl.expire(t(10)).await.unwrap(), 1);
        assert!(acl.find("1").await.unwrap().is_none());
        assert!(acl.find("2").await.unwrap().is_some());
        assert!(acl.find("3").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn entries_lists_everything() {
        let acl = create_test_acl().await;

        acl.add("1", "One", t(0)).await.unwrap();
        acl.add("2", "Two", t(0)).await.unwrap();

        let mut ids: Vec<String> = acl
            .entries()
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.account_id)
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["1".to_string(), "2".to_string()]);
    }

    #[tokio::test]
    async fn writes_are_visible_through_a_second_handle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("acl.sqlite");

        let writer = AccessList::open(&path).await.unwrap();
        let reader = AccessList::open(&path).await.unwrap();

        assert_eq!(reader.len().await.unwrap(), 0);
        assert!(writer.add("12345", "Test User", t(0)).await.unwrap());
        assert_eq!(reader.len().await.unwrap(), 1);

        // the second handle writes too, against the same locking
        assert!(!reader.add("12345", "Test User 2", t(0)).await.unwrap());
        assert!(reader.add("12346", "Test User 2", t(0)).await.unwrap());
        assert_eq!(writer.len().await.unwrap(), 2);

        writer.close().await;
        reader.close().await;
    }

    #[tokio::test]
    async fn entries_persist_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("acl.sqlite");

        let acl = AccessList::open(&path).await.unwrap();
        acl.add("1000", "First User", t(0)).await.unwrap();
        acl.add("1001", "Second User", t(0)).await.unwrap();
        acl.close().await;
        assert!(!acl.is_open());

        let reopened = AccessList::open(&path).await.unwrap();
        assert_eq!(reopened.len().await.unwrap(), 2);
        assert!(reopened.find("1000").await.unwrap().is_some());
        reopened.close().await;
    }

    #[tokio::test]
    async fn operations_fail_loudly_after_close() {
        let acl = create_test_acl().await;
        acl.close().await;
        assert!(!acl.is_open());

        assert!(acl.find("1").await.is_err());
        assert!(acl.add("1", "x", t(0)).await.is_err());
        assert!(acl.touch("1", t(0)).await.is_err());
        assert!(acl.remove("1").await.is_err());
        assert!(acl.expire(t(0)).await.is_err());
        assert!(acl.len().await.is_err());
        assert!(acl.entries().await.is_err());
    }
}
