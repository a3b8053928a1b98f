use std::{fs, path::PathBuf};

use sqlx::{Row, SqlitePool, migrate::Migrator, sqlite::SqliteConnectOptions};
use thiserror::Error;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, Error)]
pub enum StateError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("XDG data directory is unavailable")]
    MissingDataDir,
    #[error("invalid sync status: {0}")]
    InvalidStatus(String),
    #[error("invalid destination list: {0}")]
    InvalidDestinations(#[from] serde_json::Error),
    #[error("record not found for ({0}, {1})")]
    MissingRecord(String, String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    Pending,
    Synced,
    Failed,
}

impl SyncStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Synced => "synced",
            SyncStatus::Failed => "failed",
        }
    }

    fn parse(value: &str) -> Result<Self, StateError> {
        match value {
            "pending" => Ok(SyncStatus::Pending),
            "synced" => Ok(SyncStatus::Synced),
            "failed" => Ok(SyncStatus::Failed),
            other => Err(StateError::InvalidStatus(other.to_string())),
        }
    }
}

/// Per (file, destination) sync record. `retry_count` never exceeds the
/// configured maximum; a Failed record at the maximum is terminal until an
/// operator reset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDestinationRecord {
    pub file_id: String,
    pub destination_id: String,
    pub status: SyncStatus,
    pub remote_path: Option<String>,
    pub size: Option<i64>,
    pub last_attempt_at: Option<i64>,
    pub last_error: Option<String>,
    pub retry_count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderPolicy {
    pub folder_id: String,
    pub folder_path: String,
    pub destinations: Vec<String>,
    pub recursive: bool,
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryEntry {
    pub file_id: String,
    pub destination_id: String,
    pub attempt: i64,
    pub next_eligible_at: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub destination_id: String,
    pub pending: i64,
    pub synced: i64,
    pub failed: i64,
}

#[derive(Clone)]
pub struct StateStore {
    pool: SqlitePool,
}

impl StateStore {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn open(db_path: Option<PathBuf>) -> Result<Self, StateError> {
        let db_path = match db_path {
            Some(path) => path,
            None => default_db_path()?,
        };
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(&db_path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn init(&self) -> Result<(), StateError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    // ---- folder policies ----

    pub async fn upsert_policy(&self, policy: &FolderPolicy, now: i64) -> Result<(), StateError> {
        let destinations = serde_json::to_string(&policy.destinations)?;
        sqlx::query(
            "INSERT INTO folder_policies (folder_id, folder_path, destinations, recursive, enabled, added_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
             ON CONFLICT(folder_id) DO UPDATE SET
                folder_path = excluded.folder_path,
                destinations = excluded.destinations,
                recursive = excluded.recursive,
                enabled = excluded.enabled,
                updated_at = excluded.updated_at",
        )
        .bind(&policy.folder_id)
        .bind(&policy.folder_path)
        .bind(destinations)
        .bind(if policy.recursive { 1 } else { 0 })
        .bind(if policy.enabled { 1 } else { 0 })
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_policies(&self) -> Result<Vec<FolderPolicy>, StateError> {
        let rows = sqlx::query(
            "SELECT folder_id, folder_path, destinations, recursive, enabled
             FROM folder_policies ORDER BY folder_path ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(policy_from_row(&row)?);
        }
        Ok(out)
    }

    pub async fn get_policy(&self, folder_id: &str) -> Result<Option<FolderPolicy>, StateError> {
        let row = sqlx::query(
            "SELECT folder_id, folder_path, destinations, recursive, enabled
             FROM folder_policies WHERE folder_id = ?1",
        )
        .bind(folder_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(policy_from_row).transpose()
    }

    pub async fn set_policy_enabled(
        &self,
        folder_id: &str,
        enabled: bool,
        now: i64,
    ) -> Result<(), StateError> {
        sqlx::query(
            "UPDATE folder_policies SET enabled = ?1, updated_at = ?2 WHERE folder_id = ?3",
        )
        .bind(if enabled { 1 } else { 0 })
        .bind(now)
        .bind(folder_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn remove_policy(&self, folder_id: &str) -> Result<(), StateError> {
        sqlx::query("DELETE FROM folder_policies WHERE folder_id = ?1")
            .bind(folder_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ---- file destination records ----

    /// Creates the Pending record on first targeting; later calls are no-ops.
    pub async fn ensure_record(
        &self,
        file_id: &str,
        destination_id: &str,
        now: i64,
    ) -> Result<(), StateError> {
        sqlx::query(
            "INSERT INTO file_destinations (file_id, destination_id, status, created_at, updated_at)
             VALUES (?1, ?2, 'pending', ?3, ?3)
             ON CONFLICT(file_id, destination_id) DO NOTHING",
        )
        .bind(file_id)
        .bind(destination_id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_record(
        &self,
        file_id: &str,
        destination_id: &str,
    ) -> Result<Option<FileDestinationRecord>, StateError> {
        let row = sqlx::query(
            "SELECT file_id, destination_id, status, remote_path, size, last_attempt_at, last_error, retry_count
             FROM file_destinations WHERE file_id = ?1 AND destination_id = ?2",
        )
        .bind(file_id)
        .bind(destination_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(record_from_row).transpose()
    }

    pub async fn mark_synced(
        &self,
        file_id: &str,
        destination_id: &str,
        remote_path: &str,
        size: i64,
        now: i64,
    ) -> Result<(), StateError> {
        sqlx::query(
            "INSERT INTO file_destinations
                (file_id, destination_id, status, remote_path, size, last_attempt_at, last_error, retry_count, created_at, updated_at)
             VALUES (?1, ?2, 'synced', ?3, ?4, ?5, NULL, 0, ?5, ?5)
             ON CONFLICT(file_id, destination_id) DO UPDATE SET
                status = 'synced',
                remote_path = excluded.remote_path,
                size = excluded.size,
                last_attempt_at = excluded.last_attempt_at,
                last_error = NULL,
                retry_count = 0,
                updated_at = excluded.updated_at",
        )
        .bind(file_id)
        .bind(destination_id)
        .bind(remote_path)
        .bind(size)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Records one failed transfer attempt and returns the new retry count.
    /// The record stays Pending; terminal classification is the retry
    /// scheduler's call.
    pub async fn mark_attempt_failed(
        &self,
        file_id: &str,
        destination_id: &str,
        error: &str,
        now: i64,
    ) -> Result<i64, StateError> {
        sqlx::query(
            "INSERT INTO file_destinations
                (file_id, destination_id, status, last_attempt_at, last_error, retry_count, created_at, updated_at)
             VALUES (?1, ?2, 'pending', ?3, ?4, 1, ?3, ?3)
             ON CONFLICT(file_id, destination_id) DO UPDATE SET
                status = 'pending',
                last_attempt_at = excluded.last_attempt_at,
                last_error = excluded.last_error,
                retry_count = file_destinations.retry_count + 1,
                updated_at = excluded.updated_at",
        )
        .bind(file_id)
        .bind(destination_id)
        .bind(now)
        .bind(error)
        .execute(&self.pool)
        .await?;

        let record = self
            .get_record(file_id, destination_id)
            .await?
            .ok_or_else(|| {
                StateError::MissingRecord(file_id.to_string(), destination_id.to_string())
            })?;
        Ok(record.retry_count)
    }

    pub async fn mark_failed_terminal(
        &self,
        file_id: &str,
        destination_id: &str,
        error: &str,
        now: i64,
    ) -> Result<(), StateError> {
        sqlx::query(
            "INSERT INTO file_destinations
                (file_id, destination_id, status, last_attempt_at, last_error, retry_count, created_at, updated_at)
             VALUES (?1, ?2, 'failed', ?3, ?4, 0, ?3, ?3)
             ON CONFLICT(file_id, destination_id) DO UPDATE SET
                status = 'failed',
                last_attempt_at = excluded.last_attempt_at,
                last_error = excluded.last_error,
                updated_at = excluded.updated_at",
        )
        .bind(file_id)
        .bind(destination_id)
        .bind(now)
        .bind(error)
        .execute(&self.pool)
        .await?;
        self.remove_retry(file_id, destination_id).await
    }

    /// Operator reset: clears a terminal Failed record back to Pending with
    /// attempt count zero.
    pub async fn reset_failed(
        &self,
        file_id: &str,
        destination_id: &str,
        now: i64,
    ) -> Result<bool, StateError> {
        let result = sqlx::query(
            "UPDATE file_destinations
             SET status = 'pending', retry_count = 0, last_error = NULL, updated_at = ?1
             WHERE file_id = ?2 AND destination_id = ?3 AND status = 'failed'",
        )
        .bind(now)
        .bind(file_id)
        .bind(destination_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn counts_by_destination(&self) -> Result<Vec<StatusCounts>, StateError> {
        let rows = sqlx::query(
            "SELECT destination_id,
                    SUM(CASE WHEN status = 'pending' THEN 1 ELSE 0 END) AS pending,
                    SUM(CASE WHEN status = 'synced' THEN 1 ELSE 0 END) AS synced,
                    SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END) AS failed
             FROM file_destinations GROUP BY destination_id ORDER BY destination_id ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(StatusCounts {
                destination_id: row.try_get("destination_id")?,
                pending: row.try_get("pending")?,
                synced: row.try_get("synced")?,
                failed: row.try_get("failed")?,
            });
        }
        Ok(out)
    }

    pub async fn list_failed(&self) -> Result<Vec<FileDestinationRecord>, StateError> {
        let rows = sqlx::query(
            "SELECT file_id, destination_id, status, remote_path, size, last_attempt_at, last_error, retry_count
             FROM file_destinations WHERE status = 'failed'
             ORDER BY file_id ASC, destination_id ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(record_from_row).collect()
    }

    // ---- retry queue ----

    pub async fn push_retry(
        &self,
        file_id: &str,
        destination_id: &str,
        attempt: i64,
        next_eligible_at: i64,
    ) -> Result<(), StateError> {
        sqlx::query(
            "INSERT INTO retry_queue (file_id, destination_id, attempt, next_eligible_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(file_id, destination_id) DO UPDATE SET
                attempt = excluded.attempt,
                next_eligible_at = excluded.next_eligible_at",
        )
        .bind(file_id)
        .bind(destination_id)
        .bind(attempt)
        .bind(next_eligible_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn due_retries(&self, now: i64, limit: i64) -> Result<Vec<RetryEntry>, StateError> {
        let rows = sqlx::query(
            "SELECT file_id, destination_id, attempt, next_eligible_at
             FROM retry_queue WHERE next_eligible_at <= ?1
             ORDER BY next_eligible_at ASC LIMIT ?2",
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(RetryEntry {
                file_id: row.try_get("file_id")?,
                destination_id: row.try_get("destination_id")?,
                attempt: row.try_get("attempt")?,
                next_eligible_at: row.try_get("next_eligible_at")?,
            });
        }
        Ok(out)
    }

    pub async fn remove_retry(&self, file_id: &str, destination_id: &str) -> Result<(), StateError> {
        sqlx::query("DELETE FROM retry_queue WHERE file_id = ?1 AND destination_id = ?2")
            .bind(file_id)
            .bind(destination_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn retry_queue_len(&self) -> Result<i64, StateError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM retry_queue")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }

    // ---- daemon state ----

    pub async fn set_daemon_state(&self, state: &str, now: i64) -> Result<(), StateError> {
        sqlx::query(
            "INSERT INTO daemon_state (id, state, updated_at) VALUES (1, ?1, ?2)
             ON CONFLICT(id) DO UPDATE SET state = excluded.state, updated_at = excluded.updated_at",
        )
        .bind(state)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_daemon_state(&self) -> Result<Option<String>, StateError> {
        let row = sqlx::query("SELECT state FROM daemon_state WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;
        Ok(match row {
            Some(row) => Some(row.try_get("state")?),
            None => None,
        })
    }
}

fn policy_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<FolderPolicy, StateError> {
    let destinations: String = row.try_get("destinations")?;
    let recursive: i64 = row.try_get("recursive")?;
    let enabled: i64 = row.try_get("enabled")?;
    Ok(FolderPolicy {
        folder_id: row.try_get("folder_id")?,
        folder_path: row.try_get("folder_path")?,
        destinations: serde_json::from_str(&destinations)?,
        recursive: recursive != 0,
        enabled: enabled != 0,
    })
}

fn record_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<FileDestinationRecord, StateError> {
    let status: String = row.try_get("status")?;
    Ok(FileDestinationRecord {
        file_id: row.try_get("file_id")?,
        destination_id: row.try_get("destination_id")?,
        status: SyncStatus::parse(&status)?,
        remote_path: row.try_get("remote_path")?,
        size: row.try_get("size")?,
        last_attempt_at: row.try_get("last_attempt_at")?,
        last_error: row.try_get("last_error")?,
        retry_count: row.try_get("retry_count")?,
    })
}

pub fn now_unix() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}

fn default_db_path() -> Result<PathBuf, StateError> {
    let mut path = dirs::data_dir().ok_or(StateError::MissingDataDir)?;
    path.push("driveback");
    path.push("state.db");
    Ok(path)
}

#[cfg(test)]
pub(crate) async fn memory_store() -> StateStore {
    use sqlx::sqlite::SqlitePoolOptions;
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    let store = StateStore::from_pool(pool);
    store.init().await.unwrap();
    store
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ensure_record_creates_pending_once() {
        let store = memory_store().await;
        store.ensure_record("f1", "b2-eu", 100).await.unwrap();
        store
            .mark_synced("f1", "b2-eu", "archive/f1", 2000, 200)
            .await
            .unwrap();
        // Second ensure does not clobber the synced record.
        store.ensure_record("f1", "b2-eu", 300).await.unwrap();

        let record = store.get_record("f1", "b2-eu").await.unwrap().unwrap();
        assert_eq!(record.status, SyncStatus::Synced);
        assert_eq!(record.size, Some(2000));
        assert_eq!(record.remote_path.as_deref(), Some("archive/f1"));
    }

    #[tokio::test]
    async fn failed_attempts_increment_retry_count() {
        let store = memory_store().await;
        store.ensure_record("f1", "s3-us", 100).await.unwrap();

        let first = store
            .mark_attempt_failed("f1", "s3-us", "connection reset", 110)
            .await
            .unwrap();
        let second = store
            .mark_attempt_failed("f1", "s3-us", "connection reset", 120)
            .await
            .unwrap();

        assert_eq!(first, 1);
        assert_eq!(second, 2);
        let record = store.get_record("f1", "s3-us").await.unwrap().unwrap();
        assert_eq!(record.status, SyncStatus::Pending);
        assert_eq!(record.last_error.as_deref(), Some("connection reset"));
    }

    #[tokio::test]
    async fn terminal_failed_clears_retry_entry_and_reset_restores_pending() {
        let store = memory_store().await;
        store.ensure_record("f1", "s3-us", 100).await.unwrap();
        store.push_retry("f1", "s3-us", 3, 500).await.unwrap();

        store
            .mark_failed_terminal("f1", "s3-us", "unauthorized", 130)
            .await
            .unwrap();
        assert_eq!(store.retry_queue_len().await.unwrap(), 0);

        let failed = store.list_failed().await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].last_error.as_deref(), Some("unauthorized"));

        assert!(store.reset_failed("f1", "s3-us", 140).await.unwrap());
        let record = store.get_record("f1", "s3-us").await.unwrap().unwrap();
        assert_eq!(record.status, SyncStatus::Pending);
        assert_eq!(record.retry_count, 0);
        assert!(record.last_error.is_none());

        // Reset only applies to terminal records.
        assert!(!store.reset_failed("f1", "s3-us", 150).await.unwrap());
    }

    #[tokio::test]
    async fn counts_are_grouped_by_destination() {
        let store = memory_store().await;
        store.mark_synced("f1", "s3-us", "a", 1, 100).await.unwrap();
        store.mark_synced("f2", "s3-us", "b", 2, 100).await.unwrap();
        store.ensure_record("f3", "s3-us", 100).await.unwrap();
        store
            .mark_failed_terminal("f1", "b2-eu", "boom", 100)
            .await
            .unwrap();

        let counts = store.counts_by_destination().await.unwrap();
        assert_eq!(counts.len(), 2);
        assert_eq!(counts[0].destination_id, "b2-eu");
        assert_eq!(counts[0].failed, 1);
        assert_eq!(counts[1].destination_id, "s3-us");
        assert_eq!(counts[1].synced, 2);
        assert_eq!(counts[1].pending, 1);
    }

    #[tokio::test]
    async fn due_retries_respect_eligibility_and_order() {
        let store = memory_store().await;
        store.push_retry("f1", "s3-us", 1, 300).await.unwrap();
        store.push_retry("f2", "s3-us", 1, 100).await.unwrap();
        store.push_retry("f3", "s3-us", 1, 900).await.unwrap();

        let due = store.due_retries(300, 10).await.unwrap();
        assert_eq!(due.len(), 2);
        assert_eq!(due[0].file_id, "f2");
        assert_eq!(due[1].file_id, "f1");

        store.remove_retry("f2", "s3-us").await.unwrap();
        assert_eq!(store.retry_queue_len().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn push_retry_overwrites_same_key() {
        let store = memory_store().await;
        store.push_retry("f1", "s3-us", 1, 100).await.unwrap();
        store.push_retry("f1", "s3-us", 2, 400).await.unwrap();

        let due = store.due_retries(1_000, 10).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].attempt, 2);
        assert_eq!(due[0].next_eligible_at, 400);
    }

    #[tokio::test]
    async fn policies_round_trip_and_toggle() {
        let store = memory_store().await;
        let policy = FolderPolicy {
            folder_id: "fold-1".into(),
            folder_path: "/Archive".into(),
            destinations: vec!["s3-us".into(), "b2-eu".into()],
            recursive: true,
            enabled: true,
        };
        store.upsert_policy(&policy, 100).await.unwrap();

        let fetched = store.get_policy("fold-1").await.unwrap().unwrap();
        assert_eq!(fetched, policy);

        store
            .set_policy_enabled("fold-1", false, 200)
            .await
            .unwrap();
        let fetched = store.get_policy("fold-1").await.unwrap().unwrap();
        assert!(!fetched.enabled);

        store.remove_policy("fold-1").await.unwrap();
        assert!(store.get_policy("fold-1").await.unwrap().is_none());
        assert!(store.list_policies().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn daemon_state_round_trips() {
        let store = memory_store().await;
        assert!(store.get_daemon_state().await.unwrap().is_none());
        store.set_daemon_state("running", 100).await.unwrap();
        store.set_daemon_state("paused", 200).await.unwrap();
        assert_eq!(
            store.get_daemon_state().await.unwrap().as_deref(),
            Some("paused")
        );
    }
}
