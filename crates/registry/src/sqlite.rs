//! SQLite-backed session registry.

use crate::error::{RegistryError, RegistryResult};
use crate::models::SessionRow;
use crate::{ChunkAck, RegistryStats, SessionRegistry, mutate};
use async_trait::async_trait;
use gantry_core::{Failure, FinalObject, SessionRecord, SessionStatus, UploadId};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use time::OffsetDateTime;

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS sessions (
    handle            BLOB PRIMARY KEY,
    file_name         TEXT NOT NULL,
    file_size         INTEGER NOT NULL,
    media_type        TEXT NOT NULL,
    total_chunks      INTEGER NOT NULL,
    chunk_size        INTEGER NOT NULL,
    received          BLOB NOT NULL,
    bytes_received    INTEGER NOT NULL,
    status            TEXT NOT NULL,
    created_at        TEXT NOT NULL,
    last_activity_at  TEXT NOT NULL,
    first_chunk_at    TEXT,
    completed_at      TEXT,
    failure_kind      TEXT,
    failure_message   TEXT,
    final_name        TEXT,
    final_size        INTEGER,
    final_assembled_at TEXT,
    final_path        TEXT
);
CREATE INDEX IF NOT EXISTS idx_sessions_status_activity
    ON sessions(status, last_activity_at);
CREATE INDEX IF NOT EXISTS idx_sessions_status_completed
    ON sessions(status, completed_at);
";

/// Durable registry persisted in a single SQLite database.
///
/// Every acknowledged mutation is committed before the call returns, so a
/// restart restores all acknowledged state. A single pooled connection plus
/// WAL journaling sidesteps SQLite writer contention under concurrent axum
/// handlers; the per-handle serialization above this layer keeps
/// read-modify-write sequences consistent.
pub struct SqliteRegistry {
    pool: Pool<Sqlite>,
}

impl SqliteRegistry {
    /// Open (creating if missing) the registry database at `path`.
    pub async fn new(path: impl AsRef<Path>) -> RegistryResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .map_err(|e| RegistryError::Internal(format!("create registry dir: {e}")))?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))
            .map_err(RegistryError::Database)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true)
            // Prevent transient "database is locked" errors under concurrent access.
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            // SQLite permits limited write concurrency; a single connection avoids
            // persistent "database is locked" failures under axum concurrency.
            .max_connections(1)
            .connect_with(opts)
            .await?;

        sqlx::query(SCHEMA_SQL).execute(&pool).await?;

        Ok(Self { pool })
    }

    async fn fetch(&self, handle: UploadId) -> RegistryResult<Option<SessionRecord>> {
        let row: Option<SessionRow> =
            sqlx::query_as("SELECT * FROM sessions WHERE handle = ?")
                .bind(handle.as_uuid())
                .fetch_optional(&self.pool)
                .await?;
        row.map(SessionRow::into_record).transpose()
    }

    async fn fetch_required(&self, handle: UploadId) -> RegistryResult<SessionRecord> {
        self.fetch(handle)
            .await?
            .ok_or_else(|| RegistryError::NotFound(handle.to_string()))
    }

    /// Write a full record back under its handle.
    async fn store(&self, record: &SessionRecord) -> RegistryResult<()> {
        let row = SessionRow::from_record(record);
        let result = sqlx::query(
            "UPDATE sessions SET
                received = ?, bytes_received = ?, status = ?,
                last_activity_at = ?, first_chunk_at = ?, completed_at = ?,
                failure_kind = ?, failure_message = ?,
                final_name = ?, final_size = ?, final_assembled_at = ?, final_path = ?
             WHERE handle = ?",
        )
        .bind(&row.received)
        .bind(row.bytes_received)
        .bind(&row.status)
        .bind(row.last_activity_at)
        .bind(row.first_chunk_at)
        .bind(row.completed_at)
        .bind(&row.failure_kind)
        .bind(&row.failure_message)
        .bind(&row.final_name)
        .bind(row.final_size)
        .bind(row.final_assembled_at)
        .bind(&row.final_path)
        .bind(row.handle)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RegistryError::NotFound(record.handle.to_string()));
        }
        Ok(())
    }

    async fn mutate_record<T>(
        &self,
        handle: UploadId,
        f: impl FnOnce(&mut SessionRecord) -> RegistryResult<T>,
    ) -> RegistryResult<(T, SessionRecord)> {
        let mut record = self.fetch_required(handle).await?;
        let value = f(&mut record)?;
        self.store(&record).await?;
        Ok((value, record))
    }
}

#[async_trait]
impl SessionRegistry for SqliteRegistry {
    async fn create(&self, record: &SessionRecord) -> RegistryResult<()> {
        let row = SessionRow::from_record(record);
        let result = sqlx::query(
            "INSERT OR IGNORE INTO sessions (
                handle, file_name, file_size, media_type, total_chunks, chunk_size,
                received, bytes_received, status,
                created_at, last_activity_at, first_chunk_at, completed_at,
                failure_kind, failure_message,
                final_name, final_size, final_assembled_at, final_path
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(row.handle)
        .bind(&row.file_name)
        .bind(row.file_size)
        .bind(&row.media_type)
        .bind(row.total_chunks)
        .bind(row.chunk_size)
        .bind(&row.received)
        .bind(row.bytes_received)
        .bind(&row.status)
        .bind(row.created_at)
        .bind(row.last_activity_at)
        .bind(row.first_chunk_at)
        .bind(row.completed_at)
        .bind(&row.failure_kind)
        .bind(&row.failure_message)
        .bind(&row.final_name)
        .bind(row.final_size)
        .bind(row.final_assembled_at)
        .bind(&row.final_path)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RegistryError::AlreadyExists(record.handle.to_string()));
        }
        Ok(())
    }

    async fn get(&self, handle: UploadId) -> RegistryResult<Option<SessionRecord>> {
        self.fetch(handle).await
    }

    async fn mark_chunk_received(
        &self,
        handle: UploadId,
        index: u32,
        len: u64,
        now: OffsetDateTime,
    ) -> RegistryResult<ChunkAck> {
        let (newly_recorded, record) = self
            .mutate_record(handle, |record| mutate::apply_chunk(record, index, len, now))
            .await?;
        Ok(ChunkAck {
            newly_recorded,
            record,
        })
    }

    async fn update_status(
        &self,
        handle: UploadId,
        status: SessionStatus,
        now: OffsetDateTime,
    ) -> RegistryResult<()> {
        self.mutate_record(handle, |record| mutate::apply_status(record, status, now))
            .await
            .map(|_| ())
    }

    async fn record_failure(
        &self,
        handle: UploadId,
        status: SessionStatus,
        failure: &Failure,
        now: OffsetDateTime,
    ) -> RegistryResult<()> {
        self.mutate_record(handle, |record| {
            mutate::apply_failure(record, status, failure, now)
        })
        .await
        .map(|_| ())
    }

    async fn set_final_object(
        &self,
        handle: UploadId,
        object: &FinalObject,
        now: OffsetDateTime,
    ) -> RegistryResult<()> {
        self.mutate_record(handle, |record| {
            mutate::apply_final_object(record, object, now)
        })
        .await
        .map(|_| ())
    }

    async fn touch(&self, handle: UploadId, now: OffsetDateTime) -> RegistryResult<()> {
        let result = sqlx::query("UPDATE sessions SET last_activity_at = ? WHERE handle = ?")
            .bind(now)
            .bind(handle.as_uuid())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(RegistryError::NotFound(handle.to_string()));
        }
        Ok(())
    }

    async fn scan_stale(
        &self,
        cutoff: OffsetDateTime,
        limit: u32,
    ) -> RegistryResult<Vec<SessionRecord>> {
        let rows: Vec<SessionRow> = sqlx::query_as(
            "SELECT * FROM sessions
             WHERE status IN ('initialized', 'receiving', 'assembling')
               AND last_activity_at < ?
             ORDER BY last_activity_at ASC
             LIMIT ?",
        )
        .bind(cutoff)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(SessionRow::into_record).collect()
    }

    async fn scan_expired_completed(
        &self,
        cutoff: OffsetDateTime,
        limit: u32,
    ) -> RegistryResult<Vec<SessionRecord>> {
        let rows: Vec<SessionRow> = sqlx::query_as(
            "SELECT * FROM sessions
             WHERE status = 'completed' AND completed_at < ? AND final_path IS NOT NULL
             ORDER BY completed_at ASC
             LIMIT ?",
        )
        .bind(cutoff)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(SessionRow::into_record).collect()
    }

    async fn clear_final_object(
        &self,
        handle: UploadId,
        now: OffsetDateTime,
    ) -> RegistryResult<()> {
        let result = sqlx::query(
            "UPDATE sessions SET
                final_name = NULL, final_size = NULL,
                final_assembled_at = NULL, final_path = NULL,
                last_activity_at = ?
             WHERE handle = ?",
        )
        .bind(now)
        .bind(handle.as_uuid())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(RegistryError::NotFound(handle.to_string()));
        }
        Ok(())
    }

    async fn delete(&self, handle: UploadId) -> RegistryResult<()> {
        let result = sqlx::query("DELETE FROM sessions WHERE handle = ?")
            .bind(handle.as_uuid())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(RegistryError::NotFound(handle.to_string()));
        }
        Ok(())
    }

    async fn stats(&self) -> RegistryResult<RegistryStats> {
        let (total, active, failed, completed, bytes): (i64, i64, i64, i64, i64) =
            sqlx::query_as(
                "SELECT
                    COUNT(*),
                    COALESCE(SUM(status IN ('initialized', 'receiving', 'assembling')), 0),
                    COALESCE(SUM(status = 'failed'), 0),
                    COALESCE(SUM(status = 'completed'), 0),
                    COALESCE(SUM(bytes_received), 0)
                 FROM sessions",
            )
            .fetch_one(&self.pool)
            .await?;

        // Derived speed is computed in Rust over a bounded sample of recent
        // completions; the timestamp encoding is opaque to SQL arithmetic.
        let recent: Vec<SessionRow> = sqlx::query_as(
            "SELECT * FROM sessions
             WHERE status = 'completed'
             ORDER BY completed_at DESC
             LIMIT 500",
        )
        .fetch_all(&self.pool)
        .await?;

        let speeds: Vec<f64> = recent
            .into_iter()
            .filter_map(|row| row.into_record().ok())
            .filter_map(|record| record.upload_speed())
            .collect();
        let average_speed_bps = if speeds.is_empty() {
            0.0
        } else {
            speeds.iter().sum::<f64>() / speeds.len() as f64
        };

        Ok(RegistryStats {
            total_sessions: total as u64,
            active_sessions: active as u64,
            failed_sessions: failed as u64,
            completed_sessions: completed as u64,
            total_bytes: bytes as u64,
            average_speed_bps,
        })
    }

    async fn health_check(&self) -> RegistryResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_core::Declared;

    fn sample_record(total_chunks: u32) -> SessionRecord {
        SessionRecord::new(
            Declared {
                file_name: "movie.mp4".to_string(),
                file_size: u64::from(total_chunks) * 1024,
                media_type: "video/mp4".to_string(),
                total_chunks,
            },
            1024,
            OffsetDateTime::now_utc(),
        )
    }

    async fn open() -> (tempfile::TempDir, SqliteRegistry) {
        let temp = tempfile::tempdir().unwrap();
        let registry = SqliteRegistry::new(temp.path().join("registry.db"))
            .await
            .unwrap();
        (temp, registry)
    }

    #[tokio::test]
    async fn create_and_get_roundtrip() {
        let (_temp, registry) = open().await;
        let record = sample_record(3);
        registry.create(&record).await.unwrap();

        let fetched = registry.get(record.handle).await.unwrap().unwrap();
        assert_eq!(fetched.declared, record.declared);
        assert_eq!(fetched.status, SessionStatus::Initialized);

        assert!(matches!(
            registry.create(&record).await,
            Err(RegistryError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn chunk_progress_persists_across_reopen() {
        let temp = tempfile::tempdir().unwrap();
        let db_path = temp.path().join("registry.db");
        let record = sample_record(3);
        let handle = record.handle;
        let now = OffsetDateTime::now_utc();

        {
            let registry = SqliteRegistry::new(&db_path).await.unwrap();
            registry.create(&record).await.unwrap();
            registry
                .mark_chunk_received(handle, 0, 1024, now)
                .await
                .unwrap();
            registry
                .mark_chunk_received(handle, 2, 1024, now)
                .await
                .unwrap();
        }

        // Reopen on the same file: acknowledged state must be restored.
        let registry = SqliteRegistry::new(&db_path).await.unwrap();
        let restored = registry.get(handle).await.unwrap().unwrap();
        assert_eq!(restored.status, SessionStatus::Receiving);
        assert_eq!(restored.received.indices(), vec![0, 2]);
        assert_eq!(restored.bytes_received, 2048);
        assert_eq!(restored.received.missing(), vec![1]);
    }

    #[tokio::test]
    async fn duplicate_chunk_is_idempotent() {
        let (_temp, registry) = open().await;
        let record = sample_record(2);
        registry.create(&record).await.unwrap();
        let now = OffsetDateTime::now_utc();

        let first = registry
            .mark_chunk_received(record.handle, 1, 1024, now)
            .await
            .unwrap();
        assert!(first.newly_recorded);

        let dup = registry
            .mark_chunk_received(record.handle, 1, 1024, now)
            .await
            .unwrap();
        assert!(!dup.newly_recorded);
        assert_eq!(dup.record.bytes_received, 1024);
    }

    #[tokio::test]
    async fn invalid_transitions_leave_row_unchanged() {
        let (_temp, registry) = open().await;
        let record = sample_record(1);
        registry.create(&record).await.unwrap();
        let now = OffsetDateTime::now_utc();

        let err = registry
            .update_status(record.handle, SessionStatus::Completed, now)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidTransition { .. }));

        let unchanged = registry.get(record.handle).await.unwrap().unwrap();
        assert_eq!(unchanged.status, SessionStatus::Initialized);
    }

    #[tokio::test]
    async fn failure_and_terminal_refusal() {
        let (_temp, registry) = open().await;
        let record = sample_record(1);
        registry.create(&record).await.unwrap();
        let now = OffsetDateTime::now_utc();

        registry
            .record_failure(
                record.handle,
                SessionStatus::Aborted,
                &Failure::new("aborted", "client cancelled"),
                now,
            )
            .await
            .unwrap();

        let fetched = registry.get(record.handle).await.unwrap().unwrap();
        assert_eq!(fetched.status, SessionStatus::Aborted);
        assert_eq!(fetched.failure.as_ref().unwrap().kind, "aborted");

        // Terminal sessions refuse further chunks.
        assert!(matches!(
            registry
                .mark_chunk_received(record.handle, 0, 1024, now)
                .await,
            Err(RegistryError::NotAccepting { .. })
        ));
    }

    #[tokio::test]
    async fn stale_scan_filters_by_activity_and_status() {
        let (_temp, registry) = open().await;
        let now = OffsetDateTime::now_utc();

        let mut stale = sample_record(1);
        stale.last_activity_at = now - time::Duration::minutes(90);
        stale.created_at = stale.last_activity_at;
        registry.create(&stale).await.unwrap();

        let fresh = sample_record(1);
        registry.create(&fresh).await.unwrap();

        let found = registry
            .scan_stale(now - time::Duration::minutes(30), 10)
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].handle, stale.handle);

        // Once aborted it drops out of the stale scan.
        registry
            .record_failure(
                stale.handle,
                SessionStatus::Aborted,
                &Failure::new("stale", "reaped"),
                now,
            )
            .await
            .unwrap();
        let found = registry
            .scan_stale(now - time::Duration::minutes(30), 10)
            .await
            .unwrap();
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn stats_counts_by_status() {
        let (_temp, registry) = open().await;
        let now = OffsetDateTime::now_utc();

        let active = sample_record(2);
        registry.create(&active).await.unwrap();
        registry
            .mark_chunk_received(active.handle, 0, 1024, now)
            .await
            .unwrap();

        let failed = sample_record(1);
        registry.create(&failed).await.unwrap();
        registry
            .record_failure(
                failed.handle,
                SessionStatus::Failed,
                &Failure::new("io_failure", "disk gone"),
                now,
            )
            .await
            .unwrap();

        let stats = registry.stats().await.unwrap();
        assert_eq!(stats.total_sessions, 2);
        assert_eq!(stats.active_sessions, 1);
        assert_eq!(stats.failed_sessions, 1);
        assert_eq!(stats.completed_sessions, 0);
        assert_eq!(stats.total_bytes, 1024);
    }
}
