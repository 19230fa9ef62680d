//! Segment store repository.
//!
//! All mutations are single atomic statements. State changes go through
//! compare-and-set (`UPDATE … WHERE state IN (…) RETURNING`) so a concurrent
//! worker observing a stale record can never overwrite a newer transition,
//! and a crash can never leave a half-written transition behind.

use std::path::Path;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;

use camrelay_core::{NewSegment, SegmentRecord, SegmentState, StateCounts, StoreError};

/// Bump when the `segments` table changes shape.
const SCHEMA_VERSION: i64 = 1;

const RETURNING_COLUMNS: &str = "RETURNING id, camera_id, local_path, remote_key, size_bytes, \
     checksum, state, attempt_count, last_error, last_attempt_at, next_attempt_at, uploaded_at, \
     created_at, updated_at";

const SELECT_COLUMNS: &str = "SELECT id, camera_id, local_path, remote_key, size_bytes, \
     checksum, state, attempt_count, last_error, last_attempt_at, next_attempt_at, uploaded_at, \
     created_at, updated_at FROM segments";

#[derive(Clone)]
pub struct SegmentStore {
    pool: SqlitePool,
}

impl SegmentStore {
    /// Open (or create) the store at `db_path` and initialize the schema.
    pub async fn connect(db_path: &Path) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.init_schema().await?;
        tracing::info!(db_path = %db_path.display(), "Segment store initialized");
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        let version: i64 = sqlx::query_scalar("PRAGMA user_version")
            .fetch_one(&self.pool)
            .await?;

        if version > SCHEMA_VERSION {
            return Err(StoreError::Database(sqlx::Error::Configuration(
                format!(
                    "segment store schema version {} is newer than supported version {}",
                    version, SCHEMA_VERSION
                )
                .into(),
            )));
        }

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS segments (
                id TEXT PRIMARY KEY,
                camera_id TEXT NOT NULL,
                local_path TEXT NOT NULL,
                remote_key TEXT NOT NULL,
                size_bytes INTEGER NOT NULL DEFAULT 0,
                checksum TEXT NOT NULL,
                state TEXT NOT NULL DEFAULT 'created',
                attempt_count INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                last_attempt_at TEXT,
                next_attempt_at TEXT,
                uploaded_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // local_path must be unique among records whose file still exists.
        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_segments_local_path
             ON segments(local_path) WHERE state != 'cleaned'",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_segments_state ON segments(state)")
            .execute(&self.pool)
            .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_segments_created ON segments(created_at)")
            .execute(&self.pool)
            .await?;

        sqlx::query(&format!("PRAGMA user_version = {}", SCHEMA_VERSION))
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Insert a newly observed segment in state `created`.
    pub async fn register(&self, segment: NewSegment) -> Result<SegmentRecord, StoreError> {
        let now = Utc::now();
        let sql = format!(
            "INSERT INTO segments (id, camera_id, local_path, remote_key, size_bytes, checksum,
                                   state, attempt_count, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'created', 0, ?7, ?8)
             {RETURNING_COLUMNS}"
        );
        let record = sqlx::query_as::<_, SegmentRecord>(&sql)
            .bind(&segment.id)
            .bind(&segment.camera_id)
            .bind(&segment.local_path)
            .bind(&segment.remote_key)
            .bind(segment.size_bytes)
            .bind(&segment.checksum)
            .bind(segment.created_at)
            .bind(now)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                if e.as_database_error()
                    .is_some_and(|db| db.is_unique_violation())
                {
                    StoreError::DuplicateSegment {
                        id: segment.id.clone(),
                    }
                } else {
                    StoreError::Database(e)
                }
            })?;

        tracing::debug!(
            segment_id = %record.id,
            local_path = %record.local_path,
            size_bytes = record.size_bytes,
            "Segment registered"
        );
        Ok(record)
    }

    /// Atomic compare-and-set transition. Fails with `InvalidTransition` if the
    /// current state is not in `from_states`, `RecordNotFound` if absent.
    pub async fn transition(
        &self,
        id: &str,
        from_states: &[SegmentState],
        to: SegmentState,
    ) -> Result<SegmentRecord, StoreError> {
        debug_assert!(from_states.iter().all(|from| from.can_transition_to(to)));

        let placeholders = from_states
            .iter()
            .map(|s| format!("'{}'", s))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "UPDATE segments SET state = ?1, updated_at = ?2
             WHERE id = ?3 AND state IN ({placeholders})
             {RETURNING_COLUMNS}"
        );

        let updated = sqlx::query_as::<_, SegmentRecord>(&sql)
            .bind(to.to_string())
            .bind(Utc::now())
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match updated {
            Some(record) => Ok(record),
            None => Err(self.transition_failure(id, to).await?),
        }
    }

    /// Atomically claim up to `limit` segments ready for delivery: `created`
    /// or `retry_queued` rows whose `next_attempt_at` has elapsed are flipped
    /// to `uploading` in one statement, so no two callers ever receive the
    /// same segment.
    pub async fn claim_next_for_delivery(
        &self,
        limit: i64,
    ) -> Result<Vec<SegmentRecord>, StoreError> {
        let sql = format!(
            "UPDATE segments
             SET state = 'uploading', attempt_count = attempt_count + 1,
                 last_attempt_at = ?1, updated_at = ?1
             WHERE id IN (
                 SELECT id FROM segments
                 WHERE state IN ('created', 'retry_queued')
                   AND (next_attempt_at IS NULL OR next_attempt_at <= ?1)
                 ORDER BY created_at ASC
                 LIMIT ?2
             )
             {RETURNING_COLUMNS}"
        );
        let claimed = sqlx::query_as::<_, SegmentRecord>(&sql)
            .bind(Utc::now())
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(claimed)
    }

    /// Confirm delivery: `uploading -> uploaded`, clearing any stale error.
    pub async fn mark_uploaded(&self, id: &str) -> Result<SegmentRecord, StoreError> {
        let sql = format!(
            "UPDATE segments
             SET state = 'uploaded', uploaded_at = ?1, updated_at = ?1,
                 last_error = NULL, next_attempt_at = NULL
             WHERE id = ?2 AND state = 'uploading'
             {RETURNING_COLUMNS}"
        );
        let updated = sqlx::query_as::<_, SegmentRecord>(&sql)
            .bind(Utc::now())
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match updated {
            Some(record) => Ok(record),
            None => Err(self.transition_failure(id, SegmentState::Uploaded).await?),
        }
    }

    /// Schedule a retry after a retryable delivery failure:
    /// `uploading -> retry_queued` with the backoff deadline.
    pub async fn schedule_retry(
        &self,
        id: &str,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<SegmentRecord, StoreError> {
        let sql = format!(
            "UPDATE segments
             SET state = 'retry_queued', last_error = ?1, next_attempt_at = ?2, updated_at = ?3
             WHERE id = ?4 AND state = 'uploading'
             {RETURNING_COLUMNS}"
        );
        let updated = sqlx::query_as::<_, SegmentRecord>(&sql)
            .bind(error)
            .bind(next_attempt_at)
            .bind(Utc::now())
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match updated {
            Some(record) => Ok(record),
            None => Err(self
                .transition_failure(id, SegmentState::RetryQueued)
                .await?),
        }
    }

    /// Terminal delivery failure, corrupt file or detected data loss.
    pub async fn mark_failed(&self, id: &str, error: &str) -> Result<SegmentRecord, StoreError> {
        let sql = format!(
            "UPDATE segments
             SET state = 'failed', last_error = ?1, next_attempt_at = NULL, updated_at = ?2
             WHERE id = ?3 AND state IN ('created', 'uploading', 'retry_queued')
             {RETURNING_COLUMNS}"
        );
        let updated = sqlx::query_as::<_, SegmentRecord>(&sql)
            .bind(error)
            .bind(Utc::now())
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match updated {
            Some(record) => Ok(record),
            None => Err(self.transition_failure(id, SegmentState::Failed).await?),
        }
    }

    /// Record that the local file has been deleted: `uploaded|failed -> cleaned`.
    pub async fn mark_cleaned(&self, id: &str) -> Result<SegmentRecord, StoreError> {
        self.transition(
            id,
            &[SegmentState::Uploaded, SegmentState::Failed],
            SegmentState::Cleaned,
        )
        .await
    }

    /// Revert a segment found `uploading` after an unclean shutdown back to
    /// the retry queue without burning an extra attempt: the claim already
    /// counted one, and the reconciler found no confirmation of completion.
    pub async fn requeue_interrupted(&self, id: &str) -> Result<SegmentRecord, StoreError> {
        let sql = format!(
            "UPDATE segments
             SET state = 'retry_queued', next_attempt_at = ?1, updated_at = ?1
             WHERE id = ?2 AND state = 'uploading'
             {RETURNING_COLUMNS}"
        );
        let updated = sqlx::query_as::<_, SegmentRecord>(&sql)
            .bind(Utc::now())
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match updated {
            Some(record) => Ok(record),
            None => Err(self
                .transition_failure(id, SegmentState::RetryQueued)
                .await?),
        }
    }

    /// Remove a record whose file is confirmed gone.
    pub async fn purge(&self, id: &str) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM segments WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::RecordNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Delete `cleaned` records older than `cutoff`. Returns the count removed.
    pub async fn purge_cleaned_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "DELETE FROM segments WHERE state = 'cleaned' AND updated_at < ?1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn get(&self, id: &str) -> Result<Option<SegmentRecord>, StoreError> {
        let sql = format!("{SELECT_COLUMNS} WHERE id = ?1");
        Ok(sqlx::query_as::<_, SegmentRecord>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    /// Look up the non-cleaned record tracking `local_path`, if any.
    pub async fn get_by_local_path(
        &self,
        local_path: &str,
    ) -> Result<Option<SegmentRecord>, StoreError> {
        let sql = format!("{SELECT_COLUMNS} WHERE local_path = ?1 AND state != 'cleaned'");
        Ok(sqlx::query_as::<_, SegmentRecord>(&sql)
            .bind(local_path)
            .fetch_optional(&self.pool)
            .await?)
    }

    /// Segments whose local file may be deleted, oldest first.
    pub async fn list_deletable(
        &self,
        include_failed: bool,
        limit: i64,
    ) -> Result<Vec<SegmentRecord>, StoreError> {
        let states = if include_failed {
            "('uploaded', 'failed')"
        } else {
            "('uploaded')"
        };
        let sql = format!(
            "{SELECT_COLUMNS} WHERE state IN {states} ORDER BY created_at ASC LIMIT ?1"
        );
        Ok(sqlx::query_as::<_, SegmentRecord>(&sql)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?)
    }

    /// Uploaded segments delivered before `cutoff`, for age-based eviction.
    pub async fn list_uploaded_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<SegmentRecord>, StoreError> {
        let sql = format!(
            "{SELECT_COLUMNS} WHERE state = 'uploaded' AND uploaded_at < ?1
             ORDER BY uploaded_at ASC"
        );
        Ok(sqlx::query_as::<_, SegmentRecord>(&sql)
            .bind(cutoff)
            .fetch_all(&self.pool)
            .await?)
    }

    /// All non-cleaned records, oldest first. The reconciler's view of what
    /// the store believes is on disk.
    pub async fn list_active(&self) -> Result<Vec<SegmentRecord>, StoreError> {
        let sql = format!("{SELECT_COLUMNS} WHERE state != 'cleaned' ORDER BY created_at ASC");
        Ok(sqlx::query_as::<_, SegmentRecord>(&sql)
            .fetch_all(&self.pool)
            .await?)
    }

    /// Segments currently buffered on disk in chronological order, for the
    /// rolling playback manifest.
    pub async fn list_buffered(&self) -> Result<Vec<SegmentRecord>, StoreError> {
        self.list_active().await
    }

    pub async fn counts_by_state(&self) -> Result<StateCounts, StoreError> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT state, COUNT(*) FROM segments GROUP BY state")
                .fetch_all(&self.pool)
                .await?;

        let mut counts = StateCounts::default();
        for (state, count) in rows {
            match state.as_str() {
                "created" => counts.created = count,
                "uploading" => counts.uploading = count,
                "uploaded" => counts.uploaded = count,
                "retry_queued" => counts.retry_queued = count,
                "failed" => counts.failed = count,
                "cleaned" => counts.cleaned = count,
                other => tracing::warn!(state = other, "Unknown state in segment store"),
            }
        }
        Ok(counts)
    }

    /// Creation time of the oldest segment still awaiting delivery.
    pub async fn oldest_pending_created_at(
        &self,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(sqlx::query_scalar(
            "SELECT MIN(created_at) FROM segments
             WHERE state IN ('created', 'uploading', 'retry_queued')",
        )
        .fetch_one(&self.pool)
        .await?)
    }

    /// Capture time of the most recently registered segment (liveness signal).
    pub async fn newest_created_at(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(
            sqlx::query_scalar("SELECT MAX(created_at) FROM segments")
                .fetch_one(&self.pool)
                .await?,
        )
    }

    /// Total bytes of non-cleaned segments on local disk.
    pub async fn total_buffer_bytes(&self) -> Result<i64, StoreError> {
        Ok(sqlx::query_scalar(
            "SELECT COALESCE(SUM(size_bytes), 0) FROM segments WHERE state != 'cleaned'",
        )
        .fetch_one(&self.pool)
        .await?)
    }

    /// Bytes held by segments that may NOT be deleted under the current
    /// retention policy. When this alone exceeds the buffer ceiling the
    /// system is in backpressure.
    pub async fn pending_bytes(&self, discard_failed: bool) -> Result<i64, StoreError> {
        let states = if discard_failed {
            "('created', 'uploading', 'retry_queued')"
        } else {
            "('created', 'uploading', 'retry_queued', 'failed')"
        };
        let sql = format!(
            "SELECT COALESCE(SUM(size_bytes), 0) FROM segments WHERE state IN {states}"
        );
        Ok(sqlx::query_scalar(&sql).fetch_one(&self.pool).await?)
    }

    /// Map a failed CAS to the precise error: the record is either missing or
    /// in a state the requested transition does not accept.
    async fn transition_failure(
        &self,
        id: &str,
        requested: SegmentState,
    ) -> Result<StoreError, StoreError> {
        match self.get(id).await? {
            Some(record) => Ok(StoreError::InvalidTransition {
                id: id.to_string(),
                found: record.state,
                requested,
            }),
            None => Ok(StoreError::RecordNotFound(id.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camrelay_core::models::segment::segment_id;
    use tempfile::TempDir;

    async fn open_store() -> (TempDir, SegmentStore) {
        let dir = TempDir::new().unwrap();
        let store = SegmentStore::connect(&dir.path().join("test.db"))
            .await
            .unwrap();
        (dir, store)
    }

    fn new_segment(seq: u32) -> NewSegment {
        let created_at = Utc::now() - chrono::Duration::seconds(100 - seq as i64);
        NewSegment {
            id: segment_id("cam1", created_at, seq),
            camera_id: "cam1".to_string(),
            local_path: format!("/tmp/segments/segment_{seq:04}.ts"),
            remote_key: format!("cameras/cam1/2026/08/25/10/segment_{seq:04}.ts"),
            size_bytes: 1024,
            checksum: format!("{seq:064x}"),
            created_at,
        }
    }

    #[tokio::test]
    async fn register_and_get() {
        let (_dir, store) = open_store().await;
        let record = store.register(new_segment(1)).await.unwrap();
        assert_eq!(record.state, SegmentState::Created);
        assert_eq!(record.attempt_count, 0);

        let fetched = store.get(&record.id).await.unwrap().unwrap();
        assert_eq!(fetched.remote_key, record.remote_key);

        let by_path = store
            .get_by_local_path(&record.local_path)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_path.id, record.id);
    }

    #[tokio::test]
    async fn register_duplicate_id_rejected() {
        let (_dir, store) = open_store().await;
        store.register(new_segment(1)).await.unwrap();
        let err = store.register(new_segment(1)).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateSegment { .. }));
    }

    #[tokio::test]
    async fn register_duplicate_path_rejected() {
        let (_dir, store) = open_store().await;
        store.register(new_segment(1)).await.unwrap();
        let mut other = new_segment(2);
        other.local_path = new_segment(1).local_path;
        let err = store.register(other).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateSegment { .. }));
    }

    #[tokio::test]
    async fn claim_flips_to_uploading_and_counts_attempt() {
        let (_dir, store) = open_store().await;
        let record = store.register(new_segment(1)).await.unwrap();

        let claimed = store.claim_next_for_delivery(10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, record.id);
        assert_eq!(claimed[0].state, SegmentState::Uploading);
        assert_eq!(claimed[0].attempt_count, 1);
        assert!(claimed[0].last_attempt_at.is_some());

        // Nothing left to claim.
        assert!(store.claim_next_for_delivery(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn concurrent_claims_never_share_a_segment() {
        let (_dir, store) = open_store().await;
        for seq in 0..8 {
            store.register(new_segment(seq)).await.unwrap();
        }

        let (a, b) = tokio::join!(
            store.claim_next_for_delivery(5),
            store.claim_next_for_delivery(5)
        );
        let a = a.unwrap();
        let b = b.unwrap();

        assert_eq!(a.len() + b.len(), 8);
        for claimed in &a {
            assert!(b.iter().all(|other| other.id != claimed.id));
        }
    }

    #[tokio::test]
    async fn claim_respects_retry_deadline() {
        let (_dir, store) = open_store().await;
        let record = store.register(new_segment(1)).await.unwrap();
        store.claim_next_for_delivery(1).await.unwrap();
        store
            .schedule_retry(
                &record.id,
                "connect timeout",
                Utc::now() + chrono::Duration::minutes(5),
            )
            .await
            .unwrap();

        // Deadline not yet elapsed.
        assert!(store.claim_next_for_delivery(1).await.unwrap().is_empty());

        store
            .schedule_retry_for_test(&record.id, Utc::now() - chrono::Duration::seconds(1))
            .await;
        let claimed = store.claim_next_for_delivery(1).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].attempt_count, 2);
    }

    #[tokio::test]
    async fn claims_are_oldest_first() {
        let (_dir, store) = open_store().await;
        for seq in [3, 1, 2] {
            store.register(new_segment(seq)).await.unwrap();
        }
        let claimed = store.claim_next_for_delivery(2).await.unwrap();
        let seqs: Vec<&str> = claimed.iter().map(|r| r.id.rsplit('-').next().unwrap()).collect();
        assert_eq!(seqs, ["0001", "0002"]);
    }

    #[tokio::test]
    async fn mark_uploaded_requires_uploading_state() {
        let (_dir, store) = open_store().await;
        let record = store.register(new_segment(1)).await.unwrap();

        let err = store.mark_uploaded(&record.id).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::InvalidTransition {
                found: SegmentState::Created,
                ..
            }
        ));

        store.claim_next_for_delivery(1).await.unwrap();
        let uploaded = store.mark_uploaded(&record.id).await.unwrap();
        assert_eq!(uploaded.state, SegmentState::Uploaded);
        assert!(uploaded.uploaded_at.is_some());
        assert!(uploaded.last_error.is_none());
    }

    #[tokio::test]
    async fn transition_missing_record_reports_not_found() {
        let (_dir, store) = open_store().await;
        let err = store.mark_uploaded("nope").await.unwrap_err();
        assert!(matches!(err, StoreError::RecordNotFound(_)));
    }

    #[tokio::test]
    async fn requeue_interrupted_keeps_attempt_count() {
        let (_dir, store) = open_store().await;
        let record = store.register(new_segment(1)).await.unwrap();
        store.claim_next_for_delivery(1).await.unwrap();

        let requeued = store.requeue_interrupted(&record.id).await.unwrap();
        assert_eq!(requeued.state, SegmentState::RetryQueued);
        assert_eq!(requeued.attempt_count, 1);
        assert!(requeued.next_attempt_at.is_some());
    }

    #[tokio::test]
    async fn list_deletable_honors_policy_and_order() {
        let (_dir, store) = open_store().await;
        let first = store.register(new_segment(1)).await.unwrap();
        let second = store.register(new_segment(2)).await.unwrap();
        let third = store.register(new_segment(3)).await.unwrap();

        store.claim_next_for_delivery(3).await.unwrap();
        store.mark_uploaded(&second.id).await.unwrap();
        store.mark_uploaded(&first.id).await.unwrap();
        store.mark_failed(&third.id, "access denied").await.unwrap();

        let without_failed = store.list_deletable(false, 100).await.unwrap();
        assert_eq!(without_failed.len(), 2);
        assert_eq!(without_failed[0].id, first.id);
        assert_eq!(without_failed[1].id, second.id);

        let with_failed = store.list_deletable(true, 100).await.unwrap();
        assert_eq!(with_failed.len(), 3);
    }

    #[tokio::test]
    async fn purge_requires_existing_record() {
        let (_dir, store) = open_store().await;
        let record = store.register(new_segment(1)).await.unwrap();
        store.claim_next_for_delivery(1).await.unwrap();
        store.mark_uploaded(&record.id).await.unwrap();
        store.mark_cleaned(&record.id).await.unwrap();

        store.purge(&record.id).await.unwrap();
        let err = store.purge(&record.id).await.unwrap_err();
        assert!(matches!(err, StoreError::RecordNotFound(_)));
    }

    #[tokio::test]
    async fn cleaned_path_reusable_after_cleanup() {
        // The partial unique index frees the path once the record is cleaned,
        // so a future capture cycle can reuse a filename.
        let (_dir, store) = open_store().await;
        let record = store.register(new_segment(1)).await.unwrap();
        store.claim_next_for_delivery(1).await.unwrap();
        store.mark_uploaded(&record.id).await.unwrap();
        store.mark_cleaned(&record.id).await.unwrap();

        let mut reused = new_segment(9);
        reused.local_path = record.local_path.clone();
        assert!(store.register(reused).await.is_ok());
    }

    #[tokio::test]
    async fn counts_and_sizes() {
        let (_dir, store) = open_store().await;
        let first = store.register(new_segment(1)).await.unwrap();
        store.register(new_segment(2)).await.unwrap();
        store.claim_next_for_delivery(1).await.unwrap();
        store.mark_uploaded(&first.id).await.unwrap();

        let counts = store.counts_by_state().await.unwrap();
        assert_eq!(counts.created, 1);
        assert_eq!(counts.uploaded, 1);
        assert_eq!(counts.pending(), 1);

        assert_eq!(store.total_buffer_bytes().await.unwrap(), 2048);
        assert_eq!(store.pending_bytes(true).await.unwrap(), 1024);

        assert!(store.oldest_pending_created_at().await.unwrap().is_some());
        assert!(store.newest_created_at().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn purge_cleaned_before_cutoff() {
        let (_dir, store) = open_store().await;
        let record = store.register(new_segment(1)).await.unwrap();
        store.claim_next_for_delivery(1).await.unwrap();
        store.mark_uploaded(&record.id).await.unwrap();
        store.mark_cleaned(&record.id).await.unwrap();

        let purged = store
            .purge_cleaned_before(Utc::now() - chrono::Duration::days(1))
            .await
            .unwrap();
        assert_eq!(purged, 0);

        let purged = store
            .purge_cleaned_before(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(purged, 1);
    }

    impl SegmentStore {
        /// Test helper: move a retry deadline without going through a worker.
        async fn schedule_retry_for_test(&self, id: &str, next_attempt_at: DateTime<Utc>) {
            sqlx::query("UPDATE segments SET next_attempt_at = ?1 WHERE id = ?2")
                .bind(next_attempt_at)
                .bind(id)
                .execute(&self.pool)
                .await
                .unwrap();
        }
    }
}
