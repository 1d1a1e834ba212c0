//! Postgres-backed [`RecordStore`].
//!
//! Queries are issued with `sqlx::query`/`query_as` against string SQL
//! (not the `query!` compile-time macro), so the crate builds without a
//! live database connection at compile time.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use outbox_core::{OutboxError, OutboxRecord, RecordStatus, RecordStore};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use std::collections::HashMap;

pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(FromRow)]
struct RecordRow {
    id: String,
    key: String,
    partition: i32,
    record_type: String,
    payload: Vec<u8>,
    context: Option<Json<HashMap<String, String>>>,
    status: String,
    created_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    failure_count: i32,
    failure_reason: Option<String>,
    next_retry_at: DateTime<Utc>,
    handler_id: String,
}

impl TryFrom<RecordRow> for OutboxRecord {
    type Error = OutboxError;

    fn try_from(row: RecordRow) -> Result<Self, Self::Error> {
        Ok(OutboxRecord {
            id: row.id,
            key: row.key,
            partition: u32::try_from(row.partition).map_err(|e| OutboxError::Integrity(e.to_string()))?,
            record_type: row.record_type,
            payload: row.payload,
            context: row.context.map(|Json(c)| c),
            status: parse_status(&row.status)?,
            created_at: row.created_at,
            completed_at: row.completed_at,
            failure_count: u32::try_from(row.failure_count).unwrap_or(0),
            failure_reason: row.failure_reason,
            next_retry_at: row.next_retry_at,
            handler_id: row.handler_id,
        })
    }
}

fn status_str(status: RecordStatus) -> &'static str {
    match status {
        RecordStatus::New => "new",
        RecordStatus::Completed => "completed",
        RecordStatus::Failed => "failed",
    }
}

fn parse_status(s: &str) -> Result<RecordStatus, OutboxError> {
    match s {
        "new" => Ok(RecordStatus::New),
        "completed" => Ok(RecordStatus::Completed),
        "failed" => Ok(RecordStatus::Failed),
        other => Err(OutboxError::Integrity(format!("unknown record status {other:?}"))),
    }
}

fn map_sqlx_err(e: sqlx::Error) -> OutboxError {
    OutboxError::TransientStorage(e.to_string())
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn save(&self, record: &OutboxRecord) -> outbox_core::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO outbox_record
                (id, key, partition, record_type, payload, context, status, created_at, completed_at, failure_count, failure_reason, next_retry_at, handler_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (id) DO UPDATE SET
                status = EXCLUDED.status,
                completed_at = EXCLUDED.completed_at,
                failure_count = EXCLUDED.failure_count,
                failure_reason = EXCLUDED.failure_reason,
                next_retry_at = EXCLUDED.next_retry_at
            "#,
        )
        .bind(&record.id)
        .bind(&record.key)
        .bind(i32::try_from(record.partition).map_err(|e| OutboxError::Integrity(e.to_string()))?)
        .bind(&record.record_type)
        .bind(&record.payload)
        .bind(record.context.clone().map(Json))
        .bind(status_str(record.status))
        .bind(record.created_at)
        .bind(record.completed_at)
        .bind(i32::try_from(record.failure_count).unwrap_or(i32::MAX))
        .bind(&record.failure_reason)
        .bind(record.next_retry_at)
        .bind(&record.handler_id)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(())
    }

    async fn find_pending(&self) -> outbox_core::Result<Vec<OutboxRecord>> {
        self.find_by_status_query("new").await
    }

    async fn find_completed(&self) -> outbox_core::Result<Vec<OutboxRecord>> {
        self.find_by_status_query("completed").await
    }

    async fn find_failed(&self) -> outbox_core::Result<Vec<OutboxRecord>> {
        self.find_by_status_query("failed").await
    }

    async fn find_incomplete_records_by_key(&self, key: &str) -> outbox_core::Result<Vec<OutboxRecord>> {
        let rows: Vec<RecordRow> = sqlx::query_as(
            r#"
            SELECT id, key, partition, record_type, payload, context, status, created_at, completed_at, failure_count, failure_reason, next_retry_at, handler_id
            FROM outbox_record
            WHERE key = $1 AND status = 'new'
            ORDER BY created_at ASC
            "#,
        )
        .bind(key)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        rows.into_iter().map(OutboxRecord::try_from).collect()
    }

    async fn count_by_status(&self, status: RecordStatus) -> outbox_core::Result<u64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM outbox_record WHERE status = $1")
            .bind(status_str(status))
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    async fn count_by_partition_status(&self, partition: u32, status: RecordStatus) -> outbox_core::Result<u64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM outbox_record WHERE partition = $1 AND status = $2")
                .bind(i32::try_from(partition).map_err(|e| OutboxError::Integrity(e.to_string()))?)
                .bind(status_str(status))
                .fetch_one(&self.pool)
                .await
                .map_err(map_sqlx_err)?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    async fn delete_by_status(&self, status: RecordStatus) -> outbox_core::Result<u64> {
        let result = sqlx::query("DELETE FROM outbox_record WHERE status = $1")
            .bind(status_str(status))
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        Ok(result.rows_affected())
    }

    async fn delete_by_key_and_status(&self, key: &str, status: RecordStatus) -> outbox_core::Result<u64> {
        let result = sqlx::query("DELETE FROM outbox_record WHERE key = $1 AND status = $2")
            .bind(key)
            .bind(status_str(status))
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        Ok(result.rows_affected())
    }

    async fn delete_by_id(&self, id: &str) -> outbox_core::Result<bool> {
        let result = sqlx::query("DELETE FROM outbox_record WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn find_ready_record_keys(
        &self,
        partitions: &[u32],
        status: RecordStatus,
        batch_size: u32,
        ignore_previous_failure: bool,
        now: DateTime<Utc>,
    ) -> outbox_core::Result<Vec<String>> {
        let partitions: Vec<i32> =
            partitions.iter().map(|p| i32::try_from(*p)).collect::<Result<_, _>>().map_err(|e| OutboxError::Integrity(e.to_string()))?;

        let rows: Vec<(String, DateTime<Utc>)> = sqlx::query_as(
            r#"
            SELECT r.key, MIN(r.created_at) AS earliest
            FROM outbox_record r
            WHERE r.partition = ANY($1)
              AND r.status = $2
              AND r.next_retry_at <= $3
              AND ($4 = FALSE OR NOT EXISTS (
                    SELECT 1 FROM outbox_record blocker
                    WHERE blocker.key = r.key
                      AND blocker.created_at < r.created_at
                      AND blocker.completed_at IS NULL
                  ))
            GROUP BY r.key
            ORDER BY earliest ASC, r.key ASC
            LIMIT $5
            "#,
        )
        .bind(&partitions)
        .bind(status_str(status))
        .bind(now)
        .bind(ignore_previous_failure)
        .bind(i64::from(batch_size))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Ok(rows.into_iter().map(|(key, _earliest)| key).collect())
    }
}

impl PgRecordStore {
    async fn find_by_status_query(&self, status: &str) -> outbox_core::Result<Vec<OutboxRecord>> {
        let rows: Vec<RecordRow> = sqlx::query_as(
            r#"
            SELECT id, key, partition, record_type, payload, context, status, created_at, completed_at, failure_count, failure_reason, next_retry_at, handler_id
            FROM outbox_record
            WHERE status = $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(status)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        rows.into_iter().map(OutboxRecord::try_from).collect()
    }
}
