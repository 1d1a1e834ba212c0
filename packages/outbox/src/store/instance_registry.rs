//! Postgres-backed [`InstanceRegistry`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use outbox_core::{InstanceRegistry, InstanceStatus, OutboxError, OutboxInstance};
use sqlx::{FromRow, PgPool};

pub struct PgInstanceRegistry {
    pool: PgPool,
}

impl PgInstanceRegistry {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(FromRow)]
struct InstanceRow {
    instance_id: String,
    hostname: String,
    port: i32,
    status: String,
    started_at: DateTime<Utc>,
    last_heartbeat: DateTime<Utc>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<InstanceRow> for OutboxInstance {
    type Error = OutboxError;

    fn try_from(row: InstanceRow) -> Result<Self, Self::Error> {
        Ok(OutboxInstance {
            instance_id: row.instance_id,
            hostname: row.hostname,
            port: u16::try_from(row.port).map_err(|e| OutboxError::Integrity(e.to_string()))?,
            status: parse_status(&row.status)?,
            started_at: row.started_at,
            last_heartbeat: row.last_heartbeat,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn status_str(status: InstanceStatus) -> &'static str {
    match status {
        InstanceStatus::Active => "active",
        InstanceStatus::ShuttingDown => "shuttingDown",
        InstanceStatus::Dead => "dead",
    }
}

fn parse_status(s: &str) -> Result<InstanceStatus, OutboxError> {
    match s {
        "active" => Ok(InstanceStatus::Active),
        "shuttingDown" => Ok(InstanceStatus::ShuttingDown),
        "dead" => Ok(InstanceStatus::Dead),
        other => Err(OutboxError::Integrity(format!("unknown instance status {other:?}"))),
    }
}

fn map_sqlx_err(e: sqlx::Error) -> OutboxError {
    OutboxError::TransientStorage(e.to_string())
}

const SELECT_COLUMNS: &str =
    "instance_id, hostname, port, status, started_at, last_heartbeat, created_at, updated_at";

#[async_trait]
impl InstanceRegistry for PgInstanceRegistry {
    async fn save(&self, instance: &OutboxInstance) -> outbox_core::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO outbox_instance
                (instance_id, hostname, port, status, started_at, last_heartbeat, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (instance_id) DO UPDATE SET
                hostname = EXCLUDED.hostname,
                port = EXCLUDED.port,
                status = EXCLUDED.status,
                last_heartbeat = EXCLUDED.last_heartbeat,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&instance.instance_id)
        .bind(&instance.hostname)
        .bind(i32::from(instance.port))
        .bind(status_str(instance.status))
        .bind(instance.started_at)
        .bind(instance.last_heartbeat)
        .bind(instance.created_at)
        .bind(instance.updated_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(())
    }

    async fn find_by_id(&self, instance_id: &str) -> outbox_core::Result<Option<OutboxInstance>> {
        let row: Option<InstanceRow> =
            sqlx::query_as(&format!("SELECT {SELECT_COLUMNS} FROM outbox_instance WHERE instance_id = $1"))
                .bind(instance_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(map_sqlx_err)?;
        row.map(OutboxInstance::try_from).transpose()
    }

    async fn find_all(&self) -> outbox_core::Result<Vec<OutboxInstance>> {
        let rows: Vec<InstanceRow> = sqlx::query_as(&format!("SELECT {SELECT_COLUMNS} FROM outbox_instance"))
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        rows.into_iter().map(OutboxInstance::try_from).collect()
    }

    async fn find_by_status(&self, status: InstanceStatus) -> outbox_core::Result<Vec<OutboxInstance>> {
        let rows: Vec<InstanceRow> =
            sqlx::query_as(&format!("SELECT {SELECT_COLUMNS} FROM outbox_instance WHERE status = $1"))
                .bind(status_str(status))
                .fetch_all(&self.pool)
                .await
                .map_err(map_sqlx_err)?;
        rows.into_iter().map(OutboxInstance::try_from).collect()
    }

    async fn find_active(&self) -> outbox_core::Result<Vec<OutboxInstance>> {
        self.find_by_status(InstanceStatus::Active).await
    }

    async fn find_instances_with_stale_heartbeat(
        &self,
        cutoff: DateTime<Utc>,
    ) -> outbox_core::Result<Vec<OutboxInstance>> {
        let rows: Vec<InstanceRow> = sqlx::query_as(&format!(
            "SELECT {SELECT_COLUMNS} FROM outbox_instance WHERE last_heartbeat < $1"
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        rows.into_iter().map(OutboxInstance::try_from).collect()
    }

    async fn update_heartbeat(&self, instance_id: &str, now: DateTime<Utc>) -> outbox_core::Result<bool> {
        let result = sqlx::query(
            "UPDATE outbox_instance SET last_heartbeat = $1, updated_at = $1 WHERE instance_id = $2",
        )
        .bind(now)
        .bind(instance_id)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn update_status(
        &self,
        instance_id: &str,
        status: InstanceStatus,
        now: DateTime<Utc>,
    ) -> outbox_core::Result<bool> {
        let result = sqlx::query("UPDATE outbox_instance SET status = $1, updated_at = $2 WHERE instance_id = $3")
            .bind(status_str(status))
            .bind(now)
            .bind(instance_id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn count_by_status(&self, status: InstanceStatus) -> outbox_core::Result<u64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM outbox_instance WHERE status = $1")
            .bind(status_str(status))
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    async fn delete_by_id(&self, instance_id: &str) -> outbox_core::Result<bool> {
        let result = sqlx::query("DELETE FROM outbox_instance WHERE instance_id = $1")
            .bind(instance_id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        Ok(result.rows_affected() > 0)
    }
}
