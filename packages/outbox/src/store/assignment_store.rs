//! Postgres-backed [`AssignmentStore`], the system's only concurrency
//! primitive.
//!
//! `save_all` wraps every assignment in one transaction: an update
//! conditioned on the caller's `version` mismatching zero rows is the
//! signal for [`OutboxError::OptimisticConflict`], and an insert
//! conditioned on absence conflicting on the primary key is
//! [`OutboxError::Integrity`]. Either way the whole batch rolls back --
//! a rebalance cycle never applies half its planned moves.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use outbox_core::{AssignmentStore, OutboxError, PartitionAssignment};
use sqlx::{FromRow, PgPool};

pub struct PgAssignmentStore {
    pool: PgPool,
}

impl PgAssignmentStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(FromRow)]
struct AssignmentRow {
    partition_number: i32,
    instance_id: Option<String>,
    version: i64,
    updated_at: DateTime<Utc>,
}

impl TryFrom<AssignmentRow> for PartitionAssignment {
    type Error = OutboxError;

    fn try_from(row: AssignmentRow) -> Result<Self, Self::Error> {
        Ok(PartitionAssignment {
            partition_number: u32::try_from(row.partition_number).map_err(|e| OutboxError::Integrity(e.to_string()))?,
            instance_id: row.instance_id,
            version: row.version,
            updated_at: row.updated_at,
        })
    }
}

fn map_sqlx_err(e: sqlx::Error) -> OutboxError {
    OutboxError::TransientStorage(e.to_string())
}

#[async_trait]
impl AssignmentStore for PgAssignmentStore {
    async fn find_all(&self) -> outbox_core::Result<Vec<PartitionAssignment>> {
        let rows: Vec<AssignmentRow> = sqlx::query_as(
            "SELECT partition_number, instance_id, version, updated_at FROM outbox_partition",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        rows.into_iter().map(PartitionAssignment::try_from).collect()
    }

    async fn find_by_instance_id(&self, instance_id: &str) -> outbox_core::Result<Vec<PartitionAssignment>> {
        let rows: Vec<AssignmentRow> = sqlx::query_as(
            "SELECT partition_number, instance_id, version, updated_at FROM outbox_partition WHERE instance_id = $1",
        )
        .bind(instance_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        rows.into_iter().map(PartitionAssignment::try_from).collect()
    }

    async fn save_all(&self, assignments: &[PartitionAssignment]) -> outbox_core::Result<()> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_err)?;

        for assignment in assignments {
            let partition_number = i32::try_from(assignment.partition_number)
                .map_err(|e| OutboxError::Integrity(e.to_string()))?;

            if assignment.version == 0 {
                let result = sqlx::query(
                    r#"
                    INSERT INTO outbox_partition (partition_number, instance_id, version, updated_at)
                    VALUES ($1, $2, 1, $3)
                    ON CONFLICT (partition_number) DO UPDATE SET
                        instance_id = EXCLUDED.instance_id,
                        version = outbox_partition.version + 1,
                        updated_at = EXCLUDED.updated_at
                    WHERE outbox_partition.version = 0
                    "#,
                )
                .bind(partition_number)
                .bind(&assignment.instance_id)
                .bind(assignment.updated_at)
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx_err)?;

                if result.rows_affected() == 0 {
                    return Err(OutboxError::OptimisticConflict {
                        partition: assignment.partition_number,
                        expected: assignment.version,
                    });
                }
            } else {
                let result = sqlx::query(
                    r#"
                    UPDATE outbox_partition
                    SET instance_id = $1, version = version + 1, updated_at = $2
                    WHERE partition_number = $3 AND version = $4
                    "#,
                )
                .bind(&assignment.instance_id)
                .bind(assignment.updated_at)
                .bind(partition_number)
                .bind(assignment.version)
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx_err)?;

                if result.rows_affected() == 0 {
                    return Err(OutboxError::OptimisticConflict {
                        partition: assignment.partition_number,
                        expected: assignment.version,
                    });
                }
            }
        }

        tx.commit().await.map_err(map_sqlx_err)?;
        Ok(())
    }
}
