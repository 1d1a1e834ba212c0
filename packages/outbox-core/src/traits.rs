//! Storage and extension-point contracts.
//!
//! These traits are the seam between the pure algorithms in this crate and
//! the stateful `outbox` crate, which supplies Postgres-backed
//! implementations. Definitions live here, with no I/O or runtime
//! dependency beyond `async-trait`, so they can be implemented by hand-written
//! in-memory fakes in tests without pulling in `sqlx`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::model::{OutboxInstance, OutboxRecord, PartitionAssignment, RecordMetadata, RecordStatus};

/// Persists, queries, and deletes outbox records.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert or update a record by `id`. Idempotent: re-saving a record
    /// with identical fields is equivalent to saving it once.
    async fn save(&self, record: &OutboxRecord) -> Result<()>;

    async fn find_pending(&self) -> Result<Vec<OutboxRecord>>;
    async fn find_completed(&self) -> Result<Vec<OutboxRecord>>;
    async fn find_failed(&self) -> Result<Vec<OutboxRecord>>;

    /// All `NEW` records for `key`, oldest first.
    async fn find_incomplete_records_by_key(&self, key: &str) -> Result<Vec<OutboxRecord>>;

    async fn count_by_status(&self, status: RecordStatus) -> Result<u64>;
    async fn count_by_partition_status(&self, partition: u32, status: RecordStatus) -> Result<u64>;

    async fn delete_by_status(&self, status: RecordStatus) -> Result<u64>;
    async fn delete_by_key_and_status(&self, key: &str, status: RecordStatus) -> Result<u64>;
    async fn delete_by_id(&self, id: &str) -> Result<bool>;

    /// The scheduler's primary query: at most `batch_size` distinct keys
    /// whose partition is in `partitions`, whose status is `status`, and
    /// whose `next_retry_at <= now`.
    ///
    /// When `ignore_previous_failure` is `true`, a key is excluded if any
    /// strictly-earlier record (by `created_at`) with the same key has not
    /// completed (`completed_at IS NULL`) -- i.e. is still `NEW` or `FAILED`.
    /// Results are ordered by `MIN(created_at)` ascending, with ties broken
    /// by key ascending.
    async fn find_ready_record_keys(
        &self,
        partitions: &[u32],
        status: RecordStatus,
        batch_size: u32,
        ignore_previous_failure: bool,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>>;
}

/// Persists instance lifecycle state and heartbeats.
#[async_trait]
pub trait InstanceRegistry: Send + Sync {
    /// Upsert by `instance_id`.
    async fn save(&self, instance: &OutboxInstance) -> Result<()>;

    async fn find_by_id(&self, instance_id: &str) -> Result<Option<OutboxInstance>>;
    async fn find_all(&self) -> Result<Vec<OutboxInstance>>;
    async fn find_by_status(&self, status: crate::model::InstanceStatus) -> Result<Vec<OutboxInstance>>;
    async fn find_active(&self) -> Result<Vec<OutboxInstance>>;

    /// Instances whose `last_heartbeat` is strictly before `cutoff`.
    async fn find_instances_with_stale_heartbeat(&self, cutoff: DateTime<Utc>) -> Result<Vec<OutboxInstance>>;

    /// Idempotent. Returns `true` if a row was updated; `false` means the
    /// instance was deleted and the caller must re-register.
    async fn update_heartbeat(&self, instance_id: &str, now: DateTime<Utc>) -> Result<bool>;

    async fn update_status(
        &self,
        instance_id: &str,
        status: crate::model::InstanceStatus,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    async fn count_by_status(&self, status: crate::model::InstanceStatus) -> Result<u64>;
    async fn delete_by_id(&self, instance_id: &str) -> Result<bool>;
}

/// Persists partition ownership with optimistic versioning.
#[async_trait]
pub trait AssignmentStore: Send + Sync {
    async fn find_all(&self) -> Result<Vec<PartitionAssignment>>;
    async fn find_by_instance_id(&self, instance_id: &str) -> Result<Vec<PartitionAssignment>>;

    /// Applies every assignment in `assignments` in one logical transaction.
    ///
    /// For each entry: if a row with the same `partition_number` exists and
    /// its `version` matches, it's updated (`version` incremented by
    /// exactly one). A version mismatch raises
    /// [`crate::error::OutboxError::OptimisticConflict`] and the whole call
    /// rolls back. A missing row is inserted at `version == 0`; a
    /// primary-key race on insert raises
    /// [`crate::error::OutboxError::Integrity`] and the whole call rolls
    /// back. This is the system's only concurrency primitive -- no
    /// row-level locks, no leases.
    async fn save_all(&self, assignments: &[PartitionAssignment]) -> Result<()>;
}

/// User code dispatched per record; opaque to the scheduler beyond its
/// return value.
#[async_trait]
pub trait RecordHandler: Send + Sync {
    async fn handle(&self, payload: &[u8], metadata: &RecordMetadata) -> anyhow::Result<()>;
}

/// Pluggable payload (de)serialization; the scheduler never inspects
/// `payload` itself, only passes it through to the handler. `type_hint`
/// lets a single serializer multiplex formats keyed by `record_type`.
pub trait PayloadSerializer: Send + Sync {
    fn serialize(&self, value: &serde_json::Value) -> Result<Vec<u8>>;
    fn deserialize(&self, bytes: &[u8], type_hint: &str) -> Result<serde_json::Value>;
}
