//! Outbox domain types: records, instances, and partition assignments.
//!
//! These are the three tables an embedding application's database owns
//! (`outbox_record`, `outbox_instance`, `outbox_partition`). The types here
//! carry no storage-engine knowledge; [`crate::traits`] is the seam where an
//! application wires in a concrete backend.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a single outbox record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RecordStatus {
    /// Written by the caller's transaction, not yet dispatched.
    New,
    /// Handler invocation succeeded; `completed_at` is set.
    Completed,
    /// Retries exhausted or the error was non-retryable.
    Failed,
}

/// A single outbox entry: one domain event awaiting at-least-once dispatch.
///
/// `partition` is derived once at construction from [`crate::hash::partition_of`]
/// applied to `key` and never recomputed; callers that need a different
/// partition must create a new record with a different key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxRecord {
    pub id: String,
    pub key: String,
    pub partition: u32,
    pub record_type: String,
    pub payload: Vec<u8>,
    pub context: Option<HashMap<String, String>>,
    pub status: RecordStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failure_count: u32,
    pub failure_reason: Option<String>,
    pub next_retry_at: DateTime<Utc>,
    pub handler_id: String,
}

impl OutboxRecord {
    /// Builds a new `NEW` record for `key`, deriving its partition from the
    /// key's hash. `created_at` and `next_retry_at` both start at `now`
    /// (records are eligible for processing as soon as they are visible).
    pub fn new(
        id: impl Into<String>,
        key: impl Into<String>,
        record_type: impl Into<String>,
        payload: Vec<u8>,
        handler_id: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let key = key.into();
        let partition = crate::hash::partition_of(&key);
        Self {
            id: id.into(),
            key,
            partition,
            record_type: record_type.into(),
            payload,
            context: None,
            status: RecordStatus::New,
            created_at: now,
            completed_at: None,
            failure_count: 0,
            failure_reason: None,
            next_retry_at: now,
            handler_id: handler_id.into(),
        }
    }

    #[must_use]
    pub fn with_context(mut self, context: HashMap<String, String>) -> Self {
        self.context = Some(context);
        self
    }

    /// Marks the record completed. A no-op if already completed, so replaying
    /// a second successful handler invocation for the same record (at-least-once
    /// delivery) never advances `completed_at` twice.
    pub fn mark_completed(&mut self, now: DateTime<Utc>) {
        if self.status == RecordStatus::Completed {
            return;
        }
        self.status = RecordStatus::Completed;
        self.completed_at = Some(now);
    }

    /// Records a failed handler invocation: increments `failure_count` and
    /// either schedules a retry or marks the record permanently `FAILED`,
    /// depending on `retryable` and whether `failure_count` has reached
    /// `max_retries`.
    pub fn mark_failed(
        &mut self,
        reason: impl Into<String>,
        retryable: bool,
        max_retries: u32,
        next_delay: chrono::Duration,
        now: DateTime<Utc>,
    ) {
        self.failure_count += 1;
        self.failure_reason = Some(reason.into());
        if !retryable || self.failure_count >= max_retries {
            self.status = RecordStatus::Failed;
        } else {
            self.next_retry_at = now + next_delay;
        }
    }

    #[must_use]
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.status == RecordStatus::New && self.next_retry_at <= now
    }
}

/// Metadata handed to a [`crate::traits::RecordHandler`] alongside the raw
/// payload; never persisted, derived fresh from the record at dispatch time.
#[derive(Debug, Clone)]
pub struct RecordMetadata {
    pub key: String,
    pub handler_id: String,
    pub created_at: DateTime<Utc>,
    pub context: Option<HashMap<String, String>>,
}

impl From<&OutboxRecord> for RecordMetadata {
    fn from(record: &OutboxRecord) -> Self {
        Self {
            key: record.key.clone(),
            handler_id: record.handler_id.clone(),
            created_at: record.created_at,
            context: record.context.clone(),
        }
    }
}

/// Lifecycle state of a single application instance in the fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum InstanceStatus {
    Active,
    ShuttingDown,
    Dead,
}

/// A single fleet member, as persisted in `outbox_instance`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxInstance {
    pub instance_id: String,
    pub hostname: String,
    pub port: u16,
    pub status: InstanceStatus,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OutboxInstance {
    pub fn new(instance_id: impl Into<String>, hostname: impl Into<String>, port: u16, now: DateTime<Utc>) -> Self {
        Self {
            instance_id: instance_id.into(),
            hostname: hostname.into(),
            port,
            status: InstanceStatus::Active,
            started_at: now,
            last_heartbeat: now,
            created_at: now,
            updated_at: now,
        }
    }

    /// An instance is live iff it hasn't entered `DEAD` and its heartbeat is
    /// no older than `stale_timeout`.
    #[must_use]
    pub fn is_live(&self, now: DateTime<Utc>, stale_timeout: chrono::Duration) -> bool {
        matches!(self.status, InstanceStatus::Active | InstanceStatus::ShuttingDown)
            && self.last_heartbeat >= now - stale_timeout
    }
}

/// Ownership row for a single partition, as persisted in `outbox_partition`.
///
/// `version` is the sole concurrency primitive in the system: every update
/// must supply the version it read, and a mismatch means another instance
/// wrote the row first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionAssignment {
    pub partition_number: u32,
    pub instance_id: Option<String>,
    pub version: i64,
    pub updated_at: DateTime<Utc>,
}

impl PartitionAssignment {
    #[must_use]
    pub fn unassigned(partition_number: u32, now: DateTime<Utc>) -> Self {
        Self {
            partition_number,
            instance_id: None,
            version: 0,
            updated_at: now,
        }
    }

    #[must_use]
    pub fn is_owned_by(&self, instance_id: &str) -> bool {
        self.instance_id.as_deref() == Some(instance_id)
    }

    /// A partition is stale if its owner is absent from the live set,
    /// including the unassigned (`None`) case.
    #[must_use]
    pub fn is_stale(&self, live_ids: &[String]) -> bool {
        match &self.instance_id {
            None => true,
            Some(owner) => !live_ids.iter().any(|id| id == owner),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z").unwrap().with_timezone(&Utc)
    }

    #[test]
    fn new_record_starts_new_and_ready() {
        let t = now();
        let record = OutboxRecord::new("r1", "user-7", "OrderPlaced", b"p1".to_vec(), "h1", t);
        assert_eq!(record.status, RecordStatus::New);
        assert_eq!(record.created_at, t);
        assert_eq!(record.next_retry_at, t);
        assert!(record.is_ready(t));
        assert_eq!(record.partition, crate::hash::partition_of("user-7"));
    }

    #[test]
    fn mark_completed_is_idempotent() {
        let t = now();
        let mut record = OutboxRecord::new("r1", "user-7", "OrderPlaced", b"p1".to_vec(), "h1", t);
        record.mark_completed(t);
        let first_completed_at = record.completed_at;
        record.mark_completed(t + chrono::Duration::seconds(5));
        assert_eq!(record.completed_at, first_completed_at);
    }

    #[test]
    fn mark_failed_schedules_retry_under_max() {
        let t = now();
        let mut record = OutboxRecord::new("r1", "user-7", "OrderPlaced", b"p1".to_vec(), "h1", t);
        record.mark_failed("boom", true, 3, chrono::Duration::seconds(10), t);
        assert_eq!(record.status, RecordStatus::New);
        assert_eq!(record.failure_count, 1);
        assert_eq!(record.next_retry_at, t + chrono::Duration::seconds(10));
    }

    #[test]
    fn mark_failed_exhausts_to_failed_status() {
        let t = now();
        let mut record = OutboxRecord::new("r1", "user-7", "OrderPlaced", b"p1".to_vec(), "h1", t);
        record.mark_failed("boom", true, 1, chrono::Duration::seconds(10), t);
        assert_eq!(record.status, RecordStatus::Failed);
        assert_eq!(record.failure_count, 1);
    }

    #[test]
    fn mark_failed_non_retryable_fails_immediately() {
        let t = now();
        let mut record = OutboxRecord::new("r1", "user-7", "OrderPlaced", b"p1".to_vec(), "h1", t);
        record.mark_failed("boom", false, 5, chrono::Duration::seconds(10), t);
        assert_eq!(record.status, RecordStatus::Failed);
    }

    #[test]
    fn instance_liveness_depends_on_heartbeat_age() {
        let t = now();
        let mut instance = OutboxInstance::new("i1", "host", 8080, t);
        let timeout = chrono::Duration::seconds(30);
        assert!(instance.is_live(t, timeout));
        assert!(instance.is_live(t + chrono::Duration::seconds(29), timeout));
        assert!(!instance.is_live(t + chrono::Duration::seconds(31), timeout));

        instance.status = InstanceStatus::Dead;
        assert!(!instance.is_live(t, timeout));
    }

    #[test]
    fn assignment_staleness_includes_unassigned() {
        let t = now();
        let unassigned = PartitionAssignment::unassigned(0, t);
        assert!(unassigned.is_stale(&["a".into()]));

        let owned = PartitionAssignment {
            instance_id: Some("a".into()),
            ..unassigned.clone()
        };
        assert!(!owned.is_stale(&["a".into(), "b".into()]));
        assert!(owned.is_stale(&["b".into()]));
    }
}
