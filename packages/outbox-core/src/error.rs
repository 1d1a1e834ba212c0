//! Error taxonomy shared by every storage trait and scheduling component.
//!
//! Variants mirror the failure kinds a caller actually needs to branch on;
//! everything else (task supervision glue, `JoinHandle` bookkeeping) stays
//! `anyhow` internally and is converted to the nearest variant here before
//! crossing back out of a public method.

/// Errors surfaced by the record store, instance registry, assignment store
/// and the components built on top of them.
#[derive(Debug, thiserror::Error)]
pub enum OutboxError {
    /// The backing store is unreachable, deadlocked, or hit a serialization
    /// failure. Coordinator and scheduler log this at debug and retry on the
    /// next tick; record processing treats it as a handler failure.
    #[error("transient storage error: {0}")]
    TransientStorage(String),

    /// An `AssignmentStore::save_all` update raced another instance's write
    /// to the same row. Expected during rebalance; never surfaced beyond a
    /// debug log.
    #[error("optimistic conflict on partition {partition}: expected version {expected}")]
    OptimisticConflict { partition: u32, expected: i64 },

    /// A primary-key conflict on bootstrap or insert. Treated as "another
    /// instance got there first".
    #[error("integrity violation: {0}")]
    Integrity(String),

    /// A user-provided handler returned or raised an error processing a
    /// record.
    #[error("handler {handler_id} failed for key {key}: {source}")]
    Handler {
        handler_id: String,
        key: String,
        #[source]
        source: anyhow::Error,
    },

    /// Invalid retry configuration, an unknown policy name, or a missing
    /// handler registration for a `handler_id`.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Handler execution was aborted by graceful shutdown. The record is
    /// left untouched and is picked up by whichever instance owns its
    /// partition after the next rebalance.
    #[error("handler execution canceled by shutdown")]
    ShutdownCanceled,
}

impl OutboxError {
    #[must_use]
    pub fn is_expected_race(&self) -> bool {
        matches!(self, Self::OptimisticConflict { .. } | Self::Integrity(_))
    }
}

pub type Result<T> = std::result::Result<T, OutboxError>;
