//! Outbox Core -- data model, partition hashing, and rebalance math for the
//! transactional outbox pattern.
//!
//! This crate provides the pure foundation layer consumed by the `outbox`
//! crate:
//!
//! - **Hash** ([`hash`]): MurmurHash3 partition routing over the fixed 256-way ring
//! - **Distribution** ([`distribution`]): lexicographic fair-share target partition count
//! - **Model** ([`model`]): `OutboxRecord`, `OutboxInstance`, `PartitionAssignment`
//! - **Context** ([`context`]): `PartitionContext`, the immutable per-cycle rebalance snapshot
//! - **Retry** ([`retry`]): `RetryPolicy` and its built-in implementations
//! - **Traits** ([`traits`]): `RecordStore`, `InstanceRegistry`, `AssignmentStore`, `RecordHandler`, `PayloadSerializer`
//! - **Error** ([`error`]): the shared `OutboxError` taxonomy
//!
//! Nothing in this crate performs I/O or depends on a runtime; `outbox`
//! supplies the Postgres-backed implementations of the traits defined here.

pub mod context;
pub mod distribution;
pub mod error;
pub mod hash;
pub mod model;
pub mod retry;
pub mod traits;

pub use context::PartitionContext;
pub use distribution::target_count;
pub use error::{OutboxError, Result};
pub use hash::{partition_of, PARTITION_COUNT};
pub use model::{
    InstanceStatus, OutboxInstance, OutboxRecord, PartitionAssignment, RecordMetadata, RecordStatus,
};
pub use retry::{ExponentialBackoffRetryPolicy, FixedRetryPolicy, JitteredRetryPolicy, RetryPolicy};
pub use traits::{AssignmentStore, InstanceRegistry, PayloadSerializer, RecordHandler, RecordStore};
