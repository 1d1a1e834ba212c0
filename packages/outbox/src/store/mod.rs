//! Postgres-backed implementations of the `outbox-core` storage traits.

#[cfg(feature = "postgres")]
mod assignment_store;
#[cfg(feature = "postgres")]
mod instance_registry;
#[cfg(feature = "postgres")]
mod record_store;

#[cfg(feature = "postgres")]
pub use assignment_store::PgAssignmentStore;
#[cfg(feature = "postgres")]
pub use instance_registry::PgInstanceRegistry;
#[cfg(feature = "postgres")]
pub use record_store::PgRecordStore;
