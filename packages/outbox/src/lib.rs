//! Outbox -- an embedded transactional outbox: at-least-once,
//! per-key-ordered event dispatch across a horizontally-scaled fleet.
//!
//! An embedding application constructs one [`Outbox`] per process,
//! registers [`outbox_core::RecordHandler`]s against the `handler_id`s it
//! writes records with, and calls [`Outbox::enqueue`] from inside the same
//! database transaction that persists the domain change the record
//! describes. From then on three background tasks run for the lifetime of
//! the `Outbox`: heartbeating ([`lifecycle::LifecycleManager`]), partition
//! rebalancing ([`coordinator::PartitionCoordinator`]), and record dispatch
//! ([`scheduler::ProcessingScheduler`]).

pub mod config;
pub mod coordinator;
pub mod handler;
pub mod lifecycle;
pub mod scheduler;
pub mod store;

pub use config::{InstanceConfig, OutboxConfig, ProcessingConfig, RetryPolicyConfig};
pub use coordinator::PartitionCoordinator;
pub use handler::{HandlerRegistry, JsonPayloadSerializer};
pub use lifecycle::{LifecycleManager, LifecycleState};
pub use outbox_core::{
    AssignmentStore, InstanceRegistry, OutboxError, OutboxInstance, OutboxRecord, PartitionAssignment,
    PayloadSerializer, RecordHandler, RecordMetadata, RecordStatus, RecordStore, RetryPolicy,
};
pub use scheduler::ProcessingScheduler;

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

/// The embedded outbox instance: owns the background tasks and is the
/// entry point for enqueuing records and registering handlers.
pub struct Outbox {
    lifecycle: Arc<LifecycleManager>,
    coordinator: Arc<PartitionCoordinator>,
    scheduler: Arc<ProcessingScheduler>,
    handlers: Arc<HandlerRegistry>,
    record_store: Arc<dyn RecordStore>,
    serializer: Arc<dyn PayloadSerializer>,
    graceful_shutdown_timeout: std::time::Duration,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Outbox {
    /// Registers this instance, validates `config`, and spawns its three
    /// background tasks. Handlers must still be registered via
    /// [`Outbox::handlers`] before any record whose `handler_id` they cover
    /// becomes ready -- an unregistered handler fails a record with
    /// [`OutboxError::Configuration`] rather than blocking the tick.
    pub async fn start(
        instance_id: impl Into<String>,
        hostname: impl Into<String>,
        port: u16,
        config: OutboxConfig,
        record_store: Arc<dyn RecordStore>,
        instance_registry: Arc<dyn InstanceRegistry>,
        assignment_store: Arc<dyn AssignmentStore>,
    ) -> Result<Arc<Self>, OutboxError> {
        config.validate()?;

        let lifecycle = Arc::new(LifecycleManager::start(instance_id, hostname, port, Arc::clone(&instance_registry)).await?);

        let tick_guard = Arc::new(Mutex::new(()));
        let coordinator = Arc::new(PartitionCoordinator::new(
            lifecycle.instance_id().to_string(),
            instance_registry,
            assignment_store,
            config.instance.stale_instance_timeout,
            Arc::clone(&tick_guard),
        ));

        let handlers = Arc::new(HandlerRegistry::new());
        let default_retry_policy: Arc<dyn RetryPolicy> = Arc::from(config.retry.build()?);
        let scheduler = Arc::new(ProcessingScheduler::new(
            Arc::clone(&record_store),
            Arc::clone(&handlers),
            Arc::clone(&coordinator),
            default_retry_policy,
            config.processing.batch_size,
            config.processing.stop_on_first_failure,
            tick_guard,
        ));

        let outbox = Arc::new(Self {
            lifecycle,
            coordinator,
            scheduler,
            handlers,
            record_store,
            serializer: Arc::new(JsonPayloadSerializer),
            graceful_shutdown_timeout: config.instance.graceful_shutdown_timeout,
            tasks: Mutex::new(Vec::new()),
        });
        outbox.spawn_background_tasks(&config).await;
        Ok(outbox)
    }

    async fn spawn_background_tasks(self: &Arc<Self>, config: &OutboxConfig) {
        let heartbeat = tokio::spawn({
            let lifecycle = Arc::clone(&self.lifecycle);
            let interval = config.instance.heartbeat_interval;
            async move { lifecycle.run_heartbeat(interval).await }
        });
        let rebalance = tokio::spawn({
            let coordinator = Arc::clone(&self.coordinator);
            let shutdown_rx = self.lifecycle.shutdown_receiver();
            let interval = config.instance.rebalance_interval;
            async move { coordinator.run(interval, shutdown_rx).await }
        });
        let processing = tokio::spawn({
            let scheduler = Arc::clone(&self.scheduler);
            let shutdown_rx = self.lifecycle.shutdown_receiver();
            let interval = config.poll_interval;
            async move { scheduler.run(interval, shutdown_rx).await }
        });
        self.tasks.lock().await.extend([heartbeat, rebalance, processing]);
    }

    /// The registry handlers are registered against; typically called once
    /// right after [`Outbox::start`], before any record becomes ready.
    #[must_use]
    pub fn handlers(&self) -> &Arc<HandlerRegistry> {
        &self.handlers
    }

    #[must_use]
    pub fn instance_id(&self) -> &str {
        self.lifecycle.instance_id()
    }

    #[must_use]
    pub fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    #[must_use]
    pub fn owned_partitions(&self) -> HashSet<u32> {
        (*self.coordinator.owned_partitions()).clone()
    }

    /// Serializes `value` and appends a new `NEW` record. Callers needing
    /// exactly-once-per-event semantics across a database transaction should
    /// write directly via [`OutboxRecord::new`] and their own `RecordStore`
    /// handle inside that transaction instead; this method is the
    /// convenience path for callers without a surrounding transaction to
    /// join.
    pub async fn enqueue(
        &self,
        key: impl Into<String>,
        record_type: impl Into<String>,
        value: &serde_json::Value,
        handler_id: impl Into<String>,
    ) -> Result<String, OutboxError> {
        let record_type = record_type.into();
        let payload = self.serializer.serialize(value)?;
        let id = Uuid::new_v4().to_string();
        let record = OutboxRecord::new(id.clone(), key, record_type, payload, handler_id, Utc::now());
        self.record_store.save(&record).await?;
        Ok(id)
    }

    /// Graceful shutdown: stop accepting new rebalance/processing ticks,
    /// release this instance's owned partitions so the fleet can pick them
    /// up immediately, wait up to `graceful_shutdown_timeout` for background
    /// tasks to observe the signal and exit, then mark the instance `DEAD`.
    pub async fn shutdown(&self) -> Result<(), OutboxError> {
        self.lifecycle.begin_shutdown().await?;

        let handles = std::mem::take(&mut *self.tasks.lock().await);
        let drain = async {
            for handle in handles {
                if let Err(e) = handle.await {
                    warn!(error = %e, "background task panicked during shutdown");
                }
            }
        };
        if tokio::time::timeout(self.graceful_shutdown_timeout, drain).await.is_err() {
            warn!(instance_id = %self.instance_id(), "graceful shutdown timed out waiting for background tasks");
        }

        if let Err(e) = self.coordinator.release_owned().await {
            warn!(instance_id = %self.instance_id(), error = %e, "failed to release owned partitions during shutdown");
        }

        self.lifecycle.finish_shutdown().await?;
        info!(instance_id = %self.instance_id(), "outbox shutdown complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;
    use chrono::DateTime;

    use super::*;

    #[derive(Default)]
    struct FakeRecordStore {
        records: StdMutex<HashMap<String, OutboxRecord>>,
    }

    #[async_trait]
    impl RecordStore for FakeRecordStore {
        async fn save(&self, record: &OutboxRecord) -> outbox_core::Result<()> {
            self.records.lock().unwrap().insert(record.id.clone(), record.clone());
            Ok(())
        }
        async fn find_pending(&self) -> outbox_core::Result<Vec<OutboxRecord>> {
            Ok(self.records.lock().unwrap().values().filter(|r| r.status == RecordStatus::New).cloned().collect())
        }
        async fn find_completed(&self) -> outbox_core::Result<Vec<OutboxRecord>> {
            Ok(self.records.lock().unwrap().values().filter(|r| r.status == RecordStatus::Completed).cloned().collect())
        }
        async fn find_failed(&self) -> outbox_core::Result<Vec<OutboxRecord>> {
            Ok(self.records.lock().unwrap().values().filter(|r| r.status == RecordStatus::Failed).cloned().collect())
        }
        async fn find_incomplete_records_by_key(&self, key: &str) -> outbox_core::Result<Vec<OutboxRecord>> {
            let mut out: Vec<OutboxRecord> =
                self.records.lock().unwrap().values().filter(|r| r.key == key && r.status == RecordStatus::New).cloned().collect();
            out.sort_by_key(|r| r.created_at);
            Ok(out)
        }
        async fn count_by_status(&self, status: RecordStatus) -> outbox_core::Result<u64> {
            Ok(self.records.lock().unwrap().values().filter(|r| r.status == status).count() as u64)
        }
        async fn count_by_partition_status(&self, partition: u32, status: RecordStatus) -> outbox_core::Result<u64> {
            Ok(self.records.lock().unwrap().values().filter(|r| r.partition == partition && r.status == status).count() as u64)
        }
        async fn delete_by_status(&self, _status: RecordStatus) -> outbox_core::Result<u64> {
            Ok(0)
        }
        async fn delete_by_key_and_status(&self, _key: &str, _status: RecordStatus) -> outbox_core::Result<u64> {
            Ok(0)
        }
        async fn delete_by_id(&self, id: &str) -> outbox_core::Result<bool> {
            Ok(self.records.lock().unwrap().remove(id).is_some())
        }
        async fn find_ready_record_keys(
            &self,
            _partitions: &[u32],
            _status: RecordStatus,
            _batch_size: u32,
            _ignore_previous_failure: bool,
            _now: DateTime<Utc>,
        ) -> outbox_core::Result<Vec<String>> {
            Ok(Vec::new())
        }
    }

    #[derive(Default)]
    struct FakeInstanceRegistry {
        instances: StdMutex<HashMap<String, OutboxInstance>>,
    }

    #[async_trait]
    impl InstanceRegistry for FakeInstanceRegistry {
        async fn save(&self, instance: &OutboxInstance) -> outbox_core::Result<()> {
            self.instances.lock().unwrap().insert(instance.instance_id.clone(), instance.clone());
            Ok(())
        }
        async fn find_by_id(&self, instance_id: &str) -> outbox_core::Result<Option<OutboxInstance>> {
            Ok(self.instances.lock().unwrap().get(instance_id).cloned())
        }
        async fn find_all(&self) -> outbox_core::Result<Vec<OutboxInstance>> {
            Ok(self.instances.lock().unwrap().values().cloned().collect())
        }
        async fn find_by_status(&self, status: outbox_core::InstanceStatus) -> outbox_core::Result<Vec<OutboxInstance>> {
            Ok(self.instances.lock().unwrap().values().filter(|i| i.status == status).cloned().collect())
        }
        async fn find_active(&self) -> outbox_core::Result<Vec<OutboxInstance>> {
            self.find_by_status(outbox_core::InstanceStatus::Active).await
        }
        async fn find_instances_with_stale_heartbeat(&self, cutoff: DateTime<Utc>) -> outbox_core::Result<Vec<OutboxInstance>> {
            Ok(self.instances.lock().unwrap().values().filter(|i| i.last_heartbeat < cutoff).cloned().collect())
        }
        async fn update_heartbeat(&self, instance_id: &str, now: DateTime<Utc>) -> outbox_core::Result<bool> {
            let mut guard = self.instances.lock().unwrap();
            if let Some(i) = guard.get_mut(instance_id) {
                i.last_heartbeat = now;
                Ok(true)
            } else {
                Ok(false)
            }
        }
        async fn update_status(&self, instance_id: &str, status: outbox_core::InstanceStatus, now: DateTime<Utc>) -> outbox_core::Result<bool> {
            let mut guard = self.instances.lock().unwrap();
            if let Some(i) = guard.get_mut(instance_id) {
                i.status = status;
                i.updated_at = now;
                Ok(true)
            } else {
                Ok(false)
            }
        }
        async fn count_by_status(&self, status: outbox_core::InstanceStatus) -> outbox_core::Result<u64> {
            Ok(self.instances.lock().unwrap().values().filter(|i| i.status == status).count() as u64)
        }
        async fn delete_by_id(&self, instance_id: &str) -> outbox_core::Result<bool> {
            Ok(self.instances.lock().unwrap().remove(instance_id).is_some())
        }
    }

    #[derive(Default)]
    struct FakeAssignmentStore {
        rows: StdMutex<HashMap<u32, PartitionAssignment>>,
    }

    #[async_trait]
    impl AssignmentStore for FakeAssignmentStore {
        async fn find_all(&self) -> outbox_core::Result<Vec<PartitionAssignment>> {
            Ok(self.rows.lock().unwrap().values().cloned().collect())
        }
        async fn find_by_instance_id(&self, instance_id: &str) -> outbox_core::Result<Vec<PartitionAssignment>> {
            Ok(self.rows.lock().unwrap().values().filter(|a| a.is_owned_by(instance_id)).cloned().collect())
        }
        async fn save_all(&self, assignments: &[PartitionAssignment]) -> outbox_core::Result<()> {
            let mut guard = self.rows.lock().unwrap();
            for a in assignments {
                if let Some(existing) = guard.get(&a.partition_number) {
                    if existing.version != a.version {
                        return Err(OutboxError::OptimisticConflict { partition: a.partition_number, expected: a.version });
                    }
                } else if a.version != 0 {
                    return Err(OutboxError::Integrity(format!("partition {} missing", a.partition_number)));
                }
                guard.insert(
                    a.partition_number,
                    PartitionAssignment {
                        partition_number: a.partition_number,
                        instance_id: a.instance_id.clone(),
                        version: a.version + 1,
                        updated_at: a.updated_at,
                    },
                );
            }
            Ok(())
        }
    }

    struct CountingHandler {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl RecordHandler for CountingHandler {
        async fn handle(&self, _payload: &[u8], _metadata: &RecordMetadata) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn start_registers_instance_and_enqueue_persists_a_record() {
        let record_store = Arc::new(FakeRecordStore::default());
        let instance_registry = Arc::new(FakeInstanceRegistry::default());
        let assignment_store = Arc::new(FakeAssignmentStore::default());

        let mut config = OutboxConfig::default();
        config.instance.heartbeat_interval = std::time::Duration::from_millis(10);
        config.instance.rebalance_interval = std::time::Duration::from_millis(10);
        config.poll_interval = std::time::Duration::from_millis(10);

        let outbox = Outbox::start(
            "i1",
            "localhost",
            9000,
            config,
            record_store.clone(),
            instance_registry.clone(),
            assignment_store,
        )
        .await
        .unwrap();

        assert_eq!(outbox.instance_id(), "i1");
        assert_eq!(outbox.state(), LifecycleState::Active);

        let calls = Arc::new(AtomicUsize::new(0));
        outbox.handlers().register("h1", Arc::new(CountingHandler { calls: Arc::clone(&calls) }));

        let id = outbox.enqueue("user-1", "OrderPlaced", &serde_json::json!({"n": 1}), "h1").await.unwrap();
        assert!(record_store.records.lock().unwrap().contains_key(&id));

        outbox.shutdown().await.unwrap();
        assert_eq!(outbox.state(), LifecycleState::Stopped);
        let stored = instance_registry.find_by_id("i1").await.unwrap().unwrap();
        assert_eq!(stored.status, outbox_core::InstanceStatus::Dead);
    }
}
