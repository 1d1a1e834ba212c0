//! Decentralized partition rebalancing.
//!
//! Each instance runs its own rebalance cycle on a timer: read live
//! instances and the assignment table, compute [`outbox_core::PartitionContext`],
//! and write back the partitions it needs to claim or release through
//! [`outbox_core::AssignmentStore::save_all`]'s optimistic-version contract.
//! There is no leader and no lock; a lost race just means this instance's
//! view was stale and it retries the cycle.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use chrono::Utc;
use outbox_core::{
    AssignmentStore, InstanceRegistry, OutboxError, PartitionAssignment, PartitionContext,
};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, instrument, warn};

/// Periodically reconciles this instance's partition ownership against the
/// fleet's live membership.
pub struct PartitionCoordinator {
    self_id: String,
    instance_registry: Arc<dyn InstanceRegistry>,
    assignment_store: Arc<dyn AssignmentStore>,
    stale_instance_timeout: chrono::Duration,
    owned: ArcSwapOption<HashSet<u32>>,
    /// Shared with the processing scheduler so a rebalance cycle and a
    /// processing tick never run concurrently against the same owned set.
    tick_guard: Arc<Mutex<()>>,
}

impl PartitionCoordinator {
    #[must_use]
    pub fn new(
        self_id: impl Into<String>,
        instance_registry: Arc<dyn InstanceRegistry>,
        assignment_store: Arc<dyn AssignmentStore>,
        stale_instance_timeout: Duration,
        tick_guard: Arc<Mutex<()>>,
    ) -> Self {
        Self {
            self_id: self_id.into(),
            instance_registry,
            assignment_store,
            stale_instance_timeout: chrono::Duration::from_std(stale_instance_timeout)
                .unwrap_or(chrono::Duration::seconds(30)),
            owned: ArcSwapOption::empty(),
            tick_guard,
        }
    }

    /// Lock-free read of this instance's currently owned partitions, for the
    /// scheduler's hot path. Empty until the first rebalance cycle completes.
    #[must_use]
    pub fn owned_partitions(&self) -> Arc<HashSet<u32>> {
        self.owned.load_full().unwrap_or_default()
    }

    pub async fn run(&self, interval: Duration, mut shutdown_rx: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.changed() => {
                    debug!(instance_id = %self.self_id, "rebalance loop observed shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.rebalance_once().await {
                        if e.is_expected_race() {
                            debug!(instance_id = %self.self_id, error = %e, "rebalance cycle lost a race, retrying next tick");
                        } else {
                            warn!(instance_id = %self.self_id, error = %e, "rebalance cycle failed");
                        }
                    }
                }
            }
        }
    }

    #[instrument(skip(self), fields(instance_id = %self.self_id))]
    pub async fn rebalance_once(&self) -> Result<(), OutboxError> {
        let _guard = self.tick_guard.lock().await;
        let now = Utc::now();

        let instances = self.instance_registry.find_all().await?;
        let live_ids: Vec<String> =
            instances.iter().filter(|i| i.is_live(now, self.stale_instance_timeout)).map(|i| i.instance_id.clone()).collect();

        if live_ids.is_empty() {
            debug!(instance_id = %self.self_id, "no live instances observed, skipping rebalance cycle");
            return Ok(());
        }

        let mut assignments = self.assignment_store.find_all().await?;
        if assignments.is_empty() {
            // Claim the whole ring for ourselves up front, per spec step 3 --
            // not left `unassigned`, since a follow-up claim against these
            // same rows would use their pre-insert `version: 0` and collide
            // with the `version: 1` the store already moved them to.
            let bootstrap: Vec<PartitionAssignment> = (0..outbox_core::PARTITION_COUNT)
                .map(|n| PartitionAssignment { partition_number: n, instance_id: Some(self.self_id.clone()), version: 0, updated_at: now })
                .collect();
            // Best-effort bootstrap: if another instance races us here, the
            // insert conflict surfaces as Integrity and the next tick just
            // re-reads whatever landed.
            match self.assignment_store.save_all(&bootstrap).await {
                Ok(()) => {
                    info!(instance_id = %self.self_id, "bootstrapped partition table");
                    assignments = bootstrap.into_iter().map(|a| PartitionAssignment { version: a.version + 1, ..a }).collect();
                }
                Err(e) if e.is_expected_race() => {
                    assignments = self.assignment_store.find_all().await?;
                }
                Err(e) => return Err(e),
            }
        }

        let target = outbox_core::target_count(&self.self_id, &live_ids);
        let ctx = PartitionContext::new(self.self_id.clone(), live_ids, assignments, target);

        let mut to_save = Vec::new();
        for a in ctx.assignments_to_claim() {
            to_save.push(PartitionAssignment {
                partition_number: a.partition_number,
                instance_id: Some(self.self_id.clone()),
                version: a.version,
                updated_at: now,
            });
        }
        for a in ctx.assignments_to_release() {
            to_save.push(PartitionAssignment {
                partition_number: a.partition_number,
                instance_id: None,
                version: a.version,
                updated_at: now,
            });
        }

        if !to_save.is_empty() {
            self.assignment_store.save_all(&to_save).await?;
            info!(
                instance_id = %self.self_id,
                claimed = ctx.assignments_to_claim().len(),
                released = ctx.assignments_to_release().len(),
                "rebalance cycle applied"
            );
        }

        let mut owned: HashSet<u32> = ctx.owned_assignments().iter().map(|a| a.partition_number).collect();
        for a in &to_save {
            if a.instance_id.as_deref() == Some(self.self_id.as_str()) {
                owned.insert(a.partition_number);
            } else {
                owned.remove(&a.partition_number);
            }
        }
        self.owned.store(Some(Arc::new(owned)));

        Ok(())
    }

    /// Releases every partition this instance currently owns, for use during
    /// graceful shutdown so a departing instance's partitions are picked up
    /// by the fleet on the next rebalance cycle instead of waiting out
    /// `stale_instance_timeout`.
    pub async fn release_owned(&self) -> Result<(), OutboxError> {
        let _guard = self.tick_guard.lock().await;
        let now = Utc::now();
        let mine = self.assignment_store.find_by_instance_id(&self.self_id).await?;
        if mine.is_empty() {
            return Ok(());
        }
        let released: Vec<PartitionAssignment> = mine
            .iter()
            .map(|a| PartitionAssignment { partition_number: a.partition_number, instance_id: None, version: a.version, updated_at: now })
            .collect();
        self.assignment_store.save_all(&released).await?;
        self.owned.store(Some(Arc::new(HashSet::new())));
        info!(instance_id = %self.self_id, released = released.len(), "released owned partitions for shutdown");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;
    use chrono::DateTime;
    use outbox_core::{InstanceStatus, OutboxInstance, Result};

    use super::*;

    #[derive(Default)]
    struct FakeInstanceRegistry {
        instances: StdMutex<HashMap<String, OutboxInstance>>,
    }

    #[async_trait]
    impl InstanceRegistry for FakeInstanceRegistry {
        async fn save(&self, instance: &OutboxInstance) -> Result<()> {
            self.instances.lock().unwrap().insert(instance.instance_id.clone(), instance.clone());
            Ok(())
        }
        async fn find_by_id(&self, instance_id: &str) -> Result<Option<OutboxInstance>> {
            Ok(self.instances.lock().unwrap().get(instance_id).cloned())
        }
        async fn find_all(&self) -> Result<Vec<OutboxInstance>> {
            Ok(self.instances.lock().unwrap().values().cloned().collect())
        }
        async fn find_by_status(&self, status: InstanceStatus) -> Result<Vec<OutboxInstance>> {
            Ok(self.instances.lock().unwrap().values().filter(|i| i.status == status).cloned().collect())
        }
        async fn find_active(&self) -> Result<Vec<OutboxInstance>> {
            self.find_by_status(InstanceStatus::Active).await
        }
        async fn find_instances_with_stale_heartbeat(&self, cutoff: DateTime<Utc>) -> Result<Vec<OutboxInstance>> {
            Ok(self.instances.lock().unwrap().values().filter(|i| i.last_heartbeat < cutoff).cloned().collect())
        }
        async fn update_heartbeat(&self, instance_id: &str, now: DateTime<Utc>) -> Result<bool> {
            let mut guard = self.instances.lock().unwrap();
            if let Some(i) = guard.get_mut(instance_id) {
                i.last_heartbeat = now;
                Ok(true)
            } else {
                Ok(false)
            }
        }
        async fn update_status(&self, instance_id: &str, status: InstanceStatus, now: DateTime<Utc>) -> Result<bool> {
            let mut guard = self.instances.lock().unwrap();
            if let Some(i) = guard.get_mut(instance_id) {
                i.status = status;
                i.updated_at = now;
                Ok(true)
            } else {
                Ok(false)
            }
        }
        async fn count_by_status(&self, status: InstanceStatus) -> Result<u64> {
            Ok(self.instances.lock().unwrap().values().filter(|i| i.status == status).count() as u64)
        }
        async fn delete_by_id(&self, instance_id: &str) -> Result<bool> {
            Ok(self.instances.lock().unwrap().remove(instance_id).is_some())
        }
    }

    #[derive(Default)]
    struct FakeAssignmentStore {
        rows: StdMutex<HashMap<u32, PartitionAssignment>>,
    }

    #[async_trait]
    impl AssignmentStore for FakeAssignmentStore {
        async fn find_all(&self) -> Result<Vec<PartitionAssignment>> {
            Ok(self.rows.lock().unwrap().values().cloned().collect())
        }
        async fn find_by_instance_id(&self, instance_id: &str) -> Result<Vec<PartitionAssignment>> {
            Ok(self.rows.lock().unwrap().values().filter(|a| a.is_owned_by(instance_id)).cloned().collect())
        }
        async fn save_all(&self, assignments: &[PartitionAssignment]) -> Result<()> {
            let mut guard = self.rows.lock().unwrap();
            for a in assignments {
                match guard.get(&a.partition_number) {
                    Some(existing) if existing.version != a.version => {
                        return Err(OutboxError::OptimisticConflict {
                            partition: a.partition_number,
                            expected: a.version,
                        });
                    }
                    Some(_) | None => {
                        if guard.contains_key(&a.partition_number) && a.version == 0 {
                            return Err(OutboxError::Integrity(format!(
                                "partition {} already exists",
                                a.partition_number
                            )));
                        }
                    }
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

    fn instance(id: &str, now: DateTime<Utc>) -> OutboxInstance {
        OutboxInstance::new(id, "host", 8080, now)
    }

    #[tokio::test]
    async fn bootstraps_full_partition_table_when_empty() {
        let instances = Arc::new(FakeInstanceRegistry::default());
        let assignments = Arc::new(FakeAssignmentStore::default());
        let now = Utc::now();
        instances.save(&instance("a", now)).await.unwrap();

        let coordinator = PartitionCoordinator::new(
            "a",
            instances,
            assignments.clone(),
            Duration::from_secs(30),
            Arc::new(Mutex::new(())),
        );
        coordinator.rebalance_once().await.unwrap();

        let all = assignments.find_all().await.unwrap();
        assert_eq!(all.len(), outbox_core::PARTITION_COUNT as usize);
        assert_eq!(coordinator.owned_partitions().len(), outbox_core::PARTITION_COUNT as usize);
    }

    #[tokio::test]
    async fn claims_partitions_stale_from_a_dead_instance() {
        let instances = Arc::new(FakeInstanceRegistry::default());
        let assignments = Arc::new(FakeAssignmentStore::default());
        let now = Utc::now();
        instances.save(&instance("a", now)).await.unwrap();

        {
            let mut guard = assignments.rows.lock().unwrap();
            for n in 0..outbox_core::PARTITION_COUNT {
                guard.insert(
                    n,
                    PartitionAssignment { partition_number: n, instance_id: Some("dead".into()), version: 0, updated_at: now },
                );
            }
        }

        let coordinator = PartitionCoordinator::new(
            "a",
            instances,
            assignments.clone(),
            Duration::from_secs(30),
            Arc::new(Mutex::new(())),
        );
        coordinator.rebalance_once().await.unwrap();

        assert_eq!(coordinator.owned_partitions().len(), outbox_core::PARTITION_COUNT as usize);
    }

    #[tokio::test]
    async fn sheds_surplus_partitions_when_a_peer_joins() {
        let instances = Arc::new(FakeInstanceRegistry::default());
        let assignments = Arc::new(FakeAssignmentStore::default());
        let now = Utc::now();
        instances.save(&instance("a", now)).await.unwrap();
        instances.save(&instance("b", now)).await.unwrap();

        {
            let mut guard = assignments.rows.lock().unwrap();
            for n in 0..outbox_core::PARTITION_COUNT {
                guard.insert(
                    n,
                    PartitionAssignment { partition_number: n, instance_id: Some("a".into()), version: 0, updated_at: now },
                );
            }
        }

        let coordinator = PartitionCoordinator::new(
            "a",
            instances,
            assignments.clone(),
            Duration::from_secs(30),
            Arc::new(Mutex::new(())),
        );
        coordinator.rebalance_once().await.unwrap();

        let owned = coordinator.owned_partitions();
        assert_eq!(owned.len() as u32, outbox_core::target_count("a", &["a".to_string(), "b".to_string()]));
    }

    #[tokio::test]
    async fn release_owned_clears_assignments_and_cache() {
        let instances = Arc::new(FakeInstanceRegistry::default());
        let assignments = Arc::new(FakeAssignmentStore::default());
        let now = Utc::now();
        instances.save(&instance("a", now)).await.unwrap();

        let coordinator = PartitionCoordinator::new(
            "a",
            instances,
            assignments.clone(),
            Duration::from_secs(30),
            Arc::new(Mutex::new(())),
        );
        coordinator.rebalance_once().await.unwrap();
        assert!(!coordinator.owned_partitions().is_empty());

        coordinator.release_owned().await.unwrap();
        assert!(coordinator.owned_partitions().is_empty());
        let all = assignments.find_all().await.unwrap();
        assert!(all.iter().all(|a| a.instance_id.is_none()));
    }

    /// An empty instance registry read (no live instances at all, e.g. a
    /// transient read or every row momentarily stale) must skip the cycle
    /// rather than drive `target_count` to zero and release everything.
    #[tokio::test]
    async fn skips_cycle_when_no_live_instances() {
        let instances = Arc::new(FakeInstanceRegistry::default());
        let assignments = Arc::new(FakeAssignmentStore::default());
        let now = Utc::now();

        {
            let mut guard = assignments.rows.lock().unwrap();
            for n in 0..outbox_core::PARTITION_COUNT {
                guard.insert(n, PartitionAssignment { partition_number: n, instance_id: Some("a".into()), version: 0, updated_at: now });
            }
        }

        let coordinator = PartitionCoordinator::new(
            "a",
            instances,
            assignments.clone(),
            Duration::from_secs(30),
            Arc::new(Mutex::new(())),
        );
        coordinator.rebalance_once().await.unwrap();

        let all = assignments.find_all().await.unwrap();
        assert!(all.iter().all(|a| a.instance_id.as_deref() == Some("a")), "cycle must not release anything when live_ids is empty");
        assert!(coordinator.owned_partitions().is_empty(), "cache is left untouched, not populated, when the cycle is skipped");
    }
}
