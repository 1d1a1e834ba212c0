//! Immutable per-cycle rebalance snapshot.
//!
//! [`PartitionContext`] answers "what must I claim or release right now"
//! purely from data already in memory -- it issues no I/O and holds no
//! reference to a live connection, so it is trivial to unit-test the
//! rebalance math independently of the storage layer.

use crate::model::PartitionAssignment;

/// A snapshot of cluster state taken once at the start of a rebalance cycle.
#[derive(Debug, Clone)]
pub struct PartitionContext {
    self_id: String,
    live_ids: Vec<String>,
    assignments: Vec<PartitionAssignment>,
    target_count: u32,
}

impl PartitionContext {
    #[must_use]
    pub fn new(
        self_id: impl Into<String>,
        live_ids: Vec<String>,
        assignments: Vec<PartitionAssignment>,
        target_count: u32,
    ) -> Self {
        Self {
            self_id: self_id.into(),
            live_ids,
            assignments,
            target_count,
        }
    }

    #[must_use]
    pub fn has_no_assignments(&self) -> bool {
        self.assignments.is_empty()
    }

    #[must_use]
    pub fn owned_assignments(&self) -> Vec<&PartitionAssignment> {
        self.assignments.iter().filter(|a| a.is_owned_by(&self.self_id)).collect()
    }

    #[must_use]
    pub fn stale_assignments(&self) -> Vec<&PartitionAssignment> {
        self.assignments.iter().filter(|a| a.is_stale(&self.live_ids)).collect()
    }

    #[must_use]
    pub fn count_partitions_to_claim(&self) -> usize {
        let owned = self.owned_assignments().len() as u32;
        self.target_count.saturating_sub(owned) as usize
    }

    #[must_use]
    pub fn count_partitions_to_release(&self) -> usize {
        let owned = self.owned_assignments().len() as u32;
        owned.saturating_sub(self.target_count) as usize
    }

    /// The stale assignments with the smallest partition numbers, up to the
    /// number this instance still needs to reach its target count. Empty if
    /// nothing needs claiming or no stale candidates exist.
    #[must_use]
    pub fn assignments_to_claim(&self) -> Vec<&PartitionAssignment> {
        let need = self.count_partitions_to_claim();
        if need == 0 {
            return Vec::new();
        }
        let mut stale = self.stale_assignments();
        if stale.len() < need {
            return Vec::new();
        }
        stale.sort_by_key(|a| a.partition_number);
        stale.into_iter().take(need).collect()
    }

    /// The owned assignments with the largest partition numbers, up to the
    /// surplus this instance must shed. Biasing releases to the tail keeps
    /// claims on the head stable across cycles.
    #[must_use]
    pub fn assignments_to_release(&self) -> Vec<&PartitionAssignment> {
        let surplus = self.count_partitions_to_release();
        if surplus == 0 {
            return Vec::new();
        }
        let mut owned = self.owned_assignments();
        owned.sort_by_key(|a| std::cmp::Reverse(a.partition_number));
        owned.into_iter().take(surplus).collect()
    }

    #[must_use]
    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    #[must_use]
    pub fn target_count(&self) -> u32 {
        self.target_count
    }
}
