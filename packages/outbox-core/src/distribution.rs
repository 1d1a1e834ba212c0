//! Fair-share partition count calculator.
//!
//! Every instance must be able to compute its own target partition count
//! from nothing but the live instance set -- no leader, no coordination
//! message. Each instance sorts the same set lexicographically and reads
//! its own index out of it, so all instances agree without talking to
//! each other.

use crate::hash::PARTITION_COUNT;

/// Computes how many of the [`PARTITION_COUNT`] partitions `self_id` should
/// own, given the full set of currently live instance IDs.
///
/// Sorts `live_ids` lexicographically, divides the ring evenly (`base =
/// PARTITION_COUNT / n`), and hands the first `PARTITION_COUNT % n`
/// instances in sorted order one extra partition each so every partition is
/// accounted for. Returns `0` if `live_ids` is empty or does not contain
/// `self_id`.
#[must_use]
pub fn target_count(self_id: &str, live_ids: &[String]) -> u32 {
    if live_ids.is_empty() {
        return 0;
    }

    let mut sorted: Vec<&str> = live_ids.iter().map(String::as_str).collect();
    sorted.sort_unstable();

    let Some(index) = sorted.iter().position(|id| *id == self_id) else {
        return 0;
    };

    let n = sorted.len() as u32;
    let base = PARTITION_COUNT / n;
    let remainder = PARTITION_COUNT % n;
    base + u32::from((index as u32) < remainder)
}
