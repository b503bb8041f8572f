//! # Scheduling Policies
//!
//! Pluggable ordering and time-budget algorithms for the groups of one
//! runlist domain.
//!
//! The builder hands a policy a snapshot of the schedulable groups (sorted
//! by ascending id) and expects back a permutation of their ids. Policies
//! never see the domain lock, the runlist buffers or the hardware port.
//!
//! ```text
//!   rebuild ──▶ order(snapshot) ──▶ [tsg#3, tsg#1, tsg#2]
//!          └──▶ time_slice(group) ──▶ Duration        (per group entry)
//!   rotate  ──▶ advance(snapshot)                     (time-slice expiry)
//! ```

use alloc::vec::Vec;
use core::time::Duration;

use magma_core::{GroupId, Priority};

mod priority;
mod round_robin;
mod weighted;

pub use priority::{PriorityThenWait, StrictPriority};
pub use round_robin::RoundRobin;
pub use weighted::WeightedFair;

// =============================================================================
// GROUP SNAPSHOT
// =============================================================================

/// Read-only view of one schedulable group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupSnapshot {
    /// Group id
    pub id: GroupId,
    /// Priority class
    pub priority: Priority,
    /// Requested time slice
    pub timeslice: Duration,
    /// Time the group became runnable on the domain
    pub runnable_since_ns: u64,
    /// Number of member channels
    pub channels: u32,
}

// =============================================================================
// POLICY TRAIT
// =============================================================================

/// Scheduling policy
///
/// Called with the domain lock held, so implementations must not block.
pub trait SchedulingPolicy: Send {
    /// Policy name for diagnostics
    fn name(&self) -> &'static str;

    /// Order the groups; must return a permutation of their ids
    fn order(&mut self, groups: &[GroupSnapshot]) -> Vec<GroupId>;

    /// Time budget granted to a group
    fn time_slice(&self, group: &GroupSnapshot) -> Duration;

    /// Account one expired time slice
    fn advance(&mut self, _groups: &[GroupSnapshot]) {}

    /// Drop any state kept for a group that left the domain
    fn forget(&mut self, _group: GroupId) {}
}

/// Check that `order` is a permutation of the snapshot ids
pub fn is_permutation(groups: &[GroupSnapshot], order: &[GroupId]) -> bool {
    if groups.len() != order.len() {
        return false;
    }
    let mut expected: Vec<GroupId> = groups.iter().map(|g| g.id).collect();
    let mut actual = order.to_vec();
    expected.sort_unstable();
    actual.sort_unstable();
    expected == actual
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
pub(crate) mod tests {
    use alloc::vec;

    use super::*;

    pub(crate) fn snap(id: u64, priority: Priority, since: u64) -> GroupSnapshot {
        GroupSnapshot {
            id: GroupId::new(id),
            priority,
            timeslice: Duration::from_millis(2),
            runnable_since_ns: since,
            channels: 1,
        }
    }

    pub(crate) fn ids(raw: &[u64]) -> Vec<GroupId> {
        raw.iter().map(|&id| GroupId::new(id)).collect()
    }

    #[test]
    fn test_permutation_check() {
        let groups = vec![snap(1, Priority::Normal, 0), snap(2, Priority::Normal, 0)];
        assert!(is_permutation(&groups, &ids(&[2, 1])));
        assert!(!is_permutation(&groups, &ids(&[1])));
        assert!(!is_permutation(&groups, &ids(&[1, 1])));
        assert!(!is_permutation(&groups, &ids(&[1, 3])));
        assert!(is_permutation(&[], &[]));
    }
}
