//! Priority-class policies.

use alloc::vec::Vec;
use core::cmp::Reverse;
use core::time::Duration;

use magma_core::GroupId;

use super::{GroupSnapshot, SchedulingPolicy};

// =============================================================================
// PRIORITY THEN WAIT
// =============================================================================

/// Default policy: highest priority first, then longest waiting
///
/// Within a priority class, the group that became runnable earliest runs
/// first. Remaining ties go to the lower group id.
#[derive(Debug, Default)]
pub struct PriorityThenWait;

impl PriorityThenWait {
    /// Create the policy
    pub const fn new() -> Self {
        Self
    }
}

impl SchedulingPolicy for PriorityThenWait {
    fn name(&self) -> &'static str {
        "priority-then-wait"
    }

    fn order(&mut self, groups: &[GroupSnapshot]) -> Vec<GroupId> {
        let mut sorted = groups.to_vec();
        sorted.sort_by_key(|g| (Reverse(g.priority), g.runnable_since_ns, g.id));
        sorted.into_iter().map(|g| g.id).collect()
    }

    fn time_slice(&self, group: &GroupSnapshot) -> Duration {
        group.timeslice
    }
}

// =============================================================================
// STRICT PRIORITY
// =============================================================================

/// Highest priority first, ties by group id
#[derive(Debug, Default)]
pub struct StrictPriority;

impl StrictPriority {
    /// Create the policy
    pub const fn new() -> Self {
        Self
    }
}

impl SchedulingPolicy for StrictPriority {
    fn name(&self) -> &'static str {
        "strict-priority"
    }

    fn order(&mut self, groups: &[GroupSnapshot]) -> Vec<GroupId> {
        let mut sorted = groups.to_vec();
        sorted.sort_by_key(|g| (Reverse(g.priority), g.id));
        sorted.into_iter().map(|g| g.id).collect()
    }

    fn time_slice(&self, group: &GroupSnapshot) -> Duration {
        group.timeslice
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use alloc::vec;

    use magma_core::Priority;

    use super::*;
    use crate::policy::tests::{ids, snap};

    #[test]
    fn test_priority_then_wait_order() {
        let groups = vec![
            snap(1, Priority::Normal, 300),
            snap(2, Priority::High, 500),
            snap(3, Priority::Normal, 100),
            snap(4, Priority::Normal, 100),
        ];
        let mut policy = PriorityThenWait::new();
        assert_eq!(policy.order(&groups), ids(&[2, 3, 4, 1]));
    }

    #[test]
    fn test_strict_priority_ignores_wait() {
        let groups = vec![
            snap(1, Priority::Low, 0),
            snap(2, Priority::Normal, 900),
            snap(3, Priority::Normal, 10),
        ];
        let mut policy = StrictPriority::new();
        assert_eq!(policy.order(&groups), ids(&[2, 3, 1]));
    }

    #[test]
    fn test_order_is_stable_across_calls() {
        let groups = vec![snap(5, Priority::High, 1), snap(6, Priority::High, 1)];
        let mut policy = PriorityThenWait::new();
        assert_eq!(policy.order(&groups), policy.order(&groups));
    }
}
