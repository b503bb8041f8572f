//! Round-robin policy.

use alloc::vec::Vec;
use core::time::Duration;

use magma_core::GroupId;

use super::{GroupSnapshot, SchedulingPolicy};

/// Rotating order with a uniform quantum
///
/// Groups are ordered by id starting at the cursor and wrapping around.
/// The cursor only moves in [`SchedulingPolicy::advance`], so repeated
/// orders without an expired slice are identical.
#[derive(Debug)]
pub struct RoundRobin {
    quantum: Duration,
    cursor: u64,
}

impl RoundRobin {
    /// Create the policy with a quantum for every group
    pub const fn new(quantum: Duration) -> Self {
        Self { quantum, cursor: 0 }
    }
}

impl SchedulingPolicy for RoundRobin {
    fn name(&self) -> &'static str {
        "round-robin"
    }

    fn order(&mut self, groups: &[GroupSnapshot]) -> Vec<GroupId> {
        let mut ids: Vec<GroupId> = groups.iter().map(|g| g.id).collect();
        ids.sort_unstable();
        let split = ids.partition_point(|id| id.id() < self.cursor);
        ids.rotate_left(split);
        ids
    }

    fn time_slice(&self, _group: &GroupSnapshot) -> Duration {
        self.quantum
    }

    fn advance(&mut self, groups: &[GroupSnapshot]) {
        if let Some(head) = self.order(groups).first() {
            self.cursor = head.id() + 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec;

    use magma_core::Priority;

    use super::*;
    use crate::policy::tests::{ids, snap};

    #[test]
    fn test_rotation() {
        let groups = vec![
            snap(1, Priority::High, 0),
            snap(2, Priority::Low, 0),
            snap(3, Priority::Normal, 0),
        ];
        let mut rr = RoundRobin::new(Duration::from_millis(1));
        assert_eq!(rr.order(&groups), ids(&[1, 2, 3]));
        assert_eq!(rr.order(&groups), ids(&[1, 2, 3]));
        rr.advance(&groups);
        assert_eq!(rr.order(&groups), ids(&[2, 3, 1]));
        rr.advance(&groups);
        rr.advance(&groups);
        assert_eq!(rr.order(&groups), ids(&[1, 2, 3]));
    }

    #[test]
    fn test_cursor_survives_departures() {
        let mut rr = RoundRobin::new(Duration::from_millis(1));
        let groups = vec![snap(1, Priority::Normal, 0), snap(4, Priority::Normal, 0)];
        rr.advance(&groups);
        // Group 4 left and group 2 arrived; rotation continues after group 1
        let remaining = vec![snap(1, Priority::Normal, 0), snap(2, Priority::Normal, 0)];
        assert_eq!(rr.order(&remaining), ids(&[2, 1]));
        assert_eq!(rr.time_slice(&remaining[0]), Duration::from_millis(1));
    }
}
