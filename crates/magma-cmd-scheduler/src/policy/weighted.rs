//! Weighted fair policy.
//!
//! Each group accumulates virtual runtime: the wall time of a slice scaled
//! down by the weight of its priority class. The group with the least
//! virtual runtime runs first, so a group of weight 4 gets four times the
//! GPU time of a weight-1 group over a long run.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::cmp::Reverse;
use core::time::Duration;

use magma_core::GroupId;

use super::{GroupSnapshot, SchedulingPolicy};

/// Fixed-point scale for virtual runtime
const VRUNTIME_SCALE: u64 = 1024;

/// Virtual-time fair share weighted by priority
#[derive(Debug, Default)]
pub struct WeightedFair {
    vruntime: BTreeMap<GroupId, u64>,
}

impl WeightedFair {
    /// Create the policy
    pub fn new() -> Self {
        Self::default()
    }

    /// Virtual runtime accumulated by a group
    pub fn vruntime(&self, group: GroupId) -> Option<u64> {
        self.vruntime.get(&group).copied()
    }

    /// Start unseen groups at the current minimum so they do not starve others
    fn admit(&mut self, groups: &[GroupSnapshot]) {
        let floor = groups
            .iter()
            .filter_map(|g| self.vruntime.get(&g.id))
            .copied()
            .min()
            .unwrap_or(0);
        for g in groups {
            self.vruntime.entry(g.id).or_insert(floor);
        }
    }
}

impl SchedulingPolicy for WeightedFair {
    fn name(&self) -> &'static str {
        "weighted-fair"
    }

    fn order(&mut self, groups: &[GroupSnapshot]) -> Vec<GroupId> {
        self.admit(groups);
        let mut sorted = groups.to_vec();
        sorted.sort_by_key(|g| {
            let vr = self.vruntime.get(&g.id).copied().unwrap_or(0);
            (vr, Reverse(g.priority), g.id)
        });
        sorted.into_iter().map(|g| g.id).collect()
    }

    fn time_slice(&self, group: &GroupSnapshot) -> Duration {
        group.timeslice
    }

    fn advance(&mut self, groups: &[GroupSnapshot]) {
        let Some(&head) = self.order(groups).first() else {
            return;
        };
        let Some(group) = groups.iter().find(|g| g.id == head) else {
            return;
        };
        let ran_ns = u64::try_from(group.timeslice.as_nanos()).unwrap_or(u64::MAX);
        let charge = ran_ns.saturating_mul(VRUNTIME_SCALE) / u64::from(group.priority.weight());
        if let Some(vr) = self.vruntime.get_mut(&head) {
            *vr = vr.saturating_add(charge);
        }
    }

    fn forget(&mut self, group: GroupId) {
        self.vruntime.remove(&group);
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec;

    use magma_core::Priority;

    use super::*;
    use crate::policy::tests::snap;

    #[test]
    fn test_heavier_group_runs_more_often() {
        let groups = vec![snap(1, Priority::Low, 0), snap(2, Priority::High, 0)];
        let mut wf = WeightedFair::new();

        let mut heads = Vec::new();
        for _ in 0..10 {
            heads.push(wf.order(&groups)[0]);
            wf.advance(&groups);
        }
        let high = heads.iter().filter(|&&g| g == GroupId::new(2)).count();
        assert!(high >= 7, "high priority ran {} of 10 slices", high);
    }

    #[test]
    fn test_new_group_starts_at_floor() {
        let mut wf = WeightedFair::new();
        let first = vec![snap(1, Priority::Normal, 0)];
        wf.order(&first);
        wf.advance(&first);
        let charged = wf.vruntime(GroupId::new(1)).unwrap();
        assert!(charged > 0);

        let both = vec![snap(1, Priority::Normal, 0), snap(2, Priority::Normal, 0)];
        wf.order(&both);
        assert_eq!(wf.vruntime(GroupId::new(2)), Some(charged));

        wf.forget(GroupId::new(1));
        assert_eq!(wf.vruntime(GroupId::new(1)), None);
    }
}
