//! # Runlist Builder
//!
//! Serializes a domain's active groups into the hardware runlist.
//!
//! ```text
//!   active set ──▶ schedulable snapshot ──▶ policy.order ──▶ permutation?
//!                                                               │
//!         ┌─────────────────────────────────────────────────────┘
//!         ▼
//!   re-read members ──▶ count ≤ max? ──▶ encode staged ──▶ swap ──▶ submit
//!                           │                                        │
//!                    ResourceExhausted                     failure: swap back
//! ```
//!
//! Membership is re-read from the registry at encode time, not when the
//! policy is queried, so a group unbound in between never reaches the
//! buffer. Entry size and count limits come from the port on every build.

use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::Ordering;

use magma_core::{DomainId, Error, GroupId};
use magma_hal::{EntryGranularity, RunlistEntry, RunlistPort};

use crate::domain::{Domain, DomainState};
use crate::policy::{GroupSnapshot, is_permutation};
use crate::registry::Registry;

// =============================================================================
// RESULT TYPES
// =============================================================================

/// A runlist that hardware has been told to load
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedRunlist {
    /// Domain the runlist belongs to
    pub domain: DomainId,
    /// Swap count after this commit
    pub generation: u64,
    /// Number of entries
    pub entries: u32,
    /// Groups in runlist order
    pub order: Vec<GroupId>,
    /// Encoded buffer
    pub bytes: Vec<u8>,
}

/// Why a rebuild was rejected
///
/// On every variant the previously live buffer stays authoritative.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildError {
    /// Encoding the active set needs more entries than hardware accepts
    ResourceExhausted {
        /// Entries needed
        required: u32,
        /// Port-reported maximum
        max: u32,
    },
    /// The domain is disabled
    DomainDisabled,
    /// The policy did not return a permutation of the active groups
    InvalidPolicyOrder,
    /// Encoding or submission failed in the port
    Hardware(Error),
    /// No such domain
    UnknownDomain,
}

impl fmt::Display for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ResourceExhausted { required, max } => {
                write!(f, "runlist needs {} entries, hardware accepts {}", required, max)
            },
            Self::DomainDisabled => write!(f, "domain disabled"),
            Self::InvalidPolicyOrder => write!(f, "policy returned an invalid order"),
            Self::Hardware(err) => write!(f, "hardware: {}", err),
            Self::UnknownDomain => write!(f, "unknown domain"),
        }
    }
}

impl From<BuildError> for Error {
    fn from(err: BuildError) -> Self {
        match err {
            BuildError::ResourceExhausted { .. } => Error::ResourceExhausted,
            BuildError::DomainDisabled => Error::DomainDisabled,
            BuildError::InvalidPolicyOrder => Error::InvalidPolicyOrder,
            BuildError::Hardware(err) => err,
            BuildError::UnknownDomain => Error::NotFound,
        }
    }
}

// =============================================================================
// BUILDER
// =============================================================================

/// Ordered entries ready to encode
#[derive(Debug)]
pub(crate) struct RunlistPlan {
    pub order: Vec<GroupId>,
    pub entries: Vec<RunlistEntry>,
}

/// Schedulable groups of the active set, sorted by ascending id
pub(crate) fn snapshot(registry: &Registry, domain: DomainId, state: &DomainState) -> Vec<GroupSnapshot> {
    let mut groups: Vec<GroupSnapshot> = state
        .active
        .iter()
        .filter_map(|&g| registry.schedulable(g, domain))
        .collect();
    groups.sort_unstable_by_key(|g| g.id);
    groups
}

/// Order the active set and lay out its entries without touching buffers
pub(crate) fn plan<P: RunlistPort + ?Sized>(
    port: &P,
    registry: &Registry,
    domain: &Domain,
    state: &mut DomainState,
) -> Result<RunlistPlan, BuildError> {
    let groups = snapshot(registry, domain.id, state);
    let ordered = state.policy.order(&groups);
    if !is_permutation(&groups, &ordered) {
        log::warn!(
            "Runlist: {} policy '{}' returned {} ids for {} groups",
            domain.id,
            state.policy.name(),
            ordered.len(),
            groups.len()
        );
        return Err(BuildError::InvalidPolicyOrder);
    }

    let granularity = port.entry_granularity(domain.id);
    let mut order = Vec::with_capacity(ordered.len());
    let mut entries = Vec::new();

    for id in ordered {
        let Some((group, channels)) = registry.live_members(id, domain.id) else {
            continue;
        };
        if channels.is_empty() {
            continue;
        }
        match granularity {
            EntryGranularity::PerChannel => {
                entries.extend(channels.iter().map(|c| RunlistEntry::Channel {
                    channel: c.id,
                    group: id,
                    context: c.desc.context,
                    ring: c.desc.ring,
                }));
            },
            EntryGranularity::PerGroup => {
                let slice_us = state.policy.time_slice(&group).as_micros();
                let members = u32::try_from(channels.len())
                    .map_err(|_| BuildError::Hardware(Error::InvalidParameter))?;
                entries.push(RunlistEntry::Group {
                    group: id,
                    timeslice_us: u32::try_from(slice_us).unwrap_or(u32::MAX),
                    channels: members,
                    priority: group.priority,
                });
            },
        }
        order.push(id);
    }

    let required = u32::try_from(entries.len()).unwrap_or(u32::MAX);
    let max = port.runlist_max_entries(domain.id);
    if required > max {
        return Err(BuildError::ResourceExhausted { required, max });
    }

    Ok(RunlistPlan { order, entries })
}

/// Rebuild and commit the domain's runlist
///
/// Must be called with the domain lock held; `state` is the guarded state.
pub(crate) fn rebuild<P: RunlistPort + ?Sized>(
    port: &P,
    registry: &Registry,
    domain: &Domain,
    state: &mut DomainState,
) -> Result<CommittedRunlist, BuildError> {
    let result = commit(port, registry, domain, state);
    let counters = &domain.counters;
    match &result {
        Ok(committed) => {
            counters.rebuilds.fetch_add(1, Ordering::Relaxed);
            log::debug!(
                "Runlist: {} generation {} committed with {} entries",
                domain.id,
                committed.generation,
                committed.entries
            );
        },
        Err(BuildError::ResourceExhausted { required, max }) => {
            counters.exhausted.fetch_add(1, Ordering::Relaxed);
            log::warn!(
                "Runlist: {} needs {} entries, hardware accepts {}",
                domain.id,
                required,
                max
            );
        },
        Err(BuildError::DomainDisabled) => {},
        Err(err) => {
            counters.failures.fetch_add(1, Ordering::Relaxed);
            log::error!("Runlist: {} rebuild failed: {}", domain.id, err);
        },
    }
    result
}

fn commit<P: RunlistPort + ?Sized>(
    port: &P,
    registry: &Registry,
    domain: &Domain,
    state: &mut DomainState,
) -> Result<CommittedRunlist, BuildError> {
    if !state.enabled {
        return Err(BuildError::DomainDisabled);
    }

    let plan = plan(port, registry, domain, state)?;
    let entry_size = port.runlist_entry_size(domain.id) as usize;
    if entry_size == 0 {
        return Err(BuildError::Hardware(Error::InvalidParameter));
    }
    let count = plan.entries.len();

    let buffers = &mut state.buffers;
    buffers.staged.clear();
    buffers.staged.resize(count * entry_size, 0);
    for (entry, slot) in plan.entries.iter().zip(buffers.staged.chunks_exact_mut(entry_size)) {
        port.encode_entry(entry, slot).map_err(BuildError::Hardware)?;
    }

    buffers.swap();
    let entries = count as u32;
    if let Err(err) = port.runlist_submit(domain.id, domain.engine, &buffers.live, entries) {
        buffers.swap();
        return Err(BuildError::Hardware(err));
    }

    buffers.live_entries = entries;
    buffers.live_order = plan.order;
    buffers.generation += 1;

    Ok(CommittedRunlist {
        domain: domain.id,
        generation: buffers.generation,
        entries,
        order: buffers.live_order.clone(),
        bytes: buffers.live.clone(),
    })
}

/// Snapshot of the live buffer
pub(crate) fn live(domain: &Domain, state: &DomainState) -> CommittedRunlist {
    CommittedRunlist {
        domain: domain.id,
        generation: state.buffers.generation,
        entries: state.buffers.live_entries,
        order: state.buffers.live_order.clone(),
        bytes: state.buffers.live.clone(),
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use alloc::boxed::Box;
    use alloc::vec;
    use core::time::Duration;

    use magma_core::{ContextId, EngineId, EngineType, GpuAddr, GpuGeneration, Priority};
    use magma_hal::sim::SimPort;
    use magma_hal::{DecodedEntry, PortCaps, RunlistFormat};

    use super::*;
    use crate::policy::{PriorityThenWait, SchedulingPolicy};
    use crate::registry::{Binding, ChannelDesc};

    const D: DomainId = DomainId::new(1);

    struct Fixture {
        port: SimPort,
        registry: Registry,
        domain: Domain,
    }

    impl Fixture {
        fn new(port: SimPort) -> Self {
            Self::with_policy(port, Box::new(PriorityThenWait::new()))
        }

        fn with_policy(port: SimPort, policy: Box<dyn SchedulingPolicy>) -> Self {
            Self {
                port,
                registry: Registry::new(),
                domain: Domain::new(D, EngineId(0), EngineType::Compute, policy),
            }
        }

        fn group(&self, priority: Priority, channels: u64) -> GroupId {
            let g = self.registry.create_group(priority, Duration::from_millis(2));
            for i in 0..channels {
                let ch = self.registry.open_channel(ChannelDesc {
                    ring: GpuAddr::new(0x10_0000),
                    context: ContextId(0x1000 * (g.id() * 16 + i + 1)),
                });
                assert_eq!(self.registry.attach(ch, g, None), Ok(Binding::Done(())));
            }
            self.registry.bind_group(g, D, g.id()).unwrap();
            self.domain.state.lock().active.push(g);
            g
        }

        fn rebuild(&self) -> Result<CommittedRunlist, BuildError> {
            let mut state = self.domain.state.lock();
            rebuild(&self.port, &self.registry, &self.domain, &mut state)
        }

        fn decoded_groups(&self, bytes: &[u8]) -> Vec<GroupId> {
            self.port
                .decode_buffer(bytes)
                .unwrap()
                .iter()
                .map(DecodedEntry::group)
                .collect()
        }
    }

    #[test]
    fn test_entries_follow_policy_order() {
        let fx = Fixture::new(SimPort::new(GpuGeneration::Volta).with_max_entries(4));
        let b = fx.group(Priority::Normal, 1);
        let a = fx.group(Priority::High, 2);

        let committed = fx.rebuild().unwrap();
        assert_eq!(committed.entries, 3);
        assert_eq!(committed.order, vec![a, b]);
        assert_eq!(fx.decoded_groups(&committed.bytes), vec![a, a, b]);
        assert_eq!(committed.bytes.len(), 3 * 16);
    }

    #[test]
    fn test_exhausted_keeps_live_buffer() {
        let fx = Fixture::new(SimPort::new(GpuGeneration::Volta).with_max_entries(4));
        fx.group(Priority::High, 2);
        fx.group(Priority::Normal, 1);
        let before = fx.rebuild().unwrap();

        fx.group(Priority::Normal, 2);
        assert_eq!(fx.rebuild(), Err(BuildError::ResourceExhausted { required: 5, max: 4 }));

        let state = fx.domain.state.lock();
        assert_eq!(live(&fx.domain, &state), before);
        assert_eq!(fx.domain.stats().exhausted, 1);
    }

    #[test]
    fn test_rebuild_is_idempotent() {
        let fx = Fixture::new(SimPort::new(GpuGeneration::Maxwell));
        fx.group(Priority::Normal, 2);
        fx.group(Priority::Realtime, 1);
        fx.group(Priority::Normal, 3);

        let first = fx.rebuild().unwrap();
        let second = fx.rebuild().unwrap();
        assert_eq!(first.bytes, second.bytes);
        assert_eq!(second.generation, first.generation + 1);
        assert_eq!(first.bytes.len(), 6 * 8);
    }

    #[test]
    fn test_unbound_and_empty_groups_skipped() {
        let fx = Fixture::new(SimPort::new(GpuGeneration::Turing));
        let a = fx.group(Priority::Normal, 1);
        let empty = fx.group(Priority::High, 0);
        let gone = fx.group(Priority::High, 1);
        // Unbound in the registry but still listed in the active set
        assert_eq!(fx.registry.unbind_group(gone, D), Ok(Binding::Done(())));

        let committed = fx.rebuild().unwrap();
        assert_eq!(committed.order, vec![a]);
        assert!(!committed.order.contains(&empty));
    }

    #[test]
    fn test_grouped_format_uses_time_slice() {
        let port = SimPort::new(GpuGeneration::Ampere).with_format(RunlistFormat::Grouped);
        let fx = Fixture::new(port);
        let g = fx.group(Priority::High, 3);

        let committed = fx.rebuild().unwrap();
        assert_eq!(committed.entries, 1);
        assert_eq!(
            fx.port.decode_buffer(&committed.bytes).unwrap(),
            vec![DecodedEntry::Group {
                group: g,
                channels: 3,
                timeslice_us: 2000,
            }]
        );
    }

    #[test]
    fn test_disabled_domain_rejects_rebuild() {
        let fx = Fixture::new(SimPort::new(GpuGeneration::Volta));
        fx.group(Priority::Normal, 1);
        fx.domain.state.lock().enabled = false;
        assert_eq!(fx.rebuild(), Err(BuildError::DomainDisabled));
        assert!(fx.port.submissions().is_empty());
    }

    struct DropsGroups;

    impl SchedulingPolicy for DropsGroups {
        fn name(&self) -> &'static str {
            "drops-groups"
        }

        fn order(&mut self, _groups: &[GroupSnapshot]) -> Vec<GroupId> {
            Vec::new()
        }

        fn time_slice(&self, group: &GroupSnapshot) -> Duration {
            group.timeslice
        }
    }

    #[test]
    fn test_non_permutation_rejected() {
        let fx = Fixture::with_policy(SimPort::new(GpuGeneration::Volta), Box::new(DropsGroups));
        fx.group(Priority::Normal, 1);
        assert_eq!(fx.rebuild(), Err(BuildError::InvalidPolicyOrder));
        assert_eq!(fx.domain.stats().failures, 1);
    }

    #[test]
    fn test_submit_failure_keeps_previous_live() {
        let port = SimPort::new(GpuGeneration::Volta).without(PortCaps::RUNLIST_SUBMIT);
        let fx = Fixture::new(port);
        fx.group(Priority::Normal, 1);

        assert_eq!(fx.rebuild(), Err(BuildError::Hardware(Error::HardwareError)));
        let state = fx.domain.state.lock();
        assert_eq!(state.buffers.generation, 0);
        assert_eq!(state.buffers.live_entries, 0);
        assert!(state.buffers.live.is_empty());
    }

    /// Port whose runlist layout disappears after initialization
    struct NoLayout(SimPort);

    impl RunlistPort for NoLayout {
        fn runlist_entry_size(&self, _domain: DomainId) -> u32 {
            0
        }

        fn runlist_max_entries(&self, domain: DomainId) -> u32 {
            self.0.runlist_max_entries(domain)
        }

        fn entry_granularity(&self, domain: DomainId) -> EntryGranularity {
            self.0.entry_granularity(domain)
        }

        fn encode_entry(&self, entry: &RunlistEntry, out: &mut [u8]) -> magma_core::Result<()> {
            self.0.encode_entry(entry, out)
        }

        fn runlist_submit(
            &self,
            domain: DomainId,
            engine: EngineId,
            buffer: &[u8],
            entries: u32,
        ) -> magma_core::Result<()> {
            self.0.runlist_submit(domain, engine, buffer, entries)
        }

        fn runlist_is_pending(&self, domain: DomainId) -> bool {
            self.0.runlist_is_pending(domain)
        }

        fn runlist_set_enabled(&self, domain: DomainId, enabled: bool) -> magma_core::Result<()> {
            self.0.runlist_set_enabled(domain, enabled)
        }
    }

    #[test]
    fn test_zero_entry_size_rejected() {
        let fx = Fixture::new(SimPort::new(GpuGeneration::Volta));
        fx.group(Priority::Normal, 1);
        let port = NoLayout(SimPort::new(GpuGeneration::Volta));

        let mut state = fx.domain.state.lock();
        assert_eq!(
            rebuild(&port, &fx.registry, &fx.domain, &mut state),
            Err(BuildError::Hardware(Error::InvalidParameter))
        );
        assert!(port.0.submissions().is_empty());
        assert_eq!(state.buffers.generation, 0);
        assert_eq!(fx.domain.stats().failures, 1);
    }
}
