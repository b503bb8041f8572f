//! # Scheduler
//!
//! Control-plane and interrupt-path entry points.
//!
//! ## Locking
//!
//! ```text
//!   Domain lock (one per domain, spin::Mutex)
//!       └──▶ registry lock (spin::RwLock, leaf)
//! ```
//!
//! The registry lock is only ever taken inside a domain lock or on its own,
//! and never across a port call. Operations on different domains do not
//! share a lock. When an operation has to find a group's domain before it
//! can lock it, it re-checks the binding under the lock and retries if the
//! group moved in between.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::fmt;
use core::time::Duration;

use magma_core::{
    Capability, ChannelId, DomainId, Error, GroupId, Priority, Result,
};
use magma_hal::{
    FaultRecord, HalPort, InterruptHandler, InterruptSource, IrqMask, PortCaps, PreemptTarget,
    TargetKind,
};

use crate::config::SchedulerConfig;
use crate::domain::{Domain, DomainState, RunlistStats};
use crate::fault::{FaultAction, FaultCoordinator, FaultStats};
use crate::policy::SchedulingPolicy;
use crate::preempt::{PreemptController, PreemptError, PreemptOutcome, PreemptState, PreemptStats};
use crate::registry::{Binding, Channel, ChannelDesc, Group, Registry};
use crate::runlist::{self, BuildError, CommittedRunlist};

// =============================================================================
// STATISTICS
// =============================================================================

/// Scheduler-wide counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Runlist counters summed over domains
    pub runlist: RunlistStats,
    /// Preempt counters
    pub preempt: PreemptStats,
    /// Fault counters
    pub fault: FaultStats,
    /// Registered channels
    pub channels: usize,
    /// Registered groups
    pub groups: usize,
}

// =============================================================================
// SCHEDULER
// =============================================================================

/// GPU command-submission scheduler
pub struct Scheduler<P: HalPort> {
    port: P,
    config: SchedulerConfig,
    registry: Registry,
    domains: BTreeMap<DomainId, Domain>,
    preempt: PreemptController,
    faults: FaultCoordinator,
}

impl<P: HalPort> Scheduler<P> {
    /// Create the scheduler and its domains
    ///
    /// Fails with `UnsupportedOperation` if the port lacks a required
    /// capability or cannot describe the runlist of a configured domain.
    pub fn new(port: P, config: SchedulerConfig) -> Result<Self> {
        config.validate()?;
        port.capabilities()
            .ensure(PortCaps::REQUIRED)
            .inspect_err(|err| log::error!("Sched: port '{}' unusable: {}", port.name(), err))?;

        let mut domains = BTreeMap::new();
        for dc in &config.domains {
            let entry_size = port.runlist_entry_size(dc.id);
            let max_entries = port.runlist_max_entries(dc.id);
            if entry_size == 0 || max_entries == 0 {
                log::error!(
                    "Sched: port '{}' has no runlist layout for {} (size {}, max {})",
                    port.name(),
                    dc.id,
                    entry_size,
                    max_entries
                );
                return Err(Capability::RunlistSubmit.into());
            }

            let policy = dc.policy.build(config.default_timeslice());
            log::info!(
                "Sched: {} on {} ({:?}), {} entries of {} bytes, policy '{}'",
                dc.id,
                dc.engine,
                dc.engine_type,
                max_entries,
                entry_size,
                policy.name()
            );
            domains.insert(dc.id, Domain::new(dc.id, dc.engine, dc.engine_type, policy));
        }

        log::info!(
            "Sched: initialized on port '{}' ({:?}) with {} domains",
            port.name(),
            port.generation(),
            domains.len()
        );

        Ok(Self {
            preempt: PreemptController::new(config.preempt),
            faults: FaultCoordinator::new(config.fault_queue_depth),
            registry: Registry::new(),
            domains,
            port,
            config,
        })
    }

    /// Hardware port
    pub fn port(&self) -> &P {
        &self.port
    }

    /// Configuration
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Look up a domain
    pub fn domain(&self, id: DomainId) -> Result<&Domain> {
        self.domains.get(&id).ok_or(Error::NotFound)
    }

    /// Configured domain ids in ascending order
    pub fn domain_ids(&self) -> impl Iterator<Item = DomainId> + '_ {
        self.domains.keys().copied()
    }

    /// Rebuild if enabled; otherwise only check that the active set fits
    fn refresh(
        &self,
        domain: &Domain,
        state: &mut DomainState,
    ) -> core::result::Result<Option<CommittedRunlist>, BuildError> {
        if state.enabled {
            runlist::rebuild(&self.port, &self.registry, domain, state).map(Some)
        } else {
            runlist::plan(&self.port, &self.registry, domain, state).map(|_| None)
        }
    }

    fn refresh_domain(&self, domain: Option<DomainId>) -> Result<Option<CommittedRunlist>> {
        let Some(id) = domain else {
            return Ok(None);
        };
        let domain = self.domain(id)?;
        let mut state = domain.state.lock();
        Ok(self.refresh(domain, &mut state)?)
    }

    // =========================================================================
    // Channel and group lifecycle
    // =========================================================================

    /// Open a channel
    pub fn open_channel(&self, desc: ChannelDesc) -> ChannelId {
        let id = self.registry.open_channel(desc);
        log::debug!("Sched: opened {} (ring {}, {:?})", id, desc.ring, desc.context);
        id
    }

    /// Unbind and destroy a channel
    pub fn close_channel(&self, id: ChannelId) -> Result<()> {
        loop {
            match self.unbind_channel(id) {
                Ok(_) | Err(Error::NotBound) => {},
                Err(Error::NotFound) => return Err(Error::NotFound),
                // Membership already dropped; only the runlist update failed
                Err(err) => log::warn!("Sched: closing {}: {}", id, err),
            }
            if let Binding::Done(()) = self.registry.remove_channel(id)? {
                log::debug!("Sched: closed {}", id);
                return Ok(());
            }
        }
    }

    /// Create a group
    pub fn create_group(&self, priority: Priority, timeslice: Duration) -> Result<GroupId> {
        self.config.check_timeslice(timeslice)?;
        let id = self.registry.create_group(priority, timeslice);
        log::debug!("Sched: created {} ({:?}, {:?})", id, priority, timeslice);
        Ok(id)
    }

    /// Destroy an unbound, empty group
    pub fn destroy_group(&self, id: GroupId) -> Result<()> {
        self.registry.destroy_group(id)?;
        log::debug!("Sched: destroyed {}", id);
        Ok(())
    }

    /// Change a group's priority class
    pub fn set_group_priority(
        &self,
        id: GroupId,
        priority: Priority,
    ) -> Result<Option<CommittedRunlist>> {
        let domain = self.registry.set_priority(id, priority)?;
        self.refresh_domain(domain)
    }

    /// Change a group's time slice
    pub fn set_group_timeslice(
        &self,
        id: GroupId,
        timeslice: Duration,
    ) -> Result<Option<CommittedRunlist>> {
        self.config.check_timeslice(timeslice)?;
        let domain = self.registry.set_timeslice(id, timeslice)?;
        self.refresh_domain(domain)
    }

    // =========================================================================
    // Binding
    // =========================================================================

    /// Add a channel to a group
    ///
    /// If the group is on a domain, its runlist is rebuilt; on failure the
    /// channel is taken out again and the previous runlist stays live.
    pub fn bind_channel_to_group(
        &self,
        channel: ChannelId,
        group: GroupId,
    ) -> Result<Option<CommittedRunlist>> {
        loop {
            let Some(id) = self.registry.group_domain(group)? else {
                match self.registry.attach(channel, group, None)? {
                    Binding::Done(()) => return Ok(None),
                    Binding::Moved => continue,
                }
            };

            let domain = self.domain(id)?;
            let mut state = domain.state.lock();
            if let Binding::Moved = self.registry.attach(channel, group, Some(id))? {
                continue;
            }

            return match self.refresh(domain, &mut state) {
                Ok(committed) => Ok(committed),
                Err(err) => {
                    let _ = self.registry.detach(channel, Some(id));
                    Err(err.into())
                },
            };
        }
    }

    /// Remove a channel from its group
    ///
    /// The channel leaves the group even if the runlist update then fails.
    pub fn unbind_channel(&self, channel: ChannelId) -> Result<Option<CommittedRunlist>> {
        loop {
            let (group, domain) = self.registry.channel_placement(channel)?;
            if group.is_none() {
                return Err(Error::NotBound);
            }
            let Some(id) = domain else {
                match self.registry.detach(channel, None)? {
                    Binding::Done(_) => return Ok(None),
                    Binding::Moved => continue,
                }
            };

            let domain = self.domain(id)?;
            let mut state = domain.state.lock();
            if let Binding::Moved = self.registry.detach(channel, Some(id))? {
                continue;
            }
            return Ok(self.refresh(domain, &mut state)?);
        }
    }

    /// Make a group part of a domain's active set
    ///
    /// Rolled back if the active set would no longer fit the runlist.
    pub fn bind_group_to_domain(
        &self,
        group: GroupId,
        id: DomainId,
    ) -> Result<Option<CommittedRunlist>> {
        let domain = self.domain(id)?;
        let mut state = domain.state.lock();

        let max = self.port.runlist_max_entries(id) as usize;
        if state.active.len() >= max {
            log::warn!("Sched: {} active set full ({} groups)", id, max);
            return Err(Error::ResourceExhausted);
        }

        self.registry.bind_group(group, id, self.port.time_ns())?;
        state.active.push(group);

        match self.refresh(domain, &mut state) {
            Ok(committed) => {
                log::debug!("Sched: bound {} to {}", group, id);
                Ok(committed)
            },
            Err(err) => {
                state.active.retain(|&g| g != group);
                state.policy.forget(group);
                let _ = self.registry.unbind_group(group, id);
                Err(err.into())
            },
        }
    }

    /// Take a group out of its domain's active set
    ///
    /// The group leaves the domain even if the runlist update then fails.
    pub fn unbind_group(&self, group: GroupId) -> Result<Option<CommittedRunlist>> {
        loop {
            let Some(id) = self.registry.group_domain(group)? else {
                return Err(Error::NotBound);
            };

            let domain = self.domain(id)?;
            let mut state = domain.state.lock();
            if let Binding::Moved = self.registry.unbind_group(group, id)? {
                continue;
            }
            state.active.retain(|&g| g != group);
            state.policy.forget(group);
            log::debug!("Sched: unbound {} from {}", group, id);
            return Ok(self.refresh(domain, &mut state)?);
        }
    }

    // =========================================================================
    // Runlists
    // =========================================================================

    /// Rebuild a domain's runlist
    pub fn rebuild(&self, id: DomainId) -> core::result::Result<CommittedRunlist, BuildError> {
        let domain = self.domain(id).map_err(|_| BuildError::UnknownDomain)?;
        let mut state = domain.state.lock();
        runlist::rebuild(&self.port, &self.registry, domain, &mut state)
    }

    /// Account an expired time slice and rebuild
    pub fn rotate(&self, id: DomainId) -> core::result::Result<CommittedRunlist, BuildError> {
        let domain = self.domain(id).map_err(|_| BuildError::UnknownDomain)?;
        let mut state = domain.state.lock();
        let groups = runlist::snapshot(&self.registry, id, &state);
        state.policy.advance(&groups);
        runlist::rebuild(&self.port, &self.registry, domain, &mut state)
    }

    /// Replace a domain's policy
    pub fn set_policy(
        &self,
        id: DomainId,
        policy: Box<dyn SchedulingPolicy>,
    ) -> Result<Option<CommittedRunlist>> {
        let domain = self.domain(id)?;
        let mut state = domain.state.lock();
        log::info!(
            "Sched: {} policy '{}' -> '{}'",
            id,
            state.policy.name(),
            policy.name()
        );
        state.policy = policy;
        Ok(self.refresh(domain, &mut state)?)
    }

    /// Suspend or resume a domain's runlist
    ///
    /// A disabled domain keeps its live buffer and rejects rebuilds;
    /// resuming rebuilds from the current active set.
    pub fn set_domain_enabled(
        &self,
        id: DomainId,
        enabled: bool,
    ) -> Result<Option<CommittedRunlist>> {
        self.port.capabilities().ensure(PortCaps::RUNLIST_ENABLE)?;
        let domain = self.domain(id)?;
        let mut state = domain.state.lock();
        if state.enabled == enabled {
            return Ok(None);
        }

        self.port.runlist_set_enabled(id, enabled)?;
        state.enabled = enabled;
        log::info!("Sched: {} {}", id, if enabled { "resumed" } else { "suspended" });

        if enabled {
            Ok(Some(runlist::rebuild(&self.port, &self.registry, domain, &mut state)?))
        } else {
            Ok(None)
        }
    }

    /// Wait until hardware has fetched the last submitted runlist
    pub fn wait_runlist_idle(&self, id: DomainId) -> Result<()> {
        self.port.capabilities().ensure(PortCaps::RUNLIST_WAIT)?;
        self.domain(id)?;

        let preempt = &self.config.preempt;
        for retry in 0..preempt.max_retries {
            if !self.port.runlist_is_pending(id) {
                return Ok(());
            }
            self.port
                .sleep_us(preempt.backoff.interval_us(preempt.poll_interval_us, retry));
        }
        if !self.port.runlist_is_pending(id) {
            return Ok(());
        }
        log::warn!("Sched: {} runlist not acknowledged", id);
        Err(Error::Timeout)
    }

    // =========================================================================
    // Preemption
    // =========================================================================

    fn target_domain(&self, target: PreemptTarget) -> core::result::Result<Option<DomainId>, PreemptError> {
        let found = match target.kind {
            TargetKind::Channel => self
                .registry
                .channel_placement(ChannelId::new(target.id))
                .map(|(_, domain)| domain),
            TargetKind::Group => self.registry.group_domain(GroupId::new(target.id)),
        };
        found.map_err(|_| PreemptError::NotFound)
    }

    /// Preempt a channel or group
    ///
    /// With `wait_for_finish` the call polls for completion and returns
    /// `Timeout` when it is not seen in time. Without it the request stays
    /// pending until [`Self::on_preempt_complete`] or
    /// [`Self::poll_preempts`] finishes it. A target that is not on any
    /// runlist has nothing to preempt and succeeds immediately, unless an
    /// earlier request for it is still unfinished.
    pub fn request_preempt(
        &self,
        target: PreemptTarget,
        wait_for_finish: bool,
    ) -> core::result::Result<(), PreemptError> {
        loop {
            let Some(id) = self.target_domain(target)? else {
                self.preempt.ensure_idle(target)?;
                log::debug!("Sched: {:?} not on any runlist", target);
                return Ok(());
            };
            let domain = self.domain(id).map_err(|_| PreemptError::NotFound)?;

            let owned = || matches!(self.target_domain(target), Ok(Some(owner)) if owner == id);
            let Some(seq) = self.preempt.issue(&self.port, domain, target, wait_for_finish, owned)? else {
                continue;
            };

            return if wait_for_finish {
                self.preempt.wait(&self.port, domain, target, seq)
            } else {
                Ok(())
            };
        }
    }

    /// Preempt with one retry after a timeout, then escalate to an engine reset
    pub fn preempt_with_recovery(
        &self,
        target: PreemptTarget,
    ) -> core::result::Result<PreemptOutcome, PreemptError> {
        let Some(id) = self.target_domain(target)? else {
            self.preempt.ensure_idle(target)?;
            return Ok(PreemptOutcome::Completed);
        };
        let engine = self.domain(id).map_err(|_| PreemptError::NotFound)?.engine;

        match self.request_preempt(target, true) {
            Ok(()) => return Ok(PreemptOutcome::Completed),
            Err(PreemptError::Timeout) => {
                log::warn!("Preempt: retrying {:?} once", target);
            },
            Err(err) => return Err(err),
        }

        match self.request_preempt(target, true) {
            Ok(()) => Ok(PreemptOutcome::Completed),
            Err(PreemptError::Timeout) => {
                log::error!("Preempt: {:?} timed out twice, resetting {}", target, engine);
                Ok(PreemptOutcome::Escalated(FaultAction::ResetEngine(engine)))
            },
            Err(err) => Err(err),
        }
    }

    /// Preempt-complete notification from the interrupt path
    ///
    /// Returns whether a request was waiting for it.
    pub fn on_preempt_complete(&self, target: PreemptTarget) -> bool {
        // The request lives where the target was when it was triggered
        let found = self
            .preempt
            .holder(target)
            .and_then(|id| self.domains.get(&id))
            .is_some_and(|domain| self.preempt.complete(domain, target));
        if !found {
            log::debug!("Preempt: spurious completion for {:?}", target);
        }
        found
    }

    /// Finish or time out the fire-and-forget requests of a domain
    pub fn poll_preempts(&self, id: DomainId) -> Result<Vec<PreemptTarget>> {
        let domain = self.domain(id)?;
        Ok(self.preempt.poll(&self.port, domain))
    }

    /// Current state of the request for `target`
    pub fn preempt_state(&self, target: PreemptTarget) -> PreemptState {
        self.preempt
            .holder(target)
            .and_then(|id| self.domains.get(&id))
            .and_then(|domain| self.preempt.state(domain, target))
            .unwrap_or(PreemptState::Idle)
    }

    // =========================================================================
    // Faults
    // =========================================================================

    /// Decode a fault interrupt payload and queue it for the worker
    ///
    /// Never blocks. Fails with `QueueFull` when the worker has fallen
    /// behind; the interrupt collaborator decides how to escalate.
    pub fn on_fault_interrupt(&self, raw: &[u8]) -> Result<()> {
        let record = self
            .port
            .decode_fault(raw)
            .inspect_err(|err| log::warn!("Fault: undecodable payload: {}", err))?;
        self.faults.enqueue(record)
    }

    /// Next queued fault
    pub fn next_fault(&self) -> Option<FaultRecord> {
        self.faults.next()
    }

    /// Decide and apply the recovery for a fault
    pub fn handle_fault(&self, record: FaultRecord) -> FaultAction {
        self.resolve_fault(record).0
    }

    /// Like [`Self::handle_fault`], also returning the attributed record
    pub fn resolve_fault(&self, record: FaultRecord) -> (FaultAction, FaultRecord) {
        self.faults
            .resolve(&self.port, &self.registry, &self.domains, record)
    }

    // =========================================================================
    // Interrupts
    // =========================================================================

    /// Route one interrupt
    pub fn on_interrupt(&self, source: InterruptSource, payload: &[u8]) -> Result<()> {
        match source {
            InterruptSource::MmuFault => self.on_fault_interrupt(payload),
            InterruptSource::Preempt => {
                let target = self.port.decode_preempt_done(payload)?;
                self.on_preempt_complete(target);
                Ok(())
            },
            InterruptSource::CtxswTimeout => {
                for id in self.domains.keys() {
                    self.poll_preempts(*id)?;
                }
                Ok(())
            },
            InterruptSource::Runlist => {
                log::debug!("Sched: runlist fetch acknowledged");
                Ok(())
            },
        }
    }

    // =========================================================================
    // Diagnostics
    // =========================================================================

    /// Copy of the live runlist
    pub fn live_runlist(&self, id: DomainId) -> Result<CommittedRunlist> {
        let domain = self.domain(id)?;
        let state = domain.state.lock();
        Ok(runlist::live(domain, &state))
    }

    /// Active set in bind order
    pub fn active_set(&self, id: DomainId) -> Result<Vec<GroupId>> {
        Ok(self.domain(id)?.state.lock().active.clone())
    }

    /// Whether a domain is enabled
    pub fn is_domain_enabled(&self, id: DomainId) -> Result<bool> {
        Ok(self.domain(id)?.state.lock().enabled)
    }

    /// Name of a domain's policy
    pub fn policy_name(&self, id: DomainId) -> Result<&'static str> {
        Ok(self.domain(id)?.state.lock().policy.name())
    }

    /// Copy of a group
    pub fn group(&self, id: GroupId) -> Option<Group> {
        self.registry.group(id)
    }

    /// Copy of a channel
    pub fn channel(&self, id: ChannelId) -> Option<Channel> {
        self.registry.channel(id)
    }

    /// Member channels of a group in bind order
    pub fn group_channels(&self, id: GroupId) -> Result<Vec<ChannelId>> {
        self.registry
            .group(id)
            .map(|g| g.members)
            .ok_or(Error::NotFound)
    }

    /// Group a channel belongs to
    pub fn channel_group(&self, id: ChannelId) -> Result<Option<GroupId>> {
        self.registry.channel_placement(id).map(|(group, _)| group)
    }

    /// Counter snapshot
    pub fn stats(&self) -> SchedulerStats {
        let runlist = self
            .domains
            .values()
            .map(Domain::stats)
            .fold(RunlistStats::default(), |acc, s| RunlistStats {
                rebuilds: acc.rebuilds + s.rebuilds,
                exhausted: acc.exhausted + s.exhausted,
                failures: acc.failures + s.failures,
            });
        SchedulerStats {
            runlist,
            preempt: self.preempt.stats(),
            fault: self.faults.stats(),
            channels: self.registry.channel_count(),
            groups: self.registry.group_count(),
        }
    }
}

impl<P: HalPort> InterruptHandler for Scheduler<P> {
    fn handle(&self, source: InterruptSource, payload: &[u8]) -> Result<()> {
        self.on_interrupt(source, payload)
    }

    fn sources(&self) -> IrqMask {
        IrqMask::all()
    }
}

impl<P: HalPort> fmt::Debug for Scheduler<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("port", &self.port.name())
            .field("generation", &self.port.generation())
            .field("domains", &self.domains.len())
            .field("stats", &self.stats())
            .finish()
    }
}

static_assertions::assert_impl_all!(Registry: Send, Sync);

// =============================================================================
// TESTS
// =============================================================================
