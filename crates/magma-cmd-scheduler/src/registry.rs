//! # Channel and Group Registry
//!
//! Owning containers for channels and time-slice groups.
//!
//! Cross references are identifiers, never pointers:
//!
//! ```text
//!   Group ──members──▶ [ChannelId, ...]
//!     │                     │
//!     └─domain: Option<DomainId>   Channel ──group: Option<GroupId>
//! ```
//!
//! The registry lock is a leaf: it is never held while taking a Domain lock
//! or calling the hardware port. Mutations that change what a domain runs
//! carry the domain the caller has locked; when the group moved in between,
//! the call reports [`Binding::Moved`] and the caller retries.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use core::time::Duration;

use magma_core::{
    ChannelId, ContextId, DomainId, Error, GpuAddr, GroupId, Priority, Result,
};
use spin::RwLock;

use crate::policy::GroupSnapshot;

// =============================================================================
// CHANNEL
// =============================================================================

/// Hardware description of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelDesc {
    /// Ring (pushbuffer) location
    pub ring: GpuAddr,
    /// Instance context reported by the MMU on faults
    pub context: ContextId,
}

/// Channel lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Opened, not in any group
    Open,
    /// Member of a group
    Bound,
    /// Isolated after a fault; awaiting close
    Unrunnable,
}

/// A submission channel
#[derive(Debug, Clone)]
pub struct Channel {
    /// Channel id
    pub id: ChannelId,
    /// Hardware description
    pub desc: ChannelDesc,
    /// Owning group
    pub group: Option<GroupId>,
    /// Lifecycle state
    pub state: ChannelState,
}

// =============================================================================
// GROUP
// =============================================================================

/// Group scheduling state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupState {
    /// Eligible for the runlist
    Runnable,
    /// Isolated after a fault
    Unrunnable,
}

/// A time-slice group
#[derive(Debug, Clone)]
pub struct Group {
    /// Group id
    pub id: GroupId,
    /// Member channels in bind order
    pub members: Vec<ChannelId>,
    /// Priority class
    pub priority: Priority,
    /// Requested time slice
    pub timeslice: Duration,
    /// Domain the group is bound to
    pub domain: Option<DomainId>,
    /// Scheduling state
    pub state: GroupState,
    /// Time the group became runnable on its domain
    pub runnable_since_ns: u64,
}

impl Group {
    fn snapshot(&self) -> GroupSnapshot {
        GroupSnapshot {
            id: self.id,
            priority: self.priority,
            timeslice: self.timeslice,
            runnable_since_ns: self.runnable_since_ns,
            channels: self.members.len() as u32,
        }
    }
}

/// Outcome of a mutation made on behalf of a locked domain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Binding<T> {
    /// Applied
    Done(T),
    /// The group is bound elsewhere than the caller assumed
    Moved,
}

/// One channel as seen at encode time
#[derive(Debug, Clone, Copy)]
pub(crate) struct LiveChannel {
    pub id: ChannelId,
    pub desc: ChannelDesc,
}

// =============================================================================
// REGISTRY
// =============================================================================

#[derive(Debug, Default)]
struct Tables {
    channels: BTreeMap<ChannelId, Channel>,
    groups: BTreeMap<GroupId, Group>,
}

impl Tables {
    fn group_mut(&mut self, id: GroupId) -> Result<&mut Group> {
        self.groups.get_mut(&id).ok_or(Error::NotFound)
    }

    fn channel_mut(&mut self, id: ChannelId) -> Result<&mut Channel> {
        self.channels.get_mut(&id).ok_or(Error::NotFound)
    }
}

/// Channel and group tables
#[derive(Debug)]
pub struct Registry {
    tables: RwLock<Tables>,
    next_channel: AtomicU64,
    next_group: AtomicU64,
}

impl Registry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            next_channel: AtomicU64::new(1),
            next_group: AtomicU64::new(1),
        }
    }

    // -------------------------------------------------------------------------
    // Lookup
    // -------------------------------------------------------------------------

    /// Copy of a channel
    pub fn channel(&self, id: ChannelId) -> Option<Channel> {
        self.tables.read().channels.get(&id).cloned()
    }

    /// Copy of a group
    pub fn group(&self, id: GroupId) -> Option<Group> {
        self.tables.read().groups.get(&id).cloned()
    }

    /// Domain a group is bound to
    pub fn group_domain(&self, id: GroupId) -> Result<Option<DomainId>> {
        self.tables
            .read()
            .groups
            .get(&id)
            .map(|g| g.domain)
            .ok_or(Error::NotFound)
    }

    /// Group of a channel and that group's domain
    pub fn channel_placement(&self, id: ChannelId) -> Result<(Option<GroupId>, Option<DomainId>)> {
        let tables = self.tables.read();
        let channel = tables.channels.get(&id).ok_or(Error::NotFound)?;
        let domain = channel
            .group
            .and_then(|g| tables.groups.get(&g))
            .and_then(|g| g.domain);
        Ok((channel.group, domain))
    }

    /// Number of registered channels
    pub fn channel_count(&self) -> usize {
        self.tables.read().channels.len()
    }

    /// Number of registered groups
    pub fn group_count(&self) -> usize {
        self.tables.read().groups.len()
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Register a channel
    pub fn open_channel(&self, desc: ChannelDesc) -> ChannelId {
        let id = ChannelId::new(self.next_channel.fetch_add(1, Ordering::Relaxed));
        self.tables.write().channels.insert(id, Channel {
            id,
            desc,
            group: None,
            state: ChannelState::Open,
        });
        id
    }

    /// Remove a channel that no group holds
    pub(crate) fn remove_channel(&self, id: ChannelId) -> Result<Binding<()>> {
        let mut tables = self.tables.write();
        let channel = tables.channels.get(&id).ok_or(Error::NotFound)?;
        if channel.group.is_some() {
            return Ok(Binding::Moved);
        }
        tables.channels.remove(&id);
        Ok(Binding::Done(()))
    }

    /// Register a group
    pub fn create_group(&self, priority: Priority, timeslice: Duration) -> GroupId {
        let id = GroupId::new(self.next_group.fetch_add(1, Ordering::Relaxed));
        self.tables.write().groups.insert(id, Group {
            id,
            members: Vec::new(),
            priority,
            timeslice,
            domain: None,
            state: GroupState::Runnable,
            runnable_since_ns: 0,
        });
        id
    }

    /// Remove an unbound, empty group
    pub fn destroy_group(&self, id: GroupId) -> Result<()> {
        let mut tables = self.tables.write();
        let group = tables.groups.get(&id).ok_or(Error::NotFound)?;
        if group.domain.is_some() || !group.members.is_empty() {
            return Err(Error::Busy);
        }
        tables.groups.remove(&id);
        Ok(())
    }

    /// Change a group's priority, returning its domain
    pub fn set_priority(&self, id: GroupId, priority: Priority) -> Result<Option<DomainId>> {
        let mut tables = self.tables.write();
        let group = tables.group_mut(id)?;
        group.priority = priority;
        Ok(group.domain)
    }

    /// Change a group's time slice, returning its domain
    pub fn set_timeslice(&self, id: GroupId, timeslice: Duration) -> Result<Option<DomainId>> {
        let mut tables = self.tables.write();
        let group = tables.group_mut(id)?;
        group.timeslice = timeslice;
        Ok(group.domain)
    }

    // -------------------------------------------------------------------------
    // Channel membership
    // -------------------------------------------------------------------------

    /// Add a channel to a group bound to `expected`
    pub(crate) fn attach(
        &self,
        channel: ChannelId,
        group: GroupId,
        expected: Option<DomainId>,
    ) -> Result<Binding<()>> {
        let mut tables = self.tables.write();

        let ch = tables.channels.get(&channel).ok_or(Error::NotFound)?;
        if ch.group.is_some() {
            return Err(Error::AlreadyBound);
        }
        if ch.state == ChannelState::Unrunnable {
            return Err(Error::InvalidState);
        }

        let grp = tables.group_mut(group)?;
        if grp.domain != expected {
            return Ok(Binding::Moved);
        }
        if grp.state == GroupState::Unrunnable {
            return Err(Error::InvalidState);
        }
        assert!(
            !grp.members.contains(&channel),
            "{} listed in {} but has no group back-reference",
            channel,
            group
        );
        grp.members.push(channel);

        let ch = tables.channel_mut(channel)?;
        ch.group = Some(group);
        ch.state = ChannelState::Bound;
        Ok(Binding::Done(()))
    }

    /// Remove a channel from its group, which must be bound to `expected`
    pub(crate) fn detach(
        &self,
        channel: ChannelId,
        expected: Option<DomainId>,
    ) -> Result<Binding<GroupId>> {
        let mut tables = self.tables.write();

        let ch = tables.channels.get(&channel).ok_or(Error::NotFound)?;
        let group = ch.group.ok_or(Error::NotBound)?;

        let grp = tables.groups.get_mut(&group).unwrap_or_else(|| {
            panic!("{} points at missing group {}", channel, group)
        });
        if grp.domain != expected {
            return Ok(Binding::Moved);
        }
        let pos = grp
            .members
            .iter()
            .position(|&c| c == channel)
            .unwrap_or_else(|| panic!("{} claims {} but is not a member", channel, group));
        grp.members.remove(pos);

        let ch = tables.channel_mut(channel)?;
        ch.group = None;
        if ch.state == ChannelState::Bound {
            ch.state = ChannelState::Open;
        }
        Ok(Binding::Done(group))
    }

    // -------------------------------------------------------------------------
    // Domain membership
    // -------------------------------------------------------------------------

    /// Bind a runnable, unbound group to `domain`
    pub(crate) fn bind_group(&self, id: GroupId, domain: DomainId, now_ns: u64) -> Result<()> {
        let mut tables = self.tables.write();
        let group = tables.group_mut(id)?;
        if group.domain.is_some() {
            return Err(Error::AlreadyBound);
        }
        if group.state == GroupState::Unrunnable {
            return Err(Error::InvalidState);
        }
        group.domain = Some(domain);
        group.runnable_since_ns = now_ns;
        Ok(())
    }

    /// Unbind a group from `expected`
    pub(crate) fn unbind_group(&self, id: GroupId, expected: DomainId) -> Result<Binding<()>> {
        let mut tables = self.tables.write();
        let group = tables.group_mut(id)?;
        match group.domain {
            None => Err(Error::NotBound),
            Some(d) if d != expected => Ok(Binding::Moved),
            Some(_) => {
                group.domain = None;
                Ok(Binding::Done(()))
            },
        }
    }

    /// Mark a group and its channels unrunnable and unbind it
    ///
    /// Returns the group's channels for the caller's cleanup path.
    pub(crate) fn isolate(&self, id: GroupId) -> Vec<ChannelId> {
        let mut tables = self.tables.write();
        let Some(group) = tables.groups.get_mut(&id) else {
            return Vec::new();
        };
        group.domain = None;
        group.state = GroupState::Unrunnable;
        let members = group.members.clone();
        for channel in &members {
            if let Some(ch) = tables.channels.get_mut(channel) {
                ch.state = ChannelState::Unrunnable;
            }
        }
        members
    }

    // -------------------------------------------------------------------------
    // Builder views
    // -------------------------------------------------------------------------

    /// Snapshot of a group if it is runnable, bound to `domain` and non-empty
    pub(crate) fn schedulable(&self, id: GroupId, domain: DomainId) -> Option<GroupSnapshot> {
        let tables = self.tables.read();
        let group = tables.groups.get(&id)?;
        let ok = group.domain == Some(domain)
            && group.state == GroupState::Runnable
            && !group.members.is_empty();
        ok.then(|| group.snapshot())
    }

    /// Current members of a group on `domain`, re-read at encode time
    ///
    /// Returns `None` when the group left the domain or stopped being
    /// runnable since the policy saw it.
    pub(crate) fn live_members(
        &self,
        id: GroupId,
        domain: DomainId,
    ) -> Option<(GroupSnapshot, Vec<LiveChannel>)> {
        let tables = self.tables.read();
        let group = tables.groups.get(&id)?;
        if group.domain != Some(domain) || group.state != GroupState::Runnable {
            return None;
        }
        let channels = group
            .members
            .iter()
            .filter_map(|c| tables.channels.get(c))
            .filter(|c| c.group == Some(id) && c.state == ChannelState::Bound)
            .map(|c| LiveChannel {
                id: c.id,
                desc: c.desc,
            })
            .collect();
        Some((group.snapshot(), channels))
    }

    /// Groups among `candidates` owning a channel with `context`
    pub(crate) fn groups_with_context(
        &self,
        candidates: &[GroupId],
        context: ContextId,
    ) -> Vec<(GroupId, ChannelId)> {
        let tables = self.tables.read();
        let mut hits = Vec::new();
        for &id in candidates {
            let Some(group) = tables.groups.get(&id) else {
                continue;
            };
            let hit = group
                .members
                .iter()
                .filter_map(|c| tables.channels.get(c))
                .find(|c| c.desc.context == context);
            if let Some(channel) = hit {
                hits.push((id, channel.id));
            }
        }
        hits
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(ctx: u64) -> ChannelDesc {
        ChannelDesc {
            ring: GpuAddr::new(0x1000 * ctx),
            context: ContextId(ctx),
        }
    }

    fn slice() -> Duration {
        Duration::from_millis(5)
    }

    #[test]
    fn test_ids_start_at_one() {
        let reg = Registry::new();
        assert_eq!(reg.open_channel(desc(1)), ChannelId::new(1));
        assert_eq!(reg.create_group(Priority::Normal, slice()), GroupId::new(1));
        assert_eq!(reg.open_channel(desc(2)), ChannelId::new(2));
    }

    #[test]
    fn test_attach_and_detach() {
        let reg = Registry::new();
        let ch = reg.open_channel(desc(1));
        let g = reg.create_group(Priority::High, slice());

        assert_eq!(reg.attach(ch, g, None), Ok(Binding::Done(())));
        assert_eq!(reg.channel(ch).unwrap().state, ChannelState::Bound);
        assert_eq!(reg.attach(ch, g, None), Err(Error::AlreadyBound));
        assert_eq!(reg.destroy_group(g), Err(Error::Busy));

        assert_eq!(reg.detach(ch, None), Ok(Binding::Done(g)));
        assert_eq!(reg.detach(ch, None), Err(Error::NotBound));
        assert!(reg.group(g).unwrap().members.is_empty());
        assert!(reg.destroy_group(g).is_ok());
    }

    #[test]
    fn test_attach_reports_moved_group() {
        let reg = Registry::new();
        let ch = reg.open_channel(desc(1));
        let g = reg.create_group(Priority::Normal, slice());
        reg.bind_group(g, DomainId::new(1), 0).unwrap();

        assert_eq!(reg.attach(ch, g, None), Ok(Binding::Moved));
        assert_eq!(reg.attach(ch, g, Some(DomainId::new(1))), Ok(Binding::Done(())));
        assert_eq!(reg.channel_placement(ch), Ok((Some(g), Some(DomainId::new(1)))));
    }

    #[test]
    fn test_isolate_blocks_rebinding() {
        let reg = Registry::new();
        let ch = reg.open_channel(desc(7));
        let g = reg.create_group(Priority::Normal, slice());
        reg.attach(ch, g, None).unwrap();
        reg.bind_group(g, DomainId::new(1), 0).unwrap();

        assert_eq!(reg.isolate(g), alloc::vec![ch]);
        assert_eq!(reg.group_domain(g), Ok(None));
        assert_eq!(reg.channel(ch).unwrap().state, ChannelState::Unrunnable);
        assert_eq!(reg.bind_group(g, DomainId::new(1), 0), Err(Error::InvalidState));

        // Cleanup path still works
        assert_eq!(reg.detach(ch, None), Ok(Binding::Done(g)));
        assert_eq!(reg.remove_channel(ch), Ok(Binding::Done(())));
        assert!(reg.destroy_group(g).is_ok());
    }

    #[test]
    fn test_schedulable_skips_empty_groups() {
        let reg = Registry::new();
        let d = DomainId::new(1);
        let g = reg.create_group(Priority::Normal, slice());
        reg.bind_group(g, d, 10).unwrap();
        assert!(reg.schedulable(g, d).is_none());

        let ch = reg.open_channel(desc(1));
        reg.attach(ch, g, Some(d)).unwrap();
        let snap = reg.schedulable(g, d).unwrap();
        assert_eq!(snap.channels, 1);
        assert_eq!(snap.runnable_since_ns, 10);
        assert!(reg.schedulable(g, DomainId::new(2)).is_none());
    }

    #[test]
    fn test_context_lookup() {
        let reg = Registry::new();
        let a = reg.create_group(Priority::Normal, slice());
        let b = reg.create_group(Priority::Normal, slice());
        let ca = reg.open_channel(desc(0x100));
        let cb = reg.open_channel(desc(0x200));
        reg.attach(ca, a, None).unwrap();
        reg.attach(cb, b, None).unwrap();

        let hits = reg.groups_with_context(&[a, b], ContextId(0x200));
        assert_eq!(hits, alloc::vec![(b, cb)]);
        assert!(reg.groups_with_context(&[a], ContextId(0x200)).is_empty());
    }
}
