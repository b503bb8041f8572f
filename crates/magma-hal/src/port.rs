//! # Port Traits
//!
//! Capability providers implemented once per chip generation.

use magma_core::{
    Capability, ChannelId, ContextId, DomainId, EngineId, Error, GpuAddr, GpuGeneration, GroupId,
    Priority, Result,
};

use crate::fault::FaultRecord;

// =============================================================================
// CAPABILITIES
// =============================================================================

bitflags::bitflags! {
    /// Capabilities a port implementation provides
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PortCaps: u32 {
        /// Runlist submission
        const RUNLIST_SUBMIT = 1 << 0;
        /// Runlist pending polling
        const RUNLIST_WAIT = 1 << 1;
        /// Runlist enable/disable
        const RUNLIST_ENABLE = 1 << 2;
        /// Channel preemption
        const CHANNEL_PREEMPT = 1 << 3;
        /// Group preemption
        const GROUP_PREEMPT = 1 << 4;
        /// Fault descriptor decoding
        const FAULT_DECODE = 1 << 5;
        /// Everything the scheduler core needs
        const REQUIRED = Self::RUNLIST_SUBMIT.bits()
            | Self::CHANNEL_PREEMPT.bits()
            | Self::GROUP_PREEMPT.bits()
            | Self::FAULT_DECODE.bits();
    }
}

impl PortCaps {
    /// Map a single flag to its capability name
    fn capability(self) -> Option<Capability> {
        let cap = if self == Self::RUNLIST_SUBMIT {
            Capability::RunlistSubmit
        } else if self == Self::RUNLIST_WAIT {
            Capability::RunlistWait
        } else if self == Self::RUNLIST_ENABLE {
            Capability::RunlistEnable
        } else if self == Self::CHANNEL_PREEMPT {
            Capability::ChannelPreempt
        } else if self == Self::GROUP_PREEMPT {
            Capability::GroupPreempt
        } else if self == Self::FAULT_DECODE {
            Capability::FaultDecode
        } else {
            return None;
        };
        Some(cap)
    }

    /// Fail with the first missing capability out of `required`
    pub fn ensure(self, required: PortCaps) -> Result<()> {
        let missing = required.difference(self);
        match missing.iter().next() {
            None => Ok(()),
            Some(flag) => Err(flag
                .capability()
                .map(Error::UnsupportedOperation)
                .unwrap_or(Error::InvalidParameter)),
        }
    }
}

// =============================================================================
// RUNLIST ENTRIES
// =============================================================================

/// What one runlist entry describes on this hardware
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryGranularity {
    /// One entry per active channel
    PerChannel,
    /// One entry per non-empty group
    PerGroup,
}

/// Hardware-independent description of one runlist entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunlistEntry {
    /// A channel entry
    Channel {
        /// Channel id
        channel: ChannelId,
        /// Owning group
        group: GroupId,
        /// Instance context of the channel
        context: ContextId,
        /// Ring (pushbuffer) location
        ring: GpuAddr,
    },
    /// A group (TSG) entry
    Group {
        /// Group id
        group: GroupId,
        /// Granted time slice in microseconds
        timeslice_us: u32,
        /// Number of channels scheduled with this group
        channels: u32,
        /// Priority class
        priority: Priority,
    },
}

// =============================================================================
// PREEMPT TARGETS
// =============================================================================

/// Kind of object a preempt request targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TargetKind {
    /// A single channel
    Channel,
    /// A whole time-slice group
    Group,
}

/// Target of a preempt request
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PreemptTarget {
    /// Target kind
    pub kind: TargetKind,
    /// Raw id of the channel or group
    pub id: u64,
}

impl PreemptTarget {
    /// Target a channel
    pub const fn channel(id: ChannelId) -> Self {
        Self {
            kind: TargetKind::Channel,
            id: id.id(),
        }
    }

    /// Target a group
    pub const fn group(id: GroupId) -> Self {
        Self {
            kind: TargetKind::Group,
            id: id.id(),
        }
    }
}

// =============================================================================
// PORT TRAITS
// =============================================================================

/// Time source and delay provider
///
/// In `no_std` builds this is the platform timer; sleeping may busy-wait.
pub trait Clock {
    /// Get current time in nanoseconds
    fn time_ns(&self) -> u64;

    /// Sleep for microseconds
    fn sleep_us(&self, us: u64);
}

/// Runlist layout and submission
pub trait RunlistPort {
    /// Size in bytes of one runlist entry for `domain`
    fn runlist_entry_size(&self, domain: DomainId) -> u32;

    /// Maximum number of entries the hardware accepts for `domain`
    fn runlist_max_entries(&self, domain: DomainId) -> u32;

    /// Whether entries are written per channel or per group
    fn entry_granularity(&self, domain: DomainId) -> EntryGranularity;

    /// Encode one entry into `out` (exactly `runlist_entry_size` bytes)
    fn encode_entry(&self, entry: &RunlistEntry, out: &mut [u8]) -> Result<()>;

    /// Point the engine at `buffer` and request a reload
    fn runlist_submit(
        &self,
        domain: DomainId,
        engine: EngineId,
        buffer: &[u8],
        entries: u32,
    ) -> Result<()>;

    /// Whether the last submitted runlist is still being fetched
    fn runlist_is_pending(&self, domain: DomainId) -> bool;

    /// Enable or disable scheduling of the domain's runlist
    fn runlist_set_enabled(&self, domain: DomainId, enabled: bool) -> Result<()>;
}

/// Preemption trigger and completion polling
pub trait PreemptPort {
    /// Issue the hardware preempt command
    fn preempt_trigger(&self, target: PreemptTarget) -> Result<()>;

    /// Whether the preempt issued for `target` is still in progress
    fn preempt_is_pending(&self, target: PreemptTarget) -> bool;

    /// Decode a preempt-complete interrupt payload
    fn decode_preempt_done(&self, raw: &[u8]) -> Result<PreemptTarget>;
}

/// MMU fault descriptor decoding
pub trait FaultPort {
    /// Decode a raw fault interrupt payload
    fn decode_fault(&self, raw: &[u8]) -> Result<FaultRecord>;
}

/// Complete hardware port for one chip generation
pub trait HalPort: RunlistPort + PreemptPort + FaultPort + Clock + Send + Sync {
    /// Get port name
    fn name(&self) -> &'static str;

    /// Get the chip generation served by this port
    fn generation(&self) -> GpuGeneration;

    /// Get the capabilities this port implements
    fn capabilities(&self) -> PortCaps;
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_caps_ensure_reports_first_missing() {
        let caps = PortCaps::RUNLIST_SUBMIT | PortCaps::CHANNEL_PREEMPT | PortCaps::FAULT_DECODE;
        assert_eq!(
            caps.ensure(PortCaps::REQUIRED),
            Err(Error::UnsupportedOperation(Capability::GroupPreempt))
        );
        assert!(PortCaps::all().ensure(PortCaps::REQUIRED).is_ok());
    }

    #[test]
    fn test_preempt_target_constructors() {
        let ch = PreemptTarget::channel(ChannelId::new(4));
        let tsg = PreemptTarget::group(GroupId::new(4));
        assert_eq!(ch.kind, TargetKind::Channel);
        assert_eq!(tsg.kind, TargetKind::Group);
        assert_ne!(ch, tsg);
    }
}
