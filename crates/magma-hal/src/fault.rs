//! # Fault Records
//!
//! Decoded MMU fault descriptors.

use magma_core::{ChannelId, ContextId, EngineId, GpuAddr, GroupId};

// =============================================================================
// FAULT CLASS
// =============================================================================

/// Severity of an MMU fault
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultClass {
    /// Fault confined to the faulting context
    Recoverable,
    /// Fault that leaves the engine in an unknown state
    Fatal,
}

// =============================================================================
// FAULT RECORD
// =============================================================================

/// A single MMU fault
///
/// The port fills in the hardware fields. `channel` and `group` stay `None`
/// until the scheduler attributes the fault to a unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultRecord {
    /// Engine that raised the fault
    pub engine: EngineId,
    /// Faulting address-space context
    pub context: ContextId,
    /// Faulting GPU virtual address
    pub address: GpuAddr,
    /// Fault severity
    pub class: FaultClass,
    /// Resolved faulting channel
    pub channel: Option<ChannelId>,
    /// Resolved faulting group
    pub group: Option<GroupId>,
}

impl FaultRecord {
    /// Create an unresolved record
    pub const fn new(engine: EngineId, context: ContextId, address: GpuAddr, class: FaultClass) -> Self {
        Self {
            engine,
            context,
            address,
            class,
            channel: None,
            group: None,
        }
    }

    /// Whether the fault has been attributed to a group
    pub const fn is_attributed(&self) -> bool {
        self.group.is_some()
    }

    /// Whether the fault is engine-fatal
    pub fn is_fatal(&self) -> bool {
        self.class == FaultClass::Fatal
    }
}
