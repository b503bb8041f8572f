//! # Interrupt Handling
//!
//! Scheduler-relevant GPU interrupt sources.
//!
//! The interrupt collaborator reads and acknowledges the hardware status
//! registers; the scheduler only sees the decoded source and the raw
//! payload that came with it.

use magma_core::Result;

// =============================================================================
// INTERRUPT TYPES
// =============================================================================

/// GPU interrupt sources the scheduler consumes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum InterruptSource {
    /// Runlist fetch acknowledged
    Runlist      = 0,
    /// Preempt completed
    Preempt      = 1,
    /// MMU fault
    MmuFault     = 2,
    /// Context-switch timeout
    CtxswTimeout = 3,
}

impl InterruptSource {
    /// All sources in bit order
    pub const ALL: [InterruptSource; 4] = [
        InterruptSource::Runlist,
        InterruptSource::Preempt,
        InterruptSource::MmuFault,
        InterruptSource::CtxswTimeout,
    ];

    /// Mask bit for this source
    pub const fn mask(self) -> IrqMask {
        IrqMask::from_bits_truncate(1 << (self as u32))
    }
}

bitflags::bitflags! {
    /// Interrupt mask bits, one per [`InterruptSource`]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IrqMask: u32 {
        /// Runlist acknowledge
        const RUNLIST = 1 << 0;
        /// Preempt complete
        const PREEMPT = 1 << 1;
        /// MMU fault
        const MMU_FAULT = 1 << 2;
        /// Context-switch timeout
        const CTXSW_TIMEOUT = 1 << 3;
    }
}

/// Interrupt status
#[derive(Debug, Clone)]
pub struct InterruptStatus {
    /// Pending interrupt mask
    pub pending: IrqMask,
    /// Enabled interrupt mask
    pub enabled: IrqMask,
}

impl InterruptStatus {
    /// Check if any interrupt is pending
    pub fn has_pending(&self) -> bool {
        self.pending.intersects(self.enabled)
    }

    /// Check if specific source is pending
    pub fn is_pending(&self, source: InterruptSource) -> bool {
        (self.pending & self.enabled).contains(source.mask())
    }

    /// Iterate over pending and enabled sources
    pub fn sources(&self) -> impl Iterator<Item = InterruptSource> + '_ {
        InterruptSource::ALL
            .into_iter()
            .filter(move |source| self.is_pending(*source))
    }
}

// =============================================================================
// INTERRUPT HANDLER
// =============================================================================

/// Interrupt handler trait
///
/// Implementations must not block indefinitely: they run in interrupt or
/// bottom-half context.
pub trait InterruptHandler: Send + Sync {
    /// Handle one interrupt with its raw payload
    fn handle(&self, source: InterruptSource, payload: &[u8]) -> Result<()>;

    /// Get handled sources
    fn sources(&self) -> IrqMask;
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_masked_sources_are_not_pending() {
        let status = InterruptStatus {
            pending: IrqMask::MMU_FAULT | IrqMask::PREEMPT,
            enabled: IrqMask::MMU_FAULT,
        };
        assert!(status.has_pending());
        assert!(status.is_pending(InterruptSource::MmuFault));
        assert!(!status.is_pending(InterruptSource::Preempt));
        assert_eq!(status.sources().count(), 1);
    }

    #[test]
    fn test_source_mask_bits() {
        assert_eq!(InterruptSource::Runlist.mask(), IrqMask::RUNLIST);
        assert_eq!(InterruptSource::CtxswTimeout.mask(), IrqMask::CTXSW_TIMEOUT);
    }
}
