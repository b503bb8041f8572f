//! # MAGMA Error Handling
//!
//! Error taxonomy for the command-submission scheduler.
//!
//! Error handling in MAGMA follows these principles:
//! - Operational failures are typed and returned, never panicked on
//! - Invariant violations are programming errors and abort instead
//! - Errors are `Copy` and `no_std` compatible

use core::fmt;

// =============================================================================
// RESULT TYPE
// =============================================================================

/// MAGMA Result type alias
pub type Result<T> = core::result::Result<T, Error>;

// =============================================================================
// ERROR ENUM
// =============================================================================

/// MAGMA unified error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    // =========================================================================
    // Generic Errors
    // =========================================================================
    /// Invalid parameter provided
    InvalidParameter,
    /// Resource not found
    NotFound,
    /// Operation timed out
    Timeout,
    /// Resource is busy (still bound or still has members)
    Busy,
    /// Object is in a state that does not allow the operation
    InvalidState,

    // =========================================================================
    // Binding Errors
    // =========================================================================
    /// Channel or group is already bound
    AlreadyBound,
    /// Channel or group is not bound
    NotBound,

    // =========================================================================
    // Scheduling Errors
    // =========================================================================
    /// Active set would exceed the hardware runlist capacity
    ResourceExhausted,
    /// A preempt request for the target is already in flight
    AlreadyPending,
    /// Runlist domain is disabled
    DomainDisabled,
    /// Scheduling policy returned something other than a permutation
    InvalidPolicyOrder,
    /// Bounded queue is full
    QueueFull,

    // =========================================================================
    // Hardware Errors
    // =========================================================================
    /// The hardware port lacks a capability for this chip generation
    UnsupportedOperation(Capability),
    /// Hardware rejected an access or reported a malformed payload
    HardwareError,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            // Generic
            Self::InvalidParameter => write!(f, "invalid parameter"),
            Self::NotFound => write!(f, "resource not found"),
            Self::Timeout => write!(f, "operation timed out"),
            Self::Busy => write!(f, "resource busy"),
            Self::InvalidState => write!(f, "invalid state for operation"),

            // Binding
            Self::AlreadyBound => write!(f, "already bound"),
            Self::NotBound => write!(f, "not bound"),

            // Scheduling
            Self::ResourceExhausted => write!(f, "runlist capacity exhausted"),
            Self::AlreadyPending => write!(f, "preempt already pending"),
            Self::DomainDisabled => write!(f, "runlist domain disabled"),
            Self::InvalidPolicyOrder => write!(f, "policy returned an invalid order"),
            Self::QueueFull => write!(f, "queue full"),

            // Hardware
            Self::UnsupportedOperation(cap) => write!(f, "unsupported operation: {}", cap),
            Self::HardwareError => write!(f, "hardware error"),
        }
    }
}

// =============================================================================
// SUB-ERROR TYPES
// =============================================================================

/// Hardware capabilities the scheduler may require from a port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Runlist submission
    RunlistSubmit,
    /// Runlist pending/acknowledge polling
    RunlistWait,
    /// Runlist enable/disable
    RunlistEnable,
    /// Channel preemption
    ChannelPreempt,
    /// Group (TSG) preemption
    GroupPreempt,
    /// MMU fault descriptor decoding
    FaultDecode,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::RunlistSubmit => "runlist submit",
            Self::RunlistWait => "runlist wait",
            Self::RunlistEnable => "runlist enable",
            Self::ChannelPreempt => "channel preempt",
            Self::GroupPreempt => "group preempt",
            Self::FaultDecode => "fault decode",
        };
        f.write_str(name)
    }
}

// =============================================================================
// ERROR CONVERSION
// =============================================================================

impl From<Capability> for Error {
    fn from(cap: Capability) -> Self {
        Error::UnsupportedOperation(cap)
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    extern crate alloc;

    use alloc::string::ToString;

    use super::*;

    #[test]
    fn test_display_names_capability() {
        let err: Error = Capability::GroupPreempt.into();
        assert_eq!(err.to_string(), "unsupported operation: group preempt");
    }

    #[test]
    fn test_errors_are_comparable() {
        assert_eq!(Error::ResourceExhausted, Error::ResourceExhausted);
        assert_ne!(Error::Timeout, Error::AlreadyPending);
    }
}
