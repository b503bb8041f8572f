//! # MAGMA Core Types
//!
//! Fundamental type definitions used across the scheduler stack.
//!
//! These types provide:
//! - Strong typing for scheduler object identifiers
//! - Hardware-side identifiers (engines, address-space contexts)
//! - Priority classes and GPU generations

use core::cmp::Ordering;
use core::fmt;
use core::hash::{Hash, Hasher};
use core::marker::PhantomData;

// =============================================================================
// GPU ADDRESS
// =============================================================================

/// GPU Virtual Address
///
/// This is an address in the GPU's virtual address space.
/// It is NOT a CPU pointer and cannot be dereferenced directly.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct GpuAddr(u64);

impl GpuAddr {
    /// Create a new GPU address
    #[inline]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Create a null GPU address
    #[inline]
    pub const fn null() -> Self {
        Self(0)
    }

    /// Get the raw u64 value
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Check if null
    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for GpuAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GpuAddr(0x{:016x})", self.0)
    }
}

impl fmt::Display for GpuAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016x}", self.0)
    }
}

// =============================================================================
// HANDLE TYPES
// =============================================================================

/// Marker trait naming the kind of object a [`Handle`] refers to
pub trait HandleKind {
    /// Short prefix used when formatting handles
    const PREFIX: &'static str;
}

/// Opaque handle to a scheduler object
///
/// Handles are type-safe wrappers that prevent mixing different object
/// kinds. Handle `0` is reserved as null; allocators start at `1`.
#[repr(transparent)]
pub struct Handle<T> {
    id: u64,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    /// Create a new handle
    #[inline]
    pub const fn new(id: u64) -> Self {
        Self {
            id,
            _marker: PhantomData,
        }
    }

    /// Create a null handle
    #[inline]
    pub const fn null() -> Self {
        Self::new(0)
    }

    /// Get the raw ID
    #[inline]
    pub const fn id(self) -> u64 {
        self.id
    }

    /// Check if null
    #[inline]
    pub const fn is_null(self) -> bool {
        self.id == 0
    }
}

// Manual impls: derives would put bounds on the marker type.
impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T> Eq for Handle<T> {}

impl<T> PartialOrd for Handle<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Handle<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.id.cmp(&other.id)
    }
}

impl<T> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl<T: HandleKind> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", T::PREFIX, self.id)
    }
}

impl<T: HandleKind> fmt::Display for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// Marker types for handles
/// Marker for channel handle
pub struct ChannelMarker;
/// Marker for time-slice group handle
pub struct GroupMarker;
/// Marker for runlist domain handle
pub struct DomainMarker;

impl HandleKind for ChannelMarker {
    const PREFIX: &'static str = "ch";
}

impl HandleKind for GroupMarker {
    const PREFIX: &'static str = "tsg";
}

impl HandleKind for DomainMarker {
    const PREFIX: &'static str = "rl";
}

/// Handle to a submission channel
pub type ChannelId = Handle<ChannelMarker>;
/// Handle to a time-slice group
pub type GroupId = Handle<GroupMarker>;
/// Handle to a runlist domain
pub type DomainId = Handle<DomainMarker>;

// =============================================================================
// HARDWARE IDENTIFIERS
// =============================================================================

/// Hardware engine identifier (index in the chip's engine table)
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct EngineId(pub u32);

impl fmt::Debug for EngineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "engine#{}", self.0)
    }
}

impl fmt::Display for EngineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Address-space context of a channel as reported by the MMU
///
/// This is the channel's instance block pointer; the MMU names the faulting
/// context with it.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct ContextId(pub u64);

impl ContextId {
    /// Context value meaning "no context reported"
    pub const NONE: Self = Self(0);

    /// Check if no context was reported
    #[inline]
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx(0x{:x})", self.0)
    }
}

// =============================================================================
// PRIORITY
// =============================================================================

/// Group priority class
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum Priority {
    /// Low priority (background work)
    Low      = 0,
    /// Normal priority (default)
    #[default]
    Normal   = 1,
    /// High priority (interactive)
    High     = 2,
    /// Realtime priority (display, VR)
    Realtime = 3,
}

impl Priority {
    /// Relative share used by weighted policies
    #[inline]
    pub const fn weight(self) -> u32 {
        match self {
            Self::Low => 1,
            Self::Normal => 2,
            Self::High => 4,
            Self::Realtime => 8,
        }
    }
}

// =============================================================================
// ENGINE TYPE
// =============================================================================

/// GPU engine type served by a runlist
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineType {
    /// 3D Graphics engine (GR)
    Graphics,
    /// Compute engine
    Compute,
    /// Copy engine (CE/DMA)
    Copy,
    /// Video decode
    VideoDecode,
    /// Video encode
    VideoEncode,
}

// =============================================================================
// GPU GENERATION
// =============================================================================

/// NVIDIA GPU generation/architecture
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u32)]
pub enum GpuGeneration {
    /// Kepler (GK104)
    Kepler    = 0xE0,
    /// Maxwell (GM204)
    Maxwell   = 0x110,
    /// Pascal (GP104)
    Pascal    = 0x130,
    /// Volta (GV100)
    Volta     = 0x140,
    /// Turing (TU104)
    Turing    = 0x160,
    /// Ampere (GA102)
    Ampere    = 0x170,
    /// Ada Lovelace (AD102)
    Ada       = 0x190,
}

impl GpuGeneration {
    /// Check if runlist entries carry a full 64-bit instance pointer
    #[inline]
    pub const fn has_wide_runlist_entries(self) -> bool {
        matches!(self, Self::Volta | Self::Turing | Self::Ampere | Self::Ada)
    }
}

// =============================================================================
// STATIC ASSERTIONS
// =============================================================================

static_assertions::assert_impl_all!(GpuAddr: Send, Sync, Copy);
static_assertions::assert_impl_all!(ChannelId: Send, Sync, Copy, Ord);
static_assertions::assert_impl_all!(GroupId: Send, Sync, Copy, Ord);
static_assertions::assert_impl_all!(DomainId: Send, Sync, Copy, Ord);

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    extern crate alloc;

    use alloc::format;

    use super::*;

    #[test]
    fn test_handles_order_by_id() {
        let a = GroupId::new(2);
        let b = GroupId::new(7);
        assert!(a < b);
        assert_eq!(a, GroupId::new(2));
        assert!(GroupId::null().is_null());
    }

    #[test]
    fn test_handle_formatting() {
        assert_eq!(format!("{}", ChannelId::new(3)), "ch#3");
        assert_eq!(format!("{:?}", GroupId::new(12)), "tsg#12");
        assert_eq!(format!("{}", DomainId::new(1)), "rl#1");
    }

    #[test]
    fn test_priority_order_and_weight() {
        assert!(Priority::Realtime > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
        assert_eq!(Priority::default(), Priority::Normal);
        assert!(Priority::High.weight() > Priority::Low.weight());
    }

    #[test]
    fn test_context_none() {
        assert!(ContextId::NONE.is_none());
        assert!(!ContextId(0x1000).is_none());
    }
}
