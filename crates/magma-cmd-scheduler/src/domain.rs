//! # Runlist Domains
//!
//! A domain feeds one engine's runlist. Its lock is the single
//! serialization point for the active set, the runlist buffer swap, policy
//! state and the preempt requests issued for its groups and channels.
//!
//! ```text
//!   Domain ── Mutex<DomainState>
//!               ├── active   [tsg#1, tsg#4, ...]   bind order
//!               ├── buffers  live ◀─swap─▶ staged
//!               ├── preempts {target → request}
//!               ├── policy   Box<dyn SchedulingPolicy>
//!               └── enabled
//! ```

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use magma_core::{DomainId, EngineId, EngineType, GroupId};
use magma_hal::PreemptTarget;
use spin::Mutex;

use crate::policy::SchedulingPolicy;
use crate::preempt::PreemptRequest;

// =============================================================================
// RUNLIST BUFFERS
// =============================================================================

/// Double-buffered runlist storage
///
/// Only `live` is ever handed to hardware. The builder encodes into
/// `staged` and swaps the two under the domain lock.
#[derive(Debug, Default)]
pub(crate) struct RunlistBuffers {
    /// Buffer last submitted to hardware
    pub live: Vec<u8>,
    /// Scratch buffer for the next runlist
    pub staged: Vec<u8>,
    /// Entries in `live`
    pub live_entries: u32,
    /// Groups encoded in `live`, in runlist order
    pub live_order: Vec<GroupId>,
    /// Number of successful swaps
    pub generation: u64,
}

impl RunlistBuffers {
    /// Exchange live and staged
    pub fn swap(&mut self) {
        core::mem::swap(&mut self.live, &mut self.staged);
    }
}

// =============================================================================
// DOMAIN STATE
// =============================================================================

/// Everything guarded by the domain lock
pub(crate) struct DomainState {
    /// Bound groups in bind order
    pub active: Vec<GroupId>,
    /// Runlist buffers
    pub buffers: RunlistBuffers,
    /// Preempt requests that have not reached a terminal state
    pub preempts: BTreeMap<PreemptTarget, PreemptRequest>,
    /// Ordering and time-budget policy
    pub policy: Box<dyn SchedulingPolicy>,
    /// Whether rebuilds reach hardware
    pub enabled: bool,
}

impl core::fmt::Debug for DomainState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DomainState")
            .field("active", &self.active)
            .field("live_entries", &self.buffers.live_entries)
            .field("generation", &self.buffers.generation)
            .field("preempts", &self.preempts.len())
            .field("policy", &self.policy.name())
            .field("enabled", &self.enabled)
            .finish()
    }
}

// =============================================================================
// DOMAIN
// =============================================================================

/// Per-domain runlist counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunlistStats {
    /// Successful rebuilds
    pub rebuilds: u64,
    /// Rebuilds rejected for capacity
    pub exhausted: u64,
    /// Rebuilds failed by hardware or policy
    pub failures: u64,
}

#[derive(Debug, Default)]
pub(crate) struct RunlistCounters {
    pub rebuilds: AtomicU64,
    pub exhausted: AtomicU64,
    pub failures: AtomicU64,
}

impl RunlistCounters {
    pub fn snapshot(&self) -> RunlistStats {
        RunlistStats {
            rebuilds: self.rebuilds.load(Ordering::Relaxed),
            exhausted: self.exhausted.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

/// A runlist domain
#[derive(Debug)]
pub struct Domain {
    /// Domain id
    pub id: DomainId,
    /// Engine fed by this domain
    pub engine: EngineId,
    /// Engine type
    pub engine_type: EngineType,
    pub(crate) state: Mutex<DomainState>,
    pub(crate) counters: RunlistCounters,
}

impl Domain {
    pub(crate) fn new(
        id: DomainId,
        engine: EngineId,
        engine_type: EngineType,
        policy: Box<dyn SchedulingPolicy>,
    ) -> Self {
        Self {
            id,
            engine,
            engine_type,
            state: Mutex::new(DomainState {
                active: Vec::new(),
                buffers: RunlistBuffers::default(),
                preempts: BTreeMap::new(),
                policy,
                enabled: true,
            }),
            counters: RunlistCounters::default(),
        }
    }

    /// Runlist counters
    pub fn stats(&self) -> RunlistStats {
        self.counters.snapshot()
    }
}

static_assertions::assert_impl_all!(Domain: Send, Sync);
