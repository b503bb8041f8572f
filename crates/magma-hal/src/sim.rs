//! # Simulated Port
//!
//! A software model of the runlist, preempt and fault hardware.
//!
//! Time is virtual: `sleep_us` advances the port clock instead of waiting,
//! so timeout paths run instantly. Preempts finish after a configurable
//! number of completion polls (or never), and every runlist submission is
//! recorded for inspection.
//!
//! Fault payloads use a fixed 24-byte layout:
//!
//! ```text
//! u32 engine | u8 class (0 = recoverable, 1 = fatal) | 3 pad | u64 context | u64 address
//! ```
//!
//! Preempt-complete payloads are 16 bytes: `u8 kind (0 = channel, 1 = group) | 7 pad | u64 id`.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use magma_core::{
    ContextId, DomainId, EngineId, Error, GpuAddr, GpuGeneration, Result,
};
use spin::Mutex;

use crate::fault::{FaultClass, FaultRecord};
use crate::format::{DecodedEntry, RunlistFormat};
use crate::port::{
    Clock, EntryGranularity, FaultPort, HalPort, PortCaps, PreemptPort, PreemptTarget,
    RunlistEntry, RunlistPort, TargetKind,
};

/// Size of a simulated fault payload
pub const FAULT_PAYLOAD_SIZE: usize = 24;
/// Size of a simulated preempt-complete payload
pub const PREEMPT_PAYLOAD_SIZE: usize = 16;

// =============================================================================
// RECORDED STATE
// =============================================================================

/// One runlist submission observed by the simulated hardware
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    /// Domain submitted
    pub domain: DomainId,
    /// Engine reloaded
    pub engine: EngineId,
    /// Copy of the buffer contents
    pub bytes: Vec<u8>,
    /// Entry count
    pub entries: u32,
}

#[derive(Debug, Default)]
struct SimState {
    submissions: Vec<Submission>,
    triggers: Vec<PreemptTarget>,
    /// Remaining completion polls per in-flight preempt (`None` = never)
    in_flight: BTreeMap<PreemptTarget, Option<u32>>,
    runlist_pending: BTreeMap<DomainId, u32>,
    enabled: BTreeMap<DomainId, bool>,
}

// =============================================================================
// SIM PORT
// =============================================================================

/// Simulated hardware port
#[derive(Debug)]
pub struct SimPort {
    generation: GpuGeneration,
    format: RunlistFormat,
    caps: PortCaps,
    default_max_entries: u32,
    max_entries: BTreeMap<DomainId, u32>,
    preempt_latency: Option<u32>,
    runlist_latency: u32,
    clock_ns: AtomicU64,
    state: Mutex<SimState>,
}

impl SimPort {
    /// Create a port for `generation` with its native entry format
    pub fn new(generation: GpuGeneration) -> Self {
        Self {
            generation,
            format: RunlistFormat::for_generation(generation),
            caps: PortCaps::all(),
            default_max_entries: 64,
            max_entries: BTreeMap::new(),
            preempt_latency: Some(0),
            runlist_latency: 0,
            clock_ns: AtomicU64::new(0),
            state: Mutex::new(SimState::default()),
        }
    }

    /// Override the entry format
    pub fn with_format(mut self, format: RunlistFormat) -> Self {
        self.format = format;
        self
    }

    /// Set the entry limit for every domain
    pub fn with_max_entries(mut self, max: u32) -> Self {
        self.default_max_entries = max;
        self
    }

    /// Set the entry limit for one domain
    pub fn with_domain_max_entries(mut self, domain: DomainId, max: u32) -> Self {
        self.max_entries.insert(domain, max);
        self
    }

    /// Number of pending polls before a preempt completes (`None` = never)
    pub fn with_preempt_latency(mut self, polls: Option<u32>) -> Self {
        self.preempt_latency = polls;
        self
    }

    /// Number of pending polls before a runlist submission is acknowledged
    pub fn with_runlist_latency(mut self, polls: u32) -> Self {
        self.runlist_latency = polls;
        self
    }

    /// Remove capabilities
    pub fn without(mut self, caps: PortCaps) -> Self {
        self.caps.remove(caps);
        self
    }

    /// Entry format in use
    pub fn format(&self) -> RunlistFormat {
        self.format
    }

    /// All submissions so far
    pub fn submissions(&self) -> Vec<Submission> {
        self.state.lock().submissions.clone()
    }

    /// Last submission for a domain
    pub fn last_submission(&self, domain: DomainId) -> Option<Submission> {
        self.state
            .lock()
            .submissions
            .iter()
            .rev()
            .find(|s| s.domain == domain)
            .cloned()
    }

    /// Decode a submitted buffer into entry identities
    pub fn decode_buffer(&self, bytes: &[u8]) -> Result<Vec<DecodedEntry>> {
        let size = self.format.entry_size() as usize;
        bytes
            .chunks(size)
            .map(|chunk| self.format.decode(chunk))
            .collect()
    }

    /// Every preempt trigger issued so far
    pub fn preempt_triggers(&self) -> Vec<PreemptTarget> {
        self.state.lock().triggers.clone()
    }

    /// Finish an in-flight preempt immediately
    pub fn complete_preempt(&self, target: PreemptTarget) {
        self.state.lock().in_flight.remove(&target);
    }

    /// Whether the domain's runlist is currently enabled
    pub fn is_enabled(&self, domain: DomainId) -> bool {
        self.state.lock().enabled.get(&domain).copied().unwrap_or(true)
    }

    /// Build a fault payload
    pub fn fault_payload(
        engine: EngineId,
        context: ContextId,
        address: GpuAddr,
        class: FaultClass,
    ) -> [u8; FAULT_PAYLOAD_SIZE] {
        let mut raw = [0u8; FAULT_PAYLOAD_SIZE];
        raw[0..4].copy_from_slice(&engine.0.to_le_bytes());
        raw[4] = match class {
            FaultClass::Recoverable => 0,
            FaultClass::Fatal => 1,
        };
        raw[8..16].copy_from_slice(&context.0.to_le_bytes());
        raw[16..24].copy_from_slice(&address.raw().to_le_bytes());
        raw
    }

    /// Build a preempt-complete payload
    pub fn preempt_done_payload(target: PreemptTarget) -> [u8; PREEMPT_PAYLOAD_SIZE] {
        let mut raw = [0u8; PREEMPT_PAYLOAD_SIZE];
        raw[0] = match target.kind {
            TargetKind::Channel => 0,
            TargetKind::Group => 1,
        };
        raw[8..16].copy_from_slice(&target.id.to_le_bytes());
        raw
    }
}

fn read_u64(raw: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&raw[at..at + 8]);
    u64::from_le_bytes(bytes)
}

// =============================================================================
// PORT IMPLEMENTATION
// =============================================================================

impl Clock for SimPort {
    fn time_ns(&self) -> u64 {
        self.clock_ns.load(Ordering::Acquire)
    }

    fn sleep_us(&self, us: u64) {
        self.clock_ns.fetch_add(us.saturating_mul(1000), Ordering::AcqRel);
        core::hint::spin_loop();
    }
}

impl RunlistPort for SimPort {
    fn runlist_entry_size(&self, _domain: DomainId) -> u32 {
        self.format.entry_size()
    }

    fn runlist_max_entries(&self, domain: DomainId) -> u32 {
        self.max_entries
            .get(&domain)
            .copied()
            .unwrap_or(self.default_max_entries)
    }

    fn entry_granularity(&self, _domain: DomainId) -> EntryGranularity {
        self.format.granularity()
    }

    fn encode_entry(&self, entry: &RunlistEntry, out: &mut [u8]) -> Result<()> {
        self.format.encode(entry, out)
    }

    fn runlist_submit(
        &self,
        domain: DomainId,
        engine: EngineId,
        buffer: &[u8],
        entries: u32,
    ) -> Result<()> {
        if !self.caps.contains(PortCaps::RUNLIST_SUBMIT) {
            return Err(Error::HardwareError);
        }
        log::trace!("Sim: {} submit {} entries to {}", domain, entries, engine);
        let mut state = self.state.lock();
        state.submissions.push(Submission {
            domain,
            engine,
            bytes: buffer.to_vec(),
            entries,
        });
        state.runlist_pending.insert(domain, self.runlist_latency);
        Ok(())
    }

    fn runlist_is_pending(&self, domain: DomainId) -> bool {
        let mut state = self.state.lock();
        match state.runlist_pending.get_mut(&domain) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            },
            _ => false,
        }
    }

    fn runlist_set_enabled(&self, domain: DomainId, enabled: bool) -> Result<()> {
        self.state.lock().enabled.insert(domain, enabled);
        Ok(())
    }
}

impl PreemptPort for SimPort {
    fn preempt_trigger(&self, target: PreemptTarget) -> Result<()> {
        log::trace!("Sim: preempt {:?}", target);
        let mut state = self.state.lock();
        state.triggers.push(target);
        state.in_flight.insert(target, self.preempt_latency);
        Ok(())
    }

    fn preempt_is_pending(&self, target: PreemptTarget) -> bool {
        let mut state = self.state.lock();
        match state.in_flight.get_mut(&target) {
            None => false,
            Some(None) => true,
            Some(Some(0)) => {
                state.in_flight.remove(&target);
                false
            },
            Some(Some(remaining)) => {
                *remaining -= 1;
                true
            },
        }
    }

    fn decode_preempt_done(&self, raw: &[u8]) -> Result<PreemptTarget> {
        if raw.len() < PREEMPT_PAYLOAD_SIZE {
            return Err(Error::HardwareError);
        }
        let kind = match raw[0] {
            0 => TargetKind::Channel,
            1 => TargetKind::Group,
            _ => return Err(Error::HardwareError),
        };
        Ok(PreemptTarget {
            kind,
            id: read_u64(raw, 8),
        })
    }
}

impl FaultPort for SimPort {
    fn decode_fault(&self, raw: &[u8]) -> Result<FaultRecord> {
        if raw.len() < FAULT_PAYLOAD_SIZE {
            return Err(Error::HardwareError);
        }
        let engine = EngineId(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]));
        let class = match raw[4] {
            0 => FaultClass::Recoverable,
            1 => FaultClass::Fatal,
            _ => return Err(Error::HardwareError),
        };
        Ok(FaultRecord::new(
            engine,
            ContextId(read_u64(raw, 8)),
            GpuAddr::new(read_u64(raw, 16)),
            class,
        ))
    }
}

impl HalPort for SimPort {
    fn name(&self) -> &'static str {
        "sim"
    }

    fn generation(&self) -> GpuGeneration {
        self.generation
    }

    fn capabilities(&self) -> PortCaps {
        self.caps
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use magma_core::{ChannelId, GroupId};

    use super::*;

    #[test]
    fn test_preempt_completes_after_latency() {
        let port = SimPort::new(GpuGeneration::Volta).with_preempt_latency(Some(2));
        let target = PreemptTarget::group(GroupId::new(1));
        port.preempt_trigger(target).unwrap();
        assert!(port.preempt_is_pending(target));
        assert!(port.preempt_is_pending(target));
        assert!(!port.preempt_is_pending(target));
        assert!(!port.preempt_is_pending(target));
    }

    #[test]
    fn test_never_completing_preempt() {
        let port = SimPort::new(GpuGeneration::Volta).with_preempt_latency(None);
        let target = PreemptTarget::channel(ChannelId::new(3));
        port.preempt_trigger(target).unwrap();
        for _ in 0..100 {
            assert!(port.preempt_is_pending(target));
        }
        port.complete_preempt(target);
        assert!(!port.preempt_is_pending(target));
    }

    #[test]
    fn test_fault_payload_decodes() {
        let port = SimPort::new(GpuGeneration::Turing);
        let raw = SimPort::fault_payload(
            EngineId(2),
            ContextId(0x8000),
            GpuAddr::new(0xdead_0000),
            FaultClass::Fatal,
        );
        let record = port.decode_fault(&raw).unwrap();
        assert_eq!(record.engine, EngineId(2));
        assert_eq!(record.context, ContextId(0x8000));
        assert!(record.is_fatal());
        assert!(!record.is_attributed());
        assert!(port.decode_fault(&raw[..10]).is_err());
    }

    #[test]
    fn test_preempt_payload_decodes() {
        let port = SimPort::new(GpuGeneration::Turing);
        let target = PreemptTarget::group(GroupId::new(77));
        let raw = SimPort::preempt_done_payload(target);
        assert_eq!(port.decode_preempt_done(&raw).unwrap(), target);
    }

    #[test]
    fn test_sleep_advances_virtual_clock() {
        let port = SimPort::new(GpuGeneration::Pascal);
        assert_eq!(port.time_ns(), 0);
        port.sleep_us(5);
        assert_eq!(port.time_ns(), 5_000);
    }
}
