//! # Fault Coordinator
//!
//! Attributes MMU faults to a time-slice group and isolates it.
//!
//! ## Pipeline
//!
//! ```text
//!   MMU fault IRQ ──▶ port.decode_fault ──▶ FaultQueue (bounded)
//!                                               │
//!                                        FaultWorker::process_pending
//!                                               │
//!                                       Scheduler::handle_fault
//!                                               │
//!                        ┌──────────────────────┴──────────────────┐
//!                        ▼                                         ▼
//!               one group owns the context            fatal / unattributed /
//!               IsolateGroup: drop from active        ambiguous context
//!               set, mark unrunnable, rebuild         ResetEngine
//!                        │                                         │
//!                        └──────────────▶ FaultSink ◀──────────────┘
//! ```
//!
//! Isolation happens under the lock of every domain fed by the faulting
//! engine, taken in ascending id order, so it serializes with rebuilds and
//! preempt bookkeeping on those domains. No other path holds two domain
//! locks at once.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use magma_core::{DomainId, EngineId, GroupId, Result};
use magma_hal::{Clock, FaultRecord, HalPort};

use crate::domain::Domain;
use crate::fault_queue::FaultQueue;
use crate::registry::Registry;
use crate::runlist;
use crate::scheduler::Scheduler;

// =============================================================================
// FAULT ACTION
// =============================================================================

/// Recovery decided for a fault
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultAction {
    /// The group was removed from its domain and marked unrunnable
    IsolateGroup(GroupId),
    /// The engine must be reset by the caller
    ResetEngine(EngineId),
}

/// Receiver of fault actions (the caller's cleanup path)
pub trait FaultSink: Send {
    /// Handle one decided action
    fn on_fault_action(&self, action: FaultAction, record: &FaultRecord);
}

impl<F> FaultSink for F
where
    F: Fn(FaultAction, &FaultRecord) + Send,
{
    fn on_fault_action(&self, action: FaultAction, record: &FaultRecord) {
        self(action, record)
    }
}

// =============================================================================
// STATISTICS
// =============================================================================

/// Fault counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FaultStats {
    /// Faults handled
    pub received: u64,
    /// Groups isolated
    pub isolated: u64,
    /// Engine resets requested
    pub resets: u64,
    /// Faults dropped on a full queue
    pub overflows: u64,
    /// Faults waiting in the queue
    pub queued: usize,
}

#[derive(Debug, Default)]
struct FaultCounters {
    received: AtomicU64,
    isolated: AtomicU64,
    resets: AtomicU64,
}

// =============================================================================
// COORDINATOR
// =============================================================================

/// Fault queue and isolation logic
#[derive(Debug)]
pub(crate) struct FaultCoordinator {
    queue: FaultQueue,
    counters: FaultCounters,
}

impl FaultCoordinator {
    pub fn new(queue_depth: usize) -> Self {
        Self {
            queue: FaultQueue::new(queue_depth),
            counters: FaultCounters::default(),
        }
    }

    /// Hand a decoded record to the worker
    pub fn enqueue(&self, record: FaultRecord) -> Result<()> {
        self.queue.push(record).inspect_err(|_| {
            log::error!(
                "Fault: queue full, dropping fault on {} at {}",
                record.engine,
                record.address
            );
        })
    }

    /// Next queued record
    pub fn next(&self) -> Option<FaultRecord> {
        self.queue.pop()
    }

    /// Decide and apply the recovery for one fault
    ///
    /// Returns the action and the record with the faulting channel and
    /// group filled in when attributed.
    pub fn resolve<P: HalPort + ?Sized>(
        &self,
        port: &P,
        registry: &Registry,
        domains: &BTreeMap<DomainId, Domain>,
        mut record: FaultRecord,
    ) -> (FaultAction, FaultRecord) {
        self.counters.received.fetch_add(1, Ordering::Relaxed);

        if record.is_fatal() {
            return self.reset(record, "fatal fault");
        }
        if record.context.is_none() {
            return self.reset(record, "no faulting context");
        }

        // Ascending domain id order
        let mut locked: Vec<_> = domains
            .values()
            .filter(|d| d.engine == record.engine)
            .map(|d| (d, d.state.lock()))
            .collect();
        if locked.is_empty() {
            return self.reset(record, "no domain on engine");
        }

        let mut hits = Vec::new();
        for (index, (_, state)) in locked.iter().enumerate() {
            for (group, channel) in registry.groups_with_context(&state.active, record.context) {
                hits.push((index, group, channel));
            }
        }

        let (index, group, channel) = match hits.as_slice() {
            [hit] => *hit,
            [] => return self.reset(record, "context not on any runlist"),
            _ => {
                log::warn!(
                    "Fault: {:?} matches {} groups on {}",
                    record.context,
                    hits.len(),
                    record.engine
                );
                return self.reset(record, "ambiguous context");
            },
        };

        let (domain, state) = &mut locked[index];
        let domain: &Domain = domain;
        state.active.retain(|&g| g != group);
        state.policy.forget(group);
        let channels = registry.isolate(group);

        if state.enabled {
            if let Err(err) = runlist::rebuild(port, registry, domain, &mut **state) {
                log::error!("Fault: rebuild of {} after isolating {} failed: {}", domain.id, group, err);
            }
        }
        drop(locked);

        self.counters.isolated.fetch_add(1, Ordering::Relaxed);
        log::warn!(
            "Fault: isolated {} ({} channels) after fault at {} on {}",
            group,
            channels.len(),
            record.address,
            record.engine
        );

        record.group = Some(group);
        record.channel = Some(channel);
        (FaultAction::IsolateGroup(group), record)
    }

    fn reset(&self, record: FaultRecord, reason: &str) -> (FaultAction, FaultRecord) {
        self.counters.resets.fetch_add(1, Ordering::Relaxed);
        log::error!(
            "Fault: {} on {} at {}, engine reset required",
            reason,
            record.engine,
            record.address
        );
        (FaultAction::ResetEngine(record.engine), record)
    }

    pub fn stats(&self) -> FaultStats {
        let queue = self.queue.stats();
        FaultStats {
            received: self.counters.received.load(Ordering::Relaxed),
            isolated: self.counters.isolated.load(Ordering::Relaxed),
            resets: self.counters.resets.load(Ordering::Relaxed),
            overflows: queue.overflows,
            queued: queue.len,
        }
    }
}

// =============================================================================
// WORKER
// =============================================================================

/// Drains the fault queue outside interrupt context
pub struct FaultWorker<P: HalPort, S: FaultSink> {
    scheduler: Arc<Scheduler<P>>,
    sink: S,
}

impl<P: HalPort, S: FaultSink> FaultWorker<P, S> {
    /// Create a worker delivering actions to `sink`
    pub fn new(scheduler: Arc<Scheduler<P>>, sink: S) -> Self {
        Self { scheduler, sink }
    }

    /// Handle every queued fault, returning how many were handled
    pub fn process_pending(&self) -> usize {
        let mut handled = 0;
        while let Some(record) = self.scheduler.next_fault() {
            let (action, resolved) = self.scheduler.resolve_fault(record);
            self.sink.on_fault_action(action, &resolved);
            handled += 1;
        }
        handled
    }

    /// Process faults until `stop` is set
    ///
    /// Idles through the port clock between empty polls.
    pub fn run(&self, stop: &AtomicBool) {
        let idle_us = self.scheduler.config().fault_poll_interval_us;
        while !stop.load(Ordering::Acquire) {
            if self.process_pending() == 0 {
                self.scheduler.port().sleep_us(idle_us);
            }
        }
        self.process_pending();
    }
}

#[cfg(feature = "std")]
impl<P, S> FaultWorker<P, S>
where
    P: HalPort + 'static,
    S: FaultSink + 'static,
{
    /// Run the worker on a dedicated thread until `stop` is set
    pub fn spawn(self, stop: Arc<AtomicBool>) -> std::thread::JoinHandle<()> {
        let idle = core::time::Duration::from_micros(self.scheduler.config().fault_poll_interval_us);
        std::thread::spawn(move || {
            log::info!("Fault: worker started");
            while !stop.load(Ordering::Acquire) {
                if self.process_pending() == 0 {
                    std::thread::sleep(idle);
                }
            }
            self.process_pending();
            log::info!("Fault: worker stopped");
        })
    }
}
