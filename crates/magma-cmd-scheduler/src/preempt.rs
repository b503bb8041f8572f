//! # Preempt Controller
//!
//! Drives channel and group preemption to a terminal state.
//!
//! ```text
//!   Idle ──trigger──▶ Triggered ──port.preempt_trigger──▶ Pending
//!                                                           │
//!                      ┌──────────── completion seen ───────┤
//!                      ▼                                    ▼
//!                  Completed                       retries / deadline
//!                                                       exhausted
//!                                                           │
//!                                                           ▼
//!                                                       TimedOut
//! ```
//!
//! Requests live in the state of the domain the target was on when it was
//! triggered. The domain lock is held to create a request, to bump its retry
//! counter and to record the terminal state, but never while sleeping
//! between completion polls. A request is removed once terminal; until then
//! a second trigger for the same target is rejected with
//! [`PreemptError::AlreadyPending`], even if the target has since moved to
//! another domain or left its runlist. The controller keeps a target →
//! domain index for that check (leaf lock, taken after a domain lock).
//!
//! Waited requests are finished by their waiter. Fire-and-forget requests
//! are finished by the preempt-complete interrupt or by the periodic
//! timeout check.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use magma_core::{DomainId, Error};
use magma_hal::{Clock, PreemptPort, PreemptTarget};
use spin::Mutex;

use crate::config::PreemptConfig;
use crate::domain::Domain;
use crate::fault::FaultAction;

// =============================================================================
// REQUEST
// =============================================================================

/// Preempt request state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreemptState {
    /// No request for the target
    Idle,
    /// Request recorded, hardware command not yet issued
    Triggered,
    /// Hardware command issued
    Pending,
    /// Hardware reported completion
    Completed,
    /// Completion was not observed in time
    TimedOut,
}

/// An in-flight preempt request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreemptRequest {
    /// Target
    pub target: PreemptTarget,
    /// Current state
    pub state: PreemptState,
    /// Failed completion polls
    pub retries: u32,
    /// Unique request number
    pub seq: u64,
    /// Time the hardware command was issued
    pub issued_at_ns: u64,
    /// Time after which a fire-and-forget request times out
    pub deadline_ns: u64,
    /// Whether a caller is polling for completion
    pub wait_for_finish: bool,
}

// =============================================================================
// ERRORS
// =============================================================================

/// Preempt failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreemptError {
    /// A request for the target has not reached a terminal state
    AlreadyPending,
    /// Completion was not observed within the configured retries
    Timeout,
    /// Unknown channel or group
    NotFound,
    /// The port failed to issue the command
    Hardware(Error),
}

impl fmt::Display for PreemptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyPending => write!(f, "preempt already pending"),
            Self::Timeout => write!(f, "preempt timed out"),
            Self::NotFound => write!(f, "preempt target not found"),
            Self::Hardware(err) => write!(f, "hardware: {}", err),
        }
    }
}

impl From<PreemptError> for Error {
    fn from(err: PreemptError) -> Self {
        match err {
            PreemptError::AlreadyPending => Error::AlreadyPending,
            PreemptError::Timeout => Error::Timeout,
            PreemptError::NotFound => Error::NotFound,
            PreemptError::Hardware(err) => err,
        }
    }
}

/// Result of [`crate::Scheduler::preempt_with_recovery`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreemptOutcome {
    /// The target was preempted (or was not on hardware)
    Completed,
    /// Two attempts timed out; the engine must be reset
    Escalated(FaultAction),
}

// =============================================================================
// STATISTICS
// =============================================================================

/// Preempt counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PreemptStats {
    /// Hardware commands issued
    pub triggered: u64,
    /// Requests completed
    pub completed: u64,
    /// Requests timed out
    pub timed_out: u64,
    /// Duplicate requests rejected
    pub rejected: u64,
}

#[derive(Debug, Default)]
struct PreemptCounters {
    triggered: AtomicU64,
    completed: AtomicU64,
    timed_out: AtomicU64,
    rejected: AtomicU64,
}

// =============================================================================
// CONTROLLER
// =============================================================================

/// Preempt controller
#[derive(Debug)]
pub(crate) struct PreemptController {
    config: PreemptConfig,
    next_seq: AtomicU64,
    /// Domain holding the request of every non-terminal target
    in_flight: Mutex<BTreeMap<PreemptTarget, DomainId>>,
    counters: PreemptCounters,
}

impl PreemptController {
    pub fn new(config: PreemptConfig) -> Self {
        Self {
            config,
            next_seq: AtomicU64::new(1),
            in_flight: Mutex::new(BTreeMap::new()),
            counters: PreemptCounters::default(),
        }
    }

    /// Record a request and issue the hardware command
    ///
    /// `owned` is evaluated under the domain lock; when it reports that the
    /// target left `domain`, nothing is issued and `Ok(None)` is returned so
    /// the caller can resolve the domain again.
    pub fn issue<P, F>(
        &self,
        port: &P,
        domain: &Domain,
        target: PreemptTarget,
        wait_for_finish: bool,
        owned: F,
    ) -> Result<Option<u64>, PreemptError>
    where
        P: PreemptPort + Clock + ?Sized,
        F: FnOnce() -> bool,
    {
        let mut state = domain.state.lock();
        if !owned() {
            return Ok(None);
        }
        {
            let mut in_flight = self.in_flight.lock();
            if let Some(&holder) = in_flight.get(&target) {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                log::debug!("Preempt: {:?} already pending on {}", target, holder);
                return Err(PreemptError::AlreadyPending);
            }
            in_flight.insert(target, domain.id);
        }

        let now = port.time_ns();
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        state.preempts.insert(target, PreemptRequest {
            target,
            state: PreemptState::Triggered,
            retries: 0,
            seq,
            issued_at_ns: now,
            deadline_ns: now.saturating_add(self.config.async_timeout_us.saturating_mul(1000)),
            wait_for_finish,
        });

        if let Err(err) = port.preempt_trigger(target) {
            state.preempts.remove(&target);
            self.in_flight.lock().remove(&target);
            log::error!("Preempt: trigger of {:?} failed: {}", target, err);
            return Err(PreemptError::Hardware(err));
        }
        if let Some(request) = state.preempts.get_mut(&target) {
            request.state = PreemptState::Pending;
        }
        self.counters.triggered.fetch_add(1, Ordering::Relaxed);
        log::debug!("Preempt: {:?} pending on {} (seq {})", target, domain.id, seq);
        Ok(Some(seq))
    }

    /// Poll for completion of request `seq` without holding the domain lock
    pub fn wait<P>(&self, port: &P, domain: &Domain, target: PreemptTarget, seq: u64) -> Result<(), PreemptError>
    where
        P: PreemptPort + Clock + ?Sized,
    {
        for retry in 0..self.config.max_retries {
            if !port.preempt_is_pending(target) {
                return self.finish(domain, target, seq, PreemptState::Completed);
            }

            {
                let mut state = domain.state.lock();
                match state.preempts.get_mut(&target) {
                    Some(request) if request.seq == seq => request.retries += 1,
                    // Finished by the completion interrupt
                    _ => return Ok(()),
                }
            }

            let interval = self
                .config
                .backoff
                .interval_us(self.config.poll_interval_us, retry);
            port.sleep_us(interval);
        }

        if !port.preempt_is_pending(target) {
            return self.finish(domain, target, seq, PreemptState::Completed);
        }
        self.finish(domain, target, seq, PreemptState::TimedOut)
    }

    /// Record a terminal state for request `seq`
    fn finish(
        &self,
        domain: &Domain,
        target: PreemptTarget,
        seq: u64,
        outcome: PreemptState,
    ) -> Result<(), PreemptError> {
        let mut state = domain.state.lock();
        let request = match state.preempts.get(&target) {
            Some(request) if request.seq == seq => *request,
            _ => return Ok(()),
        };
        state.preempts.remove(&target);
        self.in_flight.lock().remove(&target);
        drop(state);

        match outcome {
            PreemptState::TimedOut => {
                self.counters.timed_out.fetch_add(1, Ordering::Relaxed);
                log::warn!(
                    "Preempt: {:?} on {} timed out after {} polls",
                    target,
                    domain.id,
                    request.retries
                );
                Err(PreemptError::Timeout)
            },
            _ => {
                self.counters.completed.fetch_add(1, Ordering::Relaxed);
                log::debug!("Preempt: {:?} completed after {} polls", target, request.retries);
                Ok(())
            },
        }
    }

    /// Complete a request on a preempt-complete notification
    pub fn complete(&self, domain: &Domain, target: PreemptTarget) -> bool {
        let removed = {
            let mut state = domain.state.lock();
            let removed = state.preempts.remove(&target);
            if removed.is_some() {
                self.in_flight.lock().remove(&target);
            }
            removed
        };
        match removed {
            Some(request) => {
                self.counters.completed.fetch_add(1, Ordering::Relaxed);
                log::debug!(
                    "Preempt: {:?} completed by interrupt (seq {})",
                    target,
                    request.seq
                );
                true
            },
            None => false,
        }
    }

    /// Finish fire-and-forget requests on `domain`
    ///
    /// Requests no longer pending in hardware complete; those past their
    /// deadline time out. Returns the timed-out targets.
    pub fn poll<P>(&self, port: &P, domain: &Domain) -> Vec<PreemptTarget>
    where
        P: PreemptPort + Clock + ?Sized,
    {
        let now = port.time_ns();
        let mut timed_out = Vec::new();
        let mut finished = Vec::new();
        let mut state = domain.state.lock();

        state.preempts.retain(|&target, request| {
            if request.wait_for_finish {
                return true;
            }
            if !port.preempt_is_pending(target) {
                self.counters.completed.fetch_add(1, Ordering::Relaxed);
                finished.push(target);
                return false;
            }
            if now >= request.deadline_ns {
                self.counters.timed_out.fetch_add(1, Ordering::Relaxed);
                timed_out.push(target);
                return false;
            }
            request.retries += 1;
            true
        });
        if !finished.is_empty() || !timed_out.is_empty() {
            let mut in_flight = self.in_flight.lock();
            for target in finished.iter().chain(&timed_out) {
                in_flight.remove(target);
            }
        }
        drop(state);

        for target in &timed_out {
            log::warn!("Preempt: {:?} on {} passed its deadline", target, domain.id);
        }
        timed_out
    }

    /// Domain holding the non-terminal request for `target`
    pub fn holder(&self, target: PreemptTarget) -> Option<DomainId> {
        self.in_flight.lock().get(&target).copied()
    }

    /// Reject a new request while one for `target` has not finished
    pub fn ensure_idle(&self, target: PreemptTarget) -> Result<(), PreemptError> {
        match self.holder(target) {
            None => Ok(()),
            Some(holder) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                log::debug!("Preempt: {:?} already pending on {}", target, holder);
                Err(PreemptError::AlreadyPending)
            },
        }
    }

    /// State of the request for `target` on `domain`
    pub fn state(&self, domain: &Domain, target: PreemptTarget) -> Option<PreemptState> {
        domain.state.lock().preempts.get(&target).map(|r| r.state)
    }

    pub fn stats(&self) -> PreemptStats {
        PreemptStats {
            triggered: self.counters.triggered.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            timed_out: self.counters.timed_out.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use alloc::boxed::Box;

    use magma_core::{DomainId, EngineId, EngineType, GpuGeneration, GroupId};
    use magma_hal::sim::SimPort;

    use super::*;
    use crate::config::Backoff;
    use crate::policy::PriorityThenWait;

    fn domain() -> Domain {
        Domain::new(
            DomainId::new(1),
            EngineId(0),
            EngineType::Graphics,
            Box::new(PriorityThenWait::new()),
        )
    }

    fn controller(max_retries: u32) -> PreemptController {
        PreemptController::new(PreemptConfig {
            max_retries,
            poll_interval_us: 10,
            backoff: Backoff::Fixed,
            async_timeout_us: 1_000,
        })
    }

    fn trigger(
        ctl: &PreemptController,
        port: &SimPort,
        dom: &Domain,
        target: PreemptTarget,
        wait: bool,
    ) -> Result<(), PreemptError> {
        let seq = ctl.issue(port, dom, target, wait, || true)?.unwrap();
        if wait { ctl.wait(port, dom, target, seq) } else { Ok(()) }
    }

    #[test]
    fn test_waited_preempt_completes() {
        let port = SimPort::new(GpuGeneration::Volta).with_preempt_latency(Some(3));
        let (ctl, dom) = (controller(10), domain());
        let target = PreemptTarget::group(GroupId::new(2));

        assert_eq!(trigger(&ctl, &port, &dom, target, true), Ok(()));
        assert_eq!(ctl.state(&dom, target), None);
        assert_eq!(ctl.stats().completed, 1);
        assert_eq!(port.time_ns(), 3 * 10 * 1000);
    }

    #[test]
    fn test_waited_preempt_times_out() {
        let port = SimPort::new(GpuGeneration::Volta).with_preempt_latency(None);
        let (ctl, dom) = (controller(5), domain());
        let target = PreemptTarget::group(GroupId::new(2));

        assert_eq!(trigger(&ctl, &port, &dom, target, true), Err(PreemptError::Timeout));
        assert_eq!(ctl.state(&dom, target), None);
        assert_eq!(ctl.stats().timed_out, 1);

        // Terminal state reached, so the target can be triggered again
        assert_eq!(trigger(&ctl, &port, &dom, target, false), Ok(()));
        assert_eq!(port.preempt_triggers().len(), 2);
    }

    #[test]
    fn test_duplicate_rejected_while_pending() {
        let port = SimPort::new(GpuGeneration::Volta).with_preempt_latency(None);
        let (ctl, dom) = (controller(5), domain());
        let target = PreemptTarget::channel(magma_core::ChannelId::new(9));

        assert_eq!(trigger(&ctl, &port, &dom, target, false), Ok(()));
        assert_eq!(ctl.state(&dom, target), Some(PreemptState::Pending));
        assert_eq!(
            trigger(&ctl, &port, &dom, target, false),
            Err(PreemptError::AlreadyPending)
        );
        assert_eq!(ctl.stats().rejected, 1);
        assert_eq!(port.preempt_triggers().len(), 1);
    }

    #[test]
    fn test_async_request_completed_by_interrupt() {
        let port = SimPort::new(GpuGeneration::Volta).with_preempt_latency(None);
        let (ctl, dom) = (controller(5), domain());
        let target = PreemptTarget::group(GroupId::new(4));

        trigger(&ctl, &port, &dom, target, false).unwrap();
        assert!(ctl.complete(&dom, target));
        assert!(!ctl.complete(&dom, target));
        assert_eq!(ctl.state(&dom, target), None);
    }

    #[test]
    fn test_poll_times_out_async_request() {
        let port = SimPort::new(GpuGeneration::Volta).with_preempt_latency(None);
        let (ctl, dom) = (controller(5), domain());
        let stuck = PreemptTarget::group(GroupId::new(1));
        let quick = PreemptTarget::group(GroupId::new(2));

        trigger(&ctl, &port, &dom, stuck, false).unwrap();
        trigger(&ctl, &port, &dom, quick, false).unwrap();
        port.complete_preempt(quick);

        assert!(ctl.poll(&port, &dom).is_empty());
        assert_eq!(ctl.state(&dom, quick), None);
        assert_eq!(ctl.state(&dom, stuck), Some(PreemptState::Pending));

        port.sleep_us(1_000);
        assert_eq!(ctl.poll(&port, &dom), alloc::vec![stuck]);
        assert_eq!(ctl.state(&dom, stuck), None);
        assert_eq!(ctl.stats().timed_out, 1);
        assert_eq!(ctl.stats().completed, 1);
    }

    #[test]
    fn test_moved_target_not_issued() {
        let port = SimPort::new(GpuGeneration::Volta);
        let (ctl, dom) = (controller(5), domain());
        let target = PreemptTarget::group(GroupId::new(1));
        assert_eq!(ctl.issue(&port, &dom, target, true, || false), Ok(None));
        assert!(port.preempt_triggers().is_empty());
    }
    #[test]
    fn test_duplicate_rejected_on_other_domain() {
        let port = SimPort::new(GpuGeneration::Volta).with_preempt_latency(None);
        let ctl = controller(5);
        let first = domain();
        let second = Domain::new(
            DomainId::new(2),
            EngineId(0),
            EngineType::Compute,
            Box::new(PriorityThenWait::new()),
        );
        let target = PreemptTarget::group(GroupId::new(6));

        assert_eq!(trigger(&ctl, &port, &first, target, false), Ok(()));
        assert_eq!(
            trigger(&ctl, &port, &second, target, false),
            Err(PreemptError::AlreadyPending)
        );
        assert_eq!(ctl.holder(target), Some(first.id));
        assert_eq!(ctl.state(&second, target), None);
        assert_eq!(ctl.ensure_idle(target), Err(PreemptError::AlreadyPending));
        assert_eq!(ctl.stats().rejected, 2);

        assert!(!ctl.complete(&second, target));
        assert!(ctl.complete(&first, target));
        assert_eq!(ctl.holder(target), None);
        assert_eq!(ctl.ensure_idle(target), Ok(()));
        assert_eq!(trigger(&ctl, &port, &second, target, false), Ok(()));
        assert_eq!(ctl.holder(target), Some(second.id));
    }
}
