//! # MAGMA Runlist Scheduler
//!
//! Decides which channels and time-slice groups a GPU engine runs, in what
//! order, and how work is forcibly displaced or evicted.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                           Scheduler                               │
//! │                                                                   │
//! │  ┌──────────────┐   ┌──────────────────────────────────────────┐  │
//! │  │   Registry   │   │  Domain (one per runlist, own lock)      │  │
//! │  │ channels     │◀──│  active set ─▶ SchedulingPolicy ─▶ order │  │
//! │  │ groups       │   │  double-buffered runlist (live/staged)   │  │
//! │  │ membership   │   │  in-flight preempt requests              │  │
//! │  └──────────────┘   └───────────────────┬──────────────────────┘  │
//! │                                         │                         │
//! │  ┌─────────────────┐  ┌─────────────────┴──┐  ┌────────────────┐  │
//! │  │ PreemptControl  │  │  Runlist builder   │  │ FaultCoordin.  │  │
//! │  │ trigger / poll  │  │  encode ─▶ submit  │  │ queue ─▶ worker│  │
//! │  └────────┬────────┘  └─────────┬──────────┘  └───────┬────────┘  │
//! └───────────┼─────────────────────┼─────────────────────┼───────────┘
//!             └─────────────────────┼─────────────────────┘
//!                            ┌──────▼──────┐
//!                            │   HalPort   │
//!                            └─────────────┘
//! ```
//!
//! ## Lock Order
//!
//! 1. Domain state (`spin::Mutex`, one per domain, ascending id when more
//!    than one is needed)
//! 2. Registry tables (`spin::RwLock`, leaf)
//! 3. Preempt in-flight index (`spin::Mutex`, leaf)
//!
//! Port calls that wait (completion polling, sleeps) never run under a
//! domain lock. Submission runs under the lock of the domain submitted.
//!
//! ## Example
//!
//! ```ignore
//! let sched = Scheduler::new(port, SchedulerConfig::default().with_domain(gr))?;
//! let ch = sched.open_channel(ChannelDesc { ring, context });
//! let tsg = sched.create_group(Priority::High, Duration::from_millis(2))?;
//! sched.bind_channel_to_group(ch, tsg)?;
//! sched.bind_group_to_domain(tsg, gr.id)?;
//! sched.request_preempt(PreemptTarget::group(tsg), true)?;
//! ```

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

#[cfg(feature = "std")]
extern crate std;

pub mod config;
pub mod domain;
pub mod fault;
pub mod fault_queue;
pub mod policy;
pub mod preempt;
pub mod registry;
pub mod runlist;
pub mod scheduler;

// Re-exports
pub use config::{Backoff, DomainConfig, PolicyKind, PreemptConfig, SchedulerConfig};
pub use domain::{Domain, RunlistStats};
pub use fault::{FaultAction, FaultSink, FaultStats, FaultWorker};
pub use fault_queue::{FaultQueue, QueueStats};
pub use policy::{
    GroupSnapshot, PriorityThenWait, RoundRobin, SchedulingPolicy, StrictPriority, WeightedFair,
};
pub use preempt::{PreemptError, PreemptOutcome, PreemptRequest, PreemptState, PreemptStats};
pub use registry::{Channel, ChannelDesc, ChannelState, Group, GroupState, Registry};
pub use runlist::{BuildError, CommittedRunlist};
pub use scheduler::{Scheduler, SchedulerStats};
