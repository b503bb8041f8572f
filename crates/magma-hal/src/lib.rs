//! # MAGMA Hardware Abstraction Port
//!
//! The narrow functional contract between the runlist scheduler and the
//! per-generation hardware layer.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      magma-cmd-scheduler                     │
//! └──────────────┬───────────────┬───────────────┬───────────────┘
//!                │               │               │
//!        ┌───────▼──────┐ ┌──────▼───────┐ ┌─────▼────────┐
//!        │ RunlistPort  │ │ PreemptPort  │ │  FaultPort   │
//!        │ size / limit │ │ trigger/poll │ │ decode_fault │
//!        │ encode/submit│ │              │ │              │
//!        └───────┬──────┘ └──────┬───────┘ └─────┬────────┘
//!                └───────────────┼───────────────┘
//!                        ┌───────▼───────┐
//!                        │    HalPort    │  one implementation per
//!                        │  (+ Clock)    │  chip generation, chosen
//!                        └───────────────┘  once at initialization
//! ```
//!
//! The scheduler never reads registers itself. Entry sizes and counts are
//! queried from the port at runtime, and entry bytes are produced by the
//! port, so the runlist buffer is an opaque byte contract.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

#[cfg(feature = "sim")]
extern crate alloc;

#[cfg(feature = "std")]
extern crate std;

pub mod fault;
pub mod format;
pub mod irq;
pub mod port;

#[cfg(feature = "sim")]
pub mod sim;

// Re-exports
pub use fault::{FaultClass, FaultRecord};
pub use format::{DecodedEntry, RunlistFormat};
pub use irq::{InterruptHandler, InterruptSource, InterruptStatus, IrqMask};
pub use port::{
    Clock, EntryGranularity, FaultPort, HalPort, PortCaps, PreemptPort, PreemptTarget,
    RunlistEntry, RunlistPort, TargetKind,
};
