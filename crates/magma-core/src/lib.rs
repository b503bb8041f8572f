//! # MAGMA Core
//!
//! Foundational identifiers and error types for the MAGMA command-submission
//! scheduler.
//!
//! Every object the scheduler tracks (channels, time-slice groups, runlist
//! domains, engines, address-space contexts) is named by a small `Copy`
//! identifier defined here. Cross references between objects are stored as
//! these identifiers and resolved through lookups, never as pointers.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      magma-core                             │
//! │  ┌─────────────────────────┐  ┌──────────────────────────┐  │
//! │  │         Types           │  │          Error           │  │
//! │  │ (ChannelId, GroupId,    │  │   (Error, Capability,    │  │
//! │  │  DomainId, EngineId,    │  │    Result)               │  │
//! │  │  ContextId, Priority)   │  │                          │  │
//! │  └─────────────────────────┘  └──────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//! ```

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

#[cfg(feature = "std")]
extern crate std;

// =============================================================================
// MODULE EXPORTS
// =============================================================================

pub mod error;
pub mod types;

// Re-exports for convenience
pub use error::{Capability, Error, Result};
pub use types::*;
