//! # SimGPU Core
//!
//! Foundational types shared by the simulated device memory model.
//!
//! The simulator never talks to silicon: every address handed out here
//! indexes a simulated physical memory image that is later dumped into a
//! trace or compared against expectations.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       simgpu-core                           │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────┐  │
//! │  │   Types     │  │   Error     │  │     Sync            │  │
//! │  │ (GpuAddr,   │  │  Handling   │  │  (TaskTimeline)     │  │
//! │  │  MemoryBank)│  │             │  │                     │  │
//! │  └─────────────┘  └─────────────┘  └─────────────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//! ```

#![no_std]
#![warn(missing_docs)]
#![warn(clippy::all)]

#[cfg(test)]
extern crate std;

// =============================================================================
// MODULE EXPORTS
// =============================================================================

pub mod error;
pub mod sync;
pub mod types;

// Re-exports for convenience
pub use error::{Error, Result};
pub use sync::TaskTimeline;
pub use types::*;

// =============================================================================
// STATIC ASSERTIONS
// =============================================================================

static_assertions::assert_impl_all!(GpuAddr: Send, Sync, Copy);
static_assertions::assert_impl_all!(ByteSize: Send, Sync, Copy);
static_assertions::assert_impl_all!(MemoryBank: Send, Sync, Copy);
static_assertions::assert_impl_all!(TaskTimeline: Send, Sync);
