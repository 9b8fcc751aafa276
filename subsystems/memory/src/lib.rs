//! # SimGPU Memory
//!
//! Memory model of a simulated GPU device.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                         SimulatedMemory                             │
//! │  ┌───────────────┐  ┌───────────────┐  ┌──────────────────────────┐ │
//! │  │  PageTable    │  │  PageTable    │  │   AllocationStorage      │ │
//! │  │   (ppgtt)     │  │   (ggtt)      │  │  temporary │ reusable    │ │
//! │  └───────┬───────┘  └───────┬───────┘  └────────────┬─────────────┘ │
//! │          │ leaf pages       │                       │ markers       │
//! │  ┌───────▼──────────────────▼───────┐  ┌────────────▼─────────────┐ │
//! │  │   PhysicalAddressAllocator       │  │      TaskTimeline        │ │
//! │  │   main pool │ bank 0 │ bank 1 .. │  │   issued │ completed     │ │
//! │  └──────────────────────────────────┘  └──────────────────────────┘ │
//! │  ┌──────────────────────────────────┐                               │
//! │  │   PhysicalImage (sparse bytes)   │                               │
//! │  └──────────────────────────────────┘                               │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! - [`bank`]: lock-free physical page reservation per bank
//! - [`page_table`]: sparse multi-level translation, materialized on demand
//! - [`storage`]: allocations kept until the device is done with them
//! - [`device`]: the pieces wired together behind one handle

#![no_std]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

#[cfg(test)]
extern crate std;

// =============================================================================
// MODULE EXPORTS
// =============================================================================

pub mod bank;
pub mod device;
pub mod image;
pub mod layout;
pub mod page_table;
pub mod storage;

// Re-exports for convenience
pub use bank::{BankConfig, PhysicalAddressAllocator};
pub use device::{MemoryConfig, SimulatedMemory};
pub use image::PhysicalImage;
pub use layout::TranslationLayout;
pub use page_table::{LeafEntry, PageTable, PageTableStats, WalkSegment};
pub use storage::{
    AllocationList, AllocationStorage, DropReleaser, MemoryReleaser, StorageStats, TrackedAllocation,
};

// =============================================================================
// STATIC ASSERTIONS
// =============================================================================

static_assertions::assert_impl_all!(PhysicalAddressAllocator: Send, Sync);
static_assertions::assert_impl_all!(PageTable: Send, Sync);
static_assertions::assert_impl_all!(TranslationLayout: Send, Sync, Copy);
static_assertions::assert_impl_all!(WalkSegment: Send, Sync, Copy);
static_assertions::assert_obj_safe!(TrackedAllocation);
