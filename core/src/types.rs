//! # SimGPU Core Types
//!
//! Fundamental type definitions used across the simulated memory model.
//!
//! These types provide:
//! - Strong typing for simulated GPU virtual addresses
//! - Memory bank identifiers (main pool vs. per-tile local banks)
//! - Size and page-size guarantees

use core::fmt;
use core::ops::Add;

// =============================================================================
// GPU ADDRESS
// =============================================================================

/// GPU Virtual Address
///
/// An address in a simulated GPU virtual address space. It only becomes a
/// physical offset after translation through a page table.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct GpuAddr(u64);

impl GpuAddr {
    /// Create a new GPU address
    #[inline]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Get the raw u64 value
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Align down to boundary
    #[inline]
    pub const fn align_down(self, alignment: u64) -> Self {
        let mask = alignment - 1;
        Self(self.0 & !mask)
    }

    /// Offset within a page of the given size
    #[inline]
    pub const fn page_offset(self, page_size: u64) -> u64 {
        self.0 & (page_size - 1)
    }

    /// Offset by bytes, `None` on overflow
    #[inline]
    pub const fn checked_add(self, bytes: u64) -> Option<Self> {
        match self.0.checked_add(bytes) {
            Some(addr) => Some(Self(addr)),
            None => None,
        }
    }
}

impl Add<u64> for GpuAddr {
    type Output = Self;

    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0.wrapping_add(rhs))
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
// MEMORY BANK
// =============================================================================

/// Simulated physical memory bank
///
/// `Main` is the shared system pool. `Local(i)` is the i-th device-local
/// bank (one per tile / NUMA node) of a multi-bank configuration.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum MemoryBank {
    /// Shared main pool
    #[default]
    Main,
    /// Device-local bank by 0-based index
    Local(u32),
}

impl MemoryBank {
    /// Raw encoding used by command-stream traces: 0 is main, `i + 1` is local bank `i`
    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        match raw {
            0 => Self::Main,
            n => Self::Local(n - 1),
        }
    }

    /// Raw trace encoding, `None` for `Local(u32::MAX)` which has none
    #[inline]
    pub const fn raw(self) -> Option<u32> {
        match self {
            Self::Main => Some(0),
            Self::Local(index) => index.checked_add(1),
        }
    }

    /// Check if this is the main pool
    #[inline]
    pub const fn is_main(self) -> bool {
        matches!(self, Self::Main)
    }

    /// Local bank index, if any
    #[inline]
    pub const fn local_index(self) -> Option<u32> {
        match self {
            Self::Main => None,
            Self::Local(index) => Some(index),
        }
    }
}

impl fmt::Debug for MemoryBank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Main => write!(f, "MemoryBank(main)"),
            Self::Local(index) => write!(f, "MemoryBank(local{})", index),
        }
    }
}

impl fmt::Display for MemoryBank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Main => write!(f, "main"),
            Self::Local(index) => write!(f, "local{}", index),
        }
    }
}

// =============================================================================
// PAGE SIZE
// =============================================================================

/// Page sizes the physical allocator hands out
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PageSize {
    /// 4 KiB page
    Size4K,
    /// 64 KiB page
    Size64K,
}

impl PageSize {
    /// Size in bytes
    #[inline]
    pub const fn bytes(self) -> u64 {
        match self {
            Self::Size4K => 4 * 1024,
            Self::Size64K => 64 * 1024,
        }
    }

    /// log2 of the size
    #[inline]
    pub const fn shift(self) -> u32 {
        match self {
            Self::Size4K => 12,
            Self::Size64K => 16,
        }
    }
}

impl fmt::Display for PageSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Size4K => write!(f, "4K"),
            Self::Size64K => write!(f, "64K"),
        }
    }
}

// =============================================================================
// PAGE ENTRY BITS
// =============================================================================

bitflags::bitflags! {
    /// Bits recorded in a leaf translation entry
    ///
    /// They are carried into traces and reported to page walkers; the
    /// simulator never enforces them.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PageEntryBits: u64 {
        /// Entry is present
        const PRESENT = 1 << 0;
        /// Page is writable
        const WRITABLE = 1 << 1;
        /// Page is user accessible
        const USER = 1 << 2;
        /// Page lives in device-local memory
        const LOCAL_MEMORY = 1 << 11;
    }
}

impl PageEntryBits {
    /// Check whether the entry targets device-local memory
    #[inline]
    pub const fn is_local_memory(self) -> bool {
        self.contains(Self::LOCAL_MEMORY)
    }
}

// =============================================================================
// SIZE TYPES
// =============================================================================

/// Size in bytes
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct ByteSize(u64);

impl ByteSize {
    /// Zero size
    pub const ZERO: Self = Self(0);

    /// Create from bytes
    #[inline]
    pub const fn from_bytes(bytes: u64) -> Self {
        Self(bytes)
    }

    /// Create from KiB
    #[inline]
    pub const fn from_kib(kib: u64) -> Self {
        Self(kib * 1024)
    }

    /// Create from MiB
    #[inline]
    pub const fn from_mib(mib: u64) -> Self {
        Self(mib * 1024 * 1024)
    }

    /// Get as bytes
    #[inline]
    pub const fn as_bytes(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 >= 1024 * 1024 * 1024 {
            write!(f, "{} GiB", self.0 / (1024 * 1024 * 1024))
        } else if self.0 >= 1024 * 1024 {
            write!(f, "{} MiB", self.0 / (1024 * 1024))
        } else if self.0 >= 1024 {
            write!(f, "{} KiB", self.0 / 1024)
        } else {
            write!(f, "{} B", self.0)
        }
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
