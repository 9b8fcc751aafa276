//! # Translation Layouts
//!
//! Shape of a simulated translation tree: how many levels, how many
//! address bits each level consumes, and the leaf page size.
//!
//! Levels are numbered from the leaf: level 0 indexes leaf entries,
//! level `levels - 1` is the root.
//!
//! ```text
//!  wide (4 levels, 48-bit)                 narrow (3 levels, 32-bit)
//!  ┌──────┬──────┬──────┬──────┬───────┐   ┌────┬──────┬──────┬───────┐
//!  │ L3 9 │ L2 9 │ L1 9 │ L0 9 │ pg 12 │   │L2 2│ L1 9 │ L0 9 │ pg 12 │
//!  └──────┴──────┴──────┴──────┴───────┘   └────┴──────┴──────┴───────┘
//! ```

use simgpu_core::{Error, PageSize, Result};

/// Widest index any level may consume
pub const MAX_LEVEL_BITS: u8 = 9;

// =============================================================================
// TRANSLATION LAYOUT
// =============================================================================

/// Shape of a translation tree
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TranslationLayout {
    /// Number of levels including the leaf level (3 or 4)
    pub levels: u8,
    /// Index bits consumed by the root
    pub root_bits: u8,
    /// Index bits consumed by every non-root level
    pub level_bits: u8,
    /// Leaf page size
    pub page_size: PageSize,
}

impl TranslationLayout {
    /// 3-level tree with a 4-entry root: 32-bit addressing
    pub const fn narrow() -> Self {
        Self {
            levels: 3,
            root_bits: 2,
            level_bits: 9,
            page_size: PageSize::Size4K,
        }
    }

    /// 4-level tree, 512 entries per level: 48-bit addressing
    pub const fn wide() -> Self {
        Self {
            levels: 4,
            root_bits: 9,
            level_bits: 9,
            page_size: PageSize::Size4K,
        }
    }

    /// Same shape with a different leaf page size
    pub const fn with_page_size(mut self, page_size: PageSize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Check the layout can be built
    pub fn validate(&self) -> Result<()> {
        if !(3..=4).contains(&self.levels) {
            return Err(Error::InvalidConfiguration);
        }
        if !(1..=MAX_LEVEL_BITS).contains(&self.root_bits)
            || !(1..=MAX_LEVEL_BITS).contains(&self.level_bits)
        {
            return Err(Error::InvalidConfiguration);
        }
        if self.address_bits() > 64 {
            return Err(Error::InvalidConfiguration);
        }
        Ok(())
    }

    /// Index of the root level
    #[inline]
    pub const fn root_level(&self) -> u8 {
        self.levels - 1
    }

    /// Index bits consumed at `level`
    #[inline]
    pub const fn bits_at(&self, level: u8) -> u8 {
        if level == self.root_level() {
            self.root_bits
        } else {
            self.level_bits
        }
    }

    /// Number of slots in a node at `level`
    #[inline]
    pub const fn fan_out(&self, level: u8) -> usize {
        1 << self.bits_at(level)
    }

    /// Right shift isolating the index of `level`
    #[inline]
    pub const fn shift_at(&self, level: u8) -> u32 {
        self.page_size.shift() + self.level_bits as u32 * level as u32
    }

    /// Total virtual address bits the tree covers
    #[inline]
    pub const fn address_bits(&self) -> u32 {
        self.shift_at(self.root_level()) + self.root_bits as u32
    }

    /// Highest address the tree can translate
    #[inline]
    pub const fn max_address(&self) -> u64 {
        let bits = self.address_bits();
        if bits >= 64 {
            u64::MAX
        } else {
            (1u64 << bits) - 1
        }
    }

    /// Slot index of `addr` at `level`
    #[inline]
    pub const fn index_at(&self, addr: u64, level: u8) -> usize {
        let mask = (1u64 << self.bits_at(level)) - 1;
        ((addr >> self.shift_at(level)) & mask) as usize
    }

    /// Per-level indices of `addr`, root first
    pub fn decompose(&self, addr: u64) -> ([usize; 4], usize) {
        let mut indices = [0; 4];
        for (slot, level) in (0..self.levels).rev().enumerate() {
            indices[slot] = self.index_at(addr, level);
        }
        (indices, self.levels as usize)
    }

    /// Rebuild an address from root-first indices and an intra-page offset
    pub fn compose(&self, indices: &[usize], page_offset: u64) -> u64 {
        indices
            .iter()
            .zip((0..self.levels).rev())
            .fold(page_offset, |addr, (&index, level)| {
                addr | ((index as u64) << self.shift_at(level))
            })
    }
}

impl Default for TranslationLayout {
    fn default() -> Self {
        Self::wide()
    }
}
