//! # Simulated Page Tables
//!
//! Sparse multi-level translation from GPU virtual addresses to offsets in
//! the simulated physical image.
//!
//! Nodes live in two arenas owned by the table: interior tables and leaf
//! tables. A slot holds the arena index of its only child, created the
//! first time an address routes through it and never replaced. Leaf
//! entries pull a fresh physical page from the bank allocator on first
//! touch. Dropping the table drops the whole tree.
//!
//! Mutation takes `&mut self`: materialization of one address space is
//! single-writer. Share a table between threads behind a lock.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use simgpu_core::{Error, GpuAddr, MemoryBank, PageEntryBits, Result};

use crate::bank::PhysicalAddressAllocator;
use crate::layout::TranslationLayout;

// =============================================================================
// LEAF ENTRY
// =============================================================================

/// A materialized leaf translation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeafEntry {
    /// Physical page base (page aligned)
    pub base: u64,
    /// Recorded entry bits, `PRESENT` always set
    pub bits: PageEntryBits,
    /// Pool the page was reserved from
    pub bank: MemoryBank,
}

impl LeafEntry {
    /// Check the present flag
    #[inline]
    pub const fn is_present(&self) -> bool {
        self.bits.contains(PageEntryBits::PRESENT)
    }
}

// =============================================================================
// WALK SEGMENT
// =============================================================================

/// One page-clipped piece of a walked virtual range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalkSegment {
    /// Virtual start of the piece
    pub gpu_addr: GpuAddr,
    /// Physical offset of the piece
    pub physical: u64,
    /// Bytes in the piece
    pub length: u64,
    /// Bytes walked before this piece
    pub offset: u64,
    /// Entry bits of the backing page
    pub bits: PageEntryBits,
    /// Pool of the backing page
    pub bank: MemoryBank,
}

// =============================================================================
// STATISTICS
// =============================================================================

/// Page table statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageTableStats {
    /// Interior tables, root included
    pub tables: u64,
    /// Leaf tables
    pub leaf_tables: u64,
    /// Leaf pages backed by physical memory
    pub pages: u64,
    /// Pages whose entry bits were rewritten
    pub bit_updates: u64,
}

// =============================================================================
// PAGE TABLE
// =============================================================================

type Slot = Option<u32>;

/// Sparse translation tree bound to one physical allocator
#[derive(Debug)]
pub struct PageTable {
    /// Tree shape
    layout: TranslationLayout,
    /// Source of leaf pages
    allocator: Arc<PhysicalAddressAllocator>,
    /// Interior tables, index 0 is the root
    tables: Vec<Box<[Slot]>>,
    /// Leaf tables
    leaves: Vec<Box<[Option<LeafEntry>]>>,
    /// Statistics
    stats: PageTableStats,
}

impl PageTable {
    /// Arena index of the root table
    const ROOT: usize = 0;

    /// Create an empty tree
    pub fn new(layout: TranslationLayout, allocator: Arc<PhysicalAddressAllocator>) -> Result<Self> {
        layout.validate()?;

        let root = vec![None; layout.fan_out(layout.root_level())].into_boxed_slice();

        log::info!(
            "page table: {} levels, {}-bit addressing, {} pages",
            layout.levels,
            layout.address_bits(),
            layout.page_size
        );

        Ok(Self {
            layout,
            allocator,
            tables: vec![root],
            leaves: Vec::new(),
            stats: PageTableStats {
                tables: 1,
                ..PageTableStats::default()
            },
        })
    }

    /// Get the tree shape
    pub fn layout(&self) -> TranslationLayout {
        self.layout
    }

    /// Get the backing allocator
    pub fn allocator(&self) -> &Arc<PhysicalAddressAllocator> {
        &self.allocator
    }

    /// Get statistics
    pub fn stats(&self) -> &PageTableStats {
        &self.stats
    }

    /// Leaf page size in bytes
    #[inline]
    pub fn page_size(&self) -> u64 {
        self.layout.page_size.bytes()
    }

    /// Abort on an address the tree was not built for
    fn fatal(err: Error) -> ! {
        log::error!("page table: {}", err);
        panic!("page table: {}", err);
    }

    /// Last byte of `[addr, addr + size)`, aborting when it leaves the tree
    fn check_range(&self, addr: GpuAddr, size: u64) -> u64 {
        let bits = self.layout.address_bits();
        let last = addr
            .checked_add(size.max(1) - 1)
            .map(GpuAddr::raw)
            .unwrap_or_else(|| {
                Self::fatal(Error::AddressOutOfRange {
                    addr: addr.raw(),
                    bits,
                })
            });

        if last > self.layout.max_address() {
            Self::fatal(Error::AddressOutOfRange { addr: last, bits });
        }
        last
    }

    /// Child of an interior slot, created if absent
    fn child_or_insert(&mut self, table: usize, index: usize, child_level: u8) -> usize {
        if let Some(child) = self.tables[table][index] {
            return child as usize;
        }

        let fan_out = self.layout.fan_out(child_level);
        let child = if child_level == 0 {
            self.leaves.push(vec![None; fan_out].into_boxed_slice());
            self.stats.leaf_tables += 1;
            self.leaves.len() - 1
        } else {
            self.tables.push(vec![None; fan_out].into_boxed_slice());
            self.stats.tables += 1;
            self.tables.len() - 1
        };

        self.tables[table][index] = Some(child as u32);
        log::debug!(
            "page table: level {} node {} created under slot {}",
            child_level,
            child,
            index
        );
        child
    }

    /// Leaf table and slot for `addr`, building the path on the way down
    fn leaf_slot(&mut self, addr: u64) -> (usize, usize) {
        let mut table = Self::ROOT;
        for level in (1..self.layout.levels).rev() {
            let index = self.layout.index_at(addr, level);
            table = self.child_or_insert(table, index, level - 1);
        }
        (table, self.layout.index_at(addr, 0))
    }

    /// Leaf entry backing `addr`, reserving a page on first touch
    fn materialize(&mut self, addr: u64, bits: Option<PageEntryBits>, bank: MemoryBank) -> LeafEntry {
        let (leaf_table, index) = self.leaf_slot(addr);
        let page_size = self.layout.page_size.bytes();

        let slot = &mut self.leaves[leaf_table][index];
        if let Some(entry) = slot.as_mut() {
            if let Some(bits) = bits {
                let bits = bits | PageEntryBits::PRESENT;
                if entry.bits != bits {
                    entry.bits = bits;
                    self.stats.bit_updates += 1;
                }
            }
            return *entry;
        }

        let entry = LeafEntry {
            base: self.allocator.reserve_page(bank, page_size, page_size),
            bits: bits.unwrap_or_default() | PageEntryBits::PRESENT,
            bank: self.allocator.pool_of(bank),
        };
        *slot = Some(entry);
        self.stats.pages += 1;

        #[cfg(feature = "metrics")]
        if self.stats.pages % 1024 == 0 {
            log::info!("page table: {:?}", self.stats);
        }

        entry
    }

    /// Physical offset of `addr`, materializing every page of `[addr, addr + size)`
    ///
    /// `bits` of `Some` rewrites the entry bits of every page in range;
    /// `None` keeps the bits of pages that already exist. Fresh pages come
    /// from `bank`. Repeated calls for the same address return the same
    /// offset whatever the size.
    pub fn map(&mut self, addr: GpuAddr, size: u64, bits: Option<PageEntryBits>, bank: MemoryBank) -> u64 {
        let last = self.check_range(addr, size);
        let page_size = self.page_size();
        let last_page = last & !(page_size - 1);

        let mut page = addr.align_down(page_size).raw();
        let first = self.materialize(page, bits, bank);
        while page < last_page {
            page += page_size;
            self.materialize(page, bits, bank);
        }

        first.base + addr.page_offset(page_size)
    }

    /// Visit `[addr, addr + size)` page by page in ascending order
    ///
    /// Every page is materialized as in [`PageTable::map`]. The visitor sees
    /// one [`WalkSegment`] per page touched, the first and last clipped to
    /// the range; segment lengths sum to `size`.
    pub fn page_walk<F>(
        &mut self,
        addr: GpuAddr,
        size: u64,
        bits: Option<PageEntryBits>,
        bank: MemoryBank,
        mut visitor: F,
    ) where
        F: FnMut(WalkSegment),
    {
        if size == 0 {
            return;
        }
        self.check_range(addr, size);

        let page_size = self.page_size();
        let mut current = addr.raw();
        let mut offset = 0;

        while offset < size {
            let in_page = current & (page_size - 1);
            let length = (page_size - in_page).min(size - offset);
            let entry = self.materialize(current - in_page, bits, bank);

            log::trace!(
                "page walk: {:#x} -> {:#x} ({:#x} bytes)",
                current,
                entry.base + in_page,
                length
            );

            visitor(WalkSegment {
                gpu_addr: GpuAddr::new(current),
                physical: entry.base + in_page,
                length,
                offset,
                bits: entry.bits,
                bank: entry.bank,
            });

            offset += length;
            current += length;
        }
    }

    /// Existing leaf entry for `addr`, without materializing anything
    pub fn entry(&self, addr: GpuAddr) -> Option<LeafEntry> {
        self.check_range(addr, 1);

        let mut table = Self::ROOT;
        for level in (2..self.layout.levels).rev() {
            let index = self.layout.index_at(addr.raw(), level);
            table = self.tables[table][index]? as usize;
        }
        let leaf_table = self.tables[table][self.layout.index_at(addr.raw(), 1)]? as usize;
        self.leaves[leaf_table][self.layout.index_at(addr.raw(), 0)]
    }

    /// Physical offset of an already mapped address
    pub fn translate(&self, addr: GpuAddr) -> Option<u64> {
        let page_size = self.page_size();
        self.entry(addr)
            .map(|entry| entry.base + addr.page_offset(page_size))
    }

    /// Every materialized page with its virtual base, ascending
    pub fn mapped_pages(&self) -> Vec<(GpuAddr, LeafEntry)> {
        let mut pages = Vec::new();
        let mut path = [0usize; 4];
        self.collect_pages(Self::ROOT, self.layout.root_level(), &mut path, &mut pages);
        pages
    }

    fn collect_pages(
        &self,
        table: usize,
        level: u8,
        path: &mut [usize; 4],
        pages: &mut Vec<(GpuAddr, LeafEntry)>,
    ) {
        let depth = (self.layout.root_level() - level) as usize;
        for (index, slot) in self.tables[table].iter().enumerate() {
            let Some(child) = *slot else { continue };
            path[depth] = index;

            if level == 1 {
                for (leaf_index, leaf) in self.leaves[child as usize].iter().enumerate() {
                    if let Some(entry) = leaf {
                        path[depth + 1] = leaf_index;
                        let levels = self.layout.levels as usize;
                        let addr = self.layout.compose(&path[..levels], 0);
                        pages.push((GpuAddr::new(addr), *entry));
                    }
                }
            } else {
                self.collect_pages(child as usize, level - 1, path, pages);
            }
        }
    }
}
