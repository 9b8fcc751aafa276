//! # Physical Bank Allocator
//!
//! Monotonic physical-offset allocation for the simulated memory image.
//!
//! The simulator never frees physical pages: a page handed to a page table
//! stays mapped until the whole simulation is torn down, so a bump cursor
//! per bank is enough. Multi-bank configurations model one bank per tile,
//! bank `i` covering `[i * bank_size, (i + 1) * bank_size)`.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use simgpu_core::{ByteSize, Error, MemoryBank, PageSize, Result};

/// First offset handed out by the main pool and by bank 0. Offset 0 stays
/// reserved as the invalid sentinel.
pub const INITIAL_PAGE_ADDRESS: u64 = 0x1000;

// =============================================================================
// BANK CONFIGURATION
// =============================================================================

/// Bank layout of the simulated device memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BankConfig {
    /// Capacity of every local bank
    pub bank_size: ByteSize,
    /// Number of local banks (0 means a single shared pool)
    pub bank_count: u32,
}

impl BankConfig {
    /// One shared pool, no local banks
    pub const fn single_pool() -> Self {
        Self {
            bank_size: ByteSize::ZERO,
            bank_count: 0,
        }
    }

    /// `count` local banks of `bank_size` bytes each
    pub const fn tiles(count: u32, bank_size: ByteSize) -> Self {
        Self {
            bank_size,
            bank_count: count,
        }
    }

    /// Check the layout can be built
    pub fn validate(&self) -> Result<()> {
        if self.bank_count == 0 {
            return Ok(());
        }

        let size = self.bank_size.as_bytes();
        if size <= INITIAL_PAGE_ADDRESS || size % PageSize::Size4K.bytes() != 0 {
            return Err(Error::InvalidConfiguration);
        }

        // The end of the last bank must be representable
        size.checked_mul(u64::from(self.bank_count))
            .map(|_| ())
            .ok_or(Error::InvalidConfiguration)
    }
}

impl Default for BankConfig {
    fn default() -> Self {
        Self::single_pool()
    }
}

// =============================================================================
// PHYSICAL ADDRESS ALLOCATOR
// =============================================================================

/// Hands out page-aligned, non-overlapping, increasing physical offsets
///
/// Cursors are plain atomics advanced with a bounded compare-and-swap loop,
/// so concurrent reservations from several address spaces never block on
/// each other beyond that loop.
#[derive(Debug)]
pub struct PhysicalAddressAllocator {
    /// Bank layout
    config: BankConfig,
    /// Cursor of the shared pool
    main: AtomicU64,
    /// Cursor of every local bank
    banks: Box<[AtomicU64]>,
    /// Pages handed out so far, all banks
    pages_reserved: AtomicU64,
}

impl PhysicalAddressAllocator {
    /// Create a single-pool allocator
    pub fn new() -> Self {
        Self {
            config: BankConfig::single_pool(),
            main: AtomicU64::new(INITIAL_PAGE_ADDRESS),
            banks: Box::new([]),
            pages_reserved: AtomicU64::new(0),
        }
    }

    /// Create an allocator for a multi-bank layout
    pub fn with_banks(config: BankConfig) -> Result<Self> {
        config.validate()?;

        let banks: Vec<AtomicU64> = (0..config.bank_count)
            .map(|index| AtomicU64::new(Self::bank_start(&config, index)))
            .collect();

        log::info!(
            "physical allocator: {} bank(s) of {}",
            config.bank_count,
            config.bank_size
        );

        Ok(Self {
            config,
            main: AtomicU64::new(INITIAL_PAGE_ADDRESS),
            banks: banks.into_boxed_slice(),
            pages_reserved: AtomicU64::new(0),
        })
    }

    fn bank_start(config: &BankConfig, index: u32) -> u64 {
        if index == 0 {
            INITIAL_PAGE_ADDRESS
        } else {
            u64::from(index) * config.bank_size.as_bytes()
        }
    }

    /// Get the bank layout
    pub fn config(&self) -> BankConfig {
        self.config
    }

    /// Number of local banks
    pub fn bank_count(&self) -> u32 {
        self.config.bank_count
    }

    /// Capacity of each local bank
    pub fn bank_size(&self) -> ByteSize {
        self.config.bank_size
    }

    /// Total pages reserved across all banks
    pub fn pages_reserved(&self) -> u64 {
        self.pages_reserved.load(Ordering::Relaxed)
    }

    /// Pool that serves reservations named `bank`
    ///
    /// Without local banks every request lands in the main pool.
    pub fn pool_of(&self, bank: MemoryBank) -> MemoryBank {
        if self.banks.is_empty() {
            MemoryBank::Main
        } else {
            bank
        }
    }

    /// Resolve a bank to its cursor, start offset and exclusive limit
    fn resolve(&self, bank: MemoryBank) -> Result<(&AtomicU64, u64, Option<u64>)> {
        match bank.local_index() {
            None => Ok((&self.main, INITIAL_PAGE_ADDRESS, None)),
            Some(_) if self.banks.is_empty() => Ok((&self.main, INITIAL_PAGE_ADDRESS, None)),
            Some(index) => {
                let cursor = self
                    .banks
                    .get(index as usize)
                    .ok_or(Error::InvalidBank(bank))?;
                let limit = u64::from(index + 1) * self.config.bank_size.as_bytes();
                Ok((cursor, Self::bank_start(&self.config, index), Some(limit)))
            },
        }
    }

    /// Reserve a page, reporting exhaustion instead of aborting
    pub fn try_reserve_page(&self, bank: MemoryBank, page_size: u64, alignment: u64) -> Result<u64> {
        if page_size == 0 || alignment == 0 || !alignment.is_power_of_two() {
            return Err(Error::InvalidParameter);
        }

        let (cursor, _, limit) = self.resolve(bank)?;

        let previous = cursor
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                let aligned = current.checked_next_multiple_of(alignment)?;
                let end = aligned.checked_add(page_size)?;
                match limit {
                    Some(limit) if end > limit => None,
                    _ => Some(end),
                }
            })
            .map_err(|_| Error::OutOfBankMemory {
                bank,
                requested: page_size,
            })?;

        // Same arithmetic the successful update used
        let address = previous.next_multiple_of(alignment);
        self.pages_reserved.fetch_add(1, Ordering::Relaxed);

        #[cfg(feature = "debug-alloc")]
        log::debug!(
            "physical allocator: {} page {:#x}..{:#x}",
            bank,
            address,
            address + page_size
        );

        Ok(address)
    }

    /// Reserve a page of `page_size` bytes aligned to `alignment`
    ///
    /// Running out of a bank, or naming a bank the layout does not have, is
    /// a simulator sizing bug and aborts.
    pub fn reserve_page(&self, bank: MemoryBank, page_size: u64, alignment: u64) -> u64 {
        match self.try_reserve_page(bank, page_size, alignment) {
            Ok(address) => address,
            Err(err) => {
                log::error!(
                    "physical allocator: reservation of {:#x} bytes in {} failed: {}",
                    page_size,
                    bank,
                    err
                );
                panic!("physical page reservation failed: {}", err);
            },
        }
    }

    /// Reserve a 4 KiB page
    pub fn reserve_4k_page(&self, bank: MemoryBank) -> u64 {
        let size = PageSize::Size4K.bytes();
        self.reserve_page(bank, size, size)
    }

    /// Reserve a 64 KiB page
    pub fn reserve_64k_page(&self, bank: MemoryBank) -> u64 {
        let size = PageSize::Size64K.bytes();
        self.reserve_page(bank, size, size)
    }

    /// Next free offset of a bank, `None` for a bank the layout lacks
    pub fn cursor(&self, bank: MemoryBank) -> Option<u64> {
        self.resolve(bank)
            .ok()
            .map(|(cursor, _, _)| cursor.load(Ordering::Acquire))
    }

    /// Bytes consumed in a bank, alignment padding included
    pub fn bytes_reserved(&self, bank: MemoryBank) -> Option<ByteSize> {
        self.resolve(bank).ok().map(|(cursor, start, _)| {
            ByteSize::from_bytes(cursor.load(Ordering::Acquire) - start)
        })
    }
}

impl Default for PhysicalAddressAllocator {
    fn default() -> Self {
        Self::new()
    }
}
