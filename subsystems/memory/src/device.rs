//! # Simulated Device Memory
//!
//! Ties the memory model together for one simulated device: a physical
//! allocator, a per-process address space (ppgtt), the global address space
//! (ggtt), the physical image behind both and the deferred-release store.
//!
//! Lock order is address space, then image.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use simgpu_core::{Error, GpuAddr, MemoryBank, PageEntryBits, Result, TaskTimeline};
use spin::Mutex;

use crate::bank::{BankConfig, PhysicalAddressAllocator};
use crate::image::PhysicalImage;
use crate::layout::TranslationLayout;
use crate::page_table::PageTable;
use crate::storage::{AllocationList, AllocationStorage, DropReleaser, MemoryReleaser, TrackedAllocation};

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Memory configuration of a simulated device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryConfig {
    /// Physical bank layout
    pub banks: BankConfig,
    /// Per-process address space shape
    pub ppgtt: TranslationLayout,
    /// Global address space shape
    pub ggtt: TranslationLayout,
}

impl MemoryConfig {
    /// 32-bit device with a single memory pool
    pub const fn narrow() -> Self {
        Self {
            banks: BankConfig::single_pool(),
            ppgtt: TranslationLayout::narrow(),
            ggtt: TranslationLayout::narrow(),
        }
    }

    /// 48-bit device with a single memory pool
    pub const fn wide() -> Self {
        Self {
            banks: BankConfig::single_pool(),
            ppgtt: TranslationLayout::wide(),
            ggtt: TranslationLayout::narrow(),
        }
    }

    /// Same address spaces over a different bank layout
    pub const fn with_banks(mut self, banks: BankConfig) -> Self {
        self.banks = banks;
        self
    }

    /// Check every part can be built
    pub fn validate(&self) -> Result<()> {
        self.banks.validate()?;
        self.ppgtt.validate()?;
        self.ggtt.validate()
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self::wide()
    }
}

// =============================================================================
// SIMULATED MEMORY
// =============================================================================

/// Memory of one simulated device
pub struct SimulatedMemory<A, R = DropReleaser>
where
    A: TrackedAllocation,
    R: MemoryReleaser<A>,
{
    allocator: Arc<PhysicalAddressAllocator>,
    ppgtt: Mutex<PageTable>,
    ggtt: Mutex<PageTable>,
    image: Mutex<PhysicalImage>,
    timeline: Arc<TaskTimeline>,
    storage: AllocationStorage<A, R>,
}

impl<A, R> SimulatedMemory<A, R>
where
    A: TrackedAllocation,
    R: MemoryReleaser<A>,
{
    /// Bring up device memory
    pub fn new(config: MemoryConfig, releaser: R) -> Result<Self> {
        config.validate()?;

        let allocator = Arc::new(PhysicalAddressAllocator::with_banks(config.banks)?);
        let ppgtt = PageTable::new(config.ppgtt, allocator.clone())?;
        let ggtt = PageTable::new(config.ggtt, allocator.clone())?;
        let timeline = Arc::new(TaskTimeline::new());

        log::info!(
            "simulated memory: ppgtt {}-bit, ggtt {}-bit, {} banks",
            config.ppgtt.address_bits(),
            config.ggtt.address_bits(),
            config.banks.bank_count
        );

        Ok(Self {
            allocator,
            ppgtt: Mutex::new(ppgtt),
            ggtt: Mutex::new(ggtt),
            image: Mutex::new(PhysicalImage::new()),
            storage: AllocationStorage::new(timeline.clone(), releaser),
            timeline,
        })
    }

    /// Get the physical allocator
    pub fn allocator(&self) -> &Arc<PhysicalAddressAllocator> {
        &self.allocator
    }

    /// Get the per-process address space
    pub fn ppgtt(&self) -> &Mutex<PageTable> {
        &self.ppgtt
    }

    /// Get the global address space
    pub fn ggtt(&self) -> &Mutex<PageTable> {
        &self.ggtt
    }

    /// Get the device timeline
    pub fn timeline(&self) -> &Arc<TaskTimeline> {
        &self.timeline
    }

    /// Get the deferred-release store
    pub fn storage(&self) -> &AllocationStorage<A, R> {
        &self.storage
    }

    /// Number of 4 KiB image chunks holding data
    pub fn resident_chunks(&self) -> usize {
        self.image.lock().resident_chunks()
    }

    fn write_through(
        &self,
        table: &Mutex<PageTable>,
        gpu_addr: GpuAddr,
        data: &[u8],
        bank: MemoryBank,
        bits: Option<PageEntryBits>,
    ) {
        let mut table = table.lock();
        let mut image = self.image.lock();
        table.page_walk(gpu_addr, data.len() as u64, bits, bank, |segment| {
            let start = segment.offset as usize;
            let end = start + segment.length as usize;
            image.write(segment.bank, segment.physical, &data[start..end]);
        });
    }

    /// Write `data` at `gpu_addr` in the per-process address space
    ///
    /// Pages not yet mapped are backed from `bank`.
    pub fn write_memory(&self, gpu_addr: GpuAddr, data: &[u8], bank: MemoryBank, bits: Option<PageEntryBits>) {
        self.write_through(&self.ppgtt, gpu_addr, data, bank, bits);
    }

    /// Write `data` at `gpu_addr` in the global address space
    pub fn write_ggtt(&self, gpu_addr: GpuAddr, data: &[u8], bank: MemoryBank) {
        let bits = PageEntryBits::WRITABLE;
        let bits = if bank.is_main() {
            bits
        } else {
            bits | PageEntryBits::LOCAL_MEMORY
        };
        self.write_through(&self.ggtt, gpu_addr, data, bank, Some(bits));
    }

    /// Read `len` bytes at `gpu_addr` in the per-process address space
    ///
    /// Unmapped pages are mapped from the main pool and read as zeros.
    pub fn read_memory(&self, gpu_addr: GpuAddr, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        let mut ppgtt = self.ppgtt.lock();
        let image = self.image.lock();
        ppgtt.page_walk(gpu_addr, len as u64, None, MemoryBank::Main, |segment| {
            let start = segment.offset as usize;
            let end = start + segment.length as usize;
            image.read(segment.bank, segment.physical, &mut buf[start..end]);
        });
        buf
    }

    /// Compare memory at `gpu_addr` with `expected`
    pub fn expect_memory(&self, gpu_addr: GpuAddr, expected: &[u8]) -> Result<()> {
        let actual = self.read_memory(gpu_addr, expected.len());
        match actual.iter().zip(expected).position(|(a, e)| a != e) {
            Some(offset) => {
                log::debug!("simulated memory: mismatch at {} + {:#x}", gpu_addr, offset);
                Err(Error::Mismatch {
                    offset: offset as u64,
                })
            },
            None => Ok(()),
        }
    }

    /// Submit work referencing `records`
    ///
    /// Issues the next task count and parks the records on the temporary
    /// list until the device reports it. Returns the task count.
    pub fn flush<I>(&self, records: I) -> u64
    where
        I: IntoIterator<Item = A>,
    {
        let task = self.timeline.issue();
        for record in records {
            self.storage.store(record, AllocationList::Temporary, Some(task));
        }
        log::debug!("simulated memory: flushed task {}", task);
        task
    }

    /// Hand a record back for later reuse
    pub fn recycle(&self, record: A) {
        self.storage.store(record, AllocationList::Reusable, None);
    }

    /// Record device progress and release temporaries it covers
    pub fn poll_completion(&self, value: u64) -> usize {
        self.timeline.signal(value);
        self.storage.reclaim_completed(AllocationList::Temporary)
    }

    /// Reuse an idle recycled record of at least `size` bytes
    pub fn obtain_buffer(&self, size: u64, internal_only: bool) -> Option<A> {
        self.storage
            .obtain_for_reuse(size, self.timeline.completed(), internal_only)
    }
}

impl<A, R> core::fmt::Debug for SimulatedMemory<A, R>
where
    A: TrackedAllocation,
    R: MemoryReleaser<A>,
{
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SimulatedMemory")
            .field("allocator", &self.allocator)
            .field("timeline", &self.timeline)
            .field("storage", &self.storage)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use simgpu_core::ByteSize;

    use super::*;

    #[derive(Debug)]
    struct Buffer {
        marker: u64,
        capacity: u64,
        internal: bool,
    }

    impl TrackedAllocation for Buffer {
        fn completion_marker(&self) -> u64 {
            self.marker
        }

        fn set_completion_marker(&mut self, marker: u64) {
            self.marker = marker;
        }

        fn capacity(&self) -> u64 {
            self.capacity
        }

        fn is_internal(&self) -> bool {
            self.internal
        }
    }

    fn buffer(capacity: u64) -> Buffer {
        Buffer {
            marker: 0,
            capacity,
            internal: false,
        }
    }

    fn device() -> SimulatedMemory<Buffer> {
        SimulatedMemory::new(MemoryConfig::wide(), DropReleaser).expect("valid config")
    }

    #[test]
    fn test_write_then_read_across_pages() {
        let memory = device();
        let addr = GpuAddr::new(0x1_0000_0ff0);
        let data: Vec<u8> = (0..0x2100u32).map(|i| i as u8).collect();

        memory.write_memory(addr, &data, MemoryBank::Main, Some(PageEntryBits::WRITABLE));
        assert_eq!(memory.read_memory(addr, data.len()), data);
        assert!(memory.expect_memory(addr, &data).is_ok());
        assert_eq!(memory.ppgtt().lock().stats().pages, 4);
    }

    #[test]
    fn test_expect_reports_first_mismatch() {
        let memory = device();
        let addr = GpuAddr::new(0x40_0000);
        memory.write_memory(addr, &[1, 2, 3, 4], MemoryBank::Main, None);
        assert_eq!(
            memory.expect_memory(addr, &[1, 2, 9, 4]),
            Err(Error::Mismatch { offset: 2 })
        );
    }

    #[test]
    fn test_unwritten_memory_reads_zero() {
        let memory = device();
        assert_eq!(memory.read_memory(GpuAddr::new(0x9000), 8), [0u8; 8]);
        assert_eq!(memory.resident_chunks(), 0);
    }

    #[test]
    fn test_address_spaces_are_independent() {
        let memory = device();
        let addr = GpuAddr::new(0x20_0000);
        memory.write_memory(addr, &[0xaa; 4], MemoryBank::Main, None);
        memory.write_ggtt(addr, &[0x55; 4], MemoryBank::Main);

        assert!(memory.expect_memory(addr, &[0xaa; 4]).is_ok());
        let ppgtt_page = memory.ppgtt().lock().translate(addr);
        let ggtt_page = memory.ggtt().lock().translate(addr);
        assert!(ppgtt_page.is_some());
        assert_ne!(ppgtt_page, ggtt_page);
        assert_eq!(memory.resident_chunks(), 2);
    }

    #[test]
    fn test_local_bank_backing() {
        let config = MemoryConfig::wide().with_banks(BankConfig::tiles(2, ByteSize::from_mib(4)));
        let memory: SimulatedMemory<Buffer> = SimulatedMemory::new(config, DropReleaser).expect("valid config");
        let addr = GpuAddr::new(0x1000_0000);

        memory.write_memory(addr, &[7; 16], MemoryBank::Local(1), Some(PageEntryBits::LOCAL_MEMORY));
        let entry = memory.ppgtt().lock().entry(addr).expect("mapped");
        assert_eq!(entry.bank, MemoryBank::Local(1));
        assert!(entry.base >= 0x40_0000 && entry.base < 0x80_0000);
        assert!(memory.expect_memory(addr, &[7; 16]).is_ok());

        memory.write_ggtt(GpuAddr::new(0x3000), &[1], MemoryBank::Local(0));
        let entry = memory.ggtt().lock().entry(GpuAddr::new(0x3000)).expect("mapped");
        assert!(entry.bits.is_local_memory());
    }

    #[test]
    fn test_local_writes_on_single_pool_land_in_main() {
        let memory = device();
        let local = GpuAddr::new(0x5000);
        let main = GpuAddr::new(0x6000);
        memory.write_memory(local, &[3; 8], MemoryBank::Local(2), None);
        memory.write_memory(main, &[4; 8], MemoryBank::Main, None);

        let entry = memory.ppgtt().lock().entry(local).expect("mapped");
        assert_eq!(entry.bank, MemoryBank::Main);
        assert!(memory.expect_memory(local, &[3; 8]).is_ok());
        assert!(memory.expect_memory(main, &[4; 8]).is_ok());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = MemoryConfig::narrow().with_banks(BankConfig::tiles(2, ByteSize::from_bytes(0x1800)));
        let err = SimulatedMemory::<Buffer>::new(config, DropReleaser).unwrap_err();
        assert_eq!(err, Error::InvalidConfiguration);

        let mut config = MemoryConfig::narrow();
        config.ggtt.levels = 6;
        assert_eq!(config.validate(), Err(Error::InvalidConfiguration));
    }

    #[test]
    fn test_flush_and_poll() {
        let memory = device();
        let first = memory.flush([buffer(0x1000), buffer(0x2000)]);
        let second = memory.flush([buffer(0x1000)]);
        assert_eq!((first, second), (1, 2));
        assert_eq!(memory.storage().len(AllocationList::Temporary), 3);

        assert_eq!(memory.poll_completion(1), 2);
        assert_eq!(memory.poll_completion(1), 0);
        assert_eq!(memory.poll_completion(2), 1);
        assert!(memory.storage().is_empty(AllocationList::Temporary));
    }

    #[test]
    fn test_recycled_buffer_waits_for_device() {
        let memory = device();
        memory.flush([]);
        memory.recycle(Buffer {
            marker: 0,
            capacity: 0x10000,
            internal: true,
        });

        // Task 1 may still use it
        assert!(memory.obtain_buffer(0x1000, false).is_none());

        memory.poll_completion(1);
        assert!(memory.obtain_buffer(0x20000, false).is_none());
        let reused = memory.obtain_buffer(0x1000, true).expect("idle buffer");
        assert_eq!(reused.capacity, 0x10000);
        assert_eq!(reused.marker, 1);
    }

    #[test]
    fn test_concurrent_writers() {
        let memory = device();
        std::thread::scope(|s| {
            for t in 0..4u64 {
                let memory = &memory;
                s.spawn(move || {
                    let addr = GpuAddr::new(0x100_0000 * (t + 1));
                    memory.write_memory(addr, &[t as u8 + 1; 0x3000], MemoryBank::Main, None);
                });
            }
        });

        for t in 0..4u64 {
            let addr = GpuAddr::new(0x100_0000 * (t + 1));
            assert!(memory.expect_memory(addr, &[t as u8 + 1; 0x3000]).is_ok());
        }
        assert_eq!(memory.allocator().pages_reserved(), 12);
    }
}
