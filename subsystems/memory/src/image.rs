//! # Physical Image
//!
//! Sparse byte contents of simulated physical memory.
//!
//! Storage is chunked at 4 KiB and keyed by pool and chunk base, so the
//! main pool and each bank are separate address spaces. Chunks appear on
//! first write, zero filled. Untouched memory reads as zeros.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;

use simgpu_core::MemoryBank;

/// Granularity of image storage
pub const CHUNK_SIZE: u64 = 0x1000;

/// Sparse physical memory contents
#[derive(Debug, Default)]
pub struct PhysicalImage {
    chunks: BTreeMap<(MemoryBank, u64), Box<[u8]>>,
}

impl PhysicalImage {
    /// Create an empty image
    pub const fn new() -> Self {
        Self {
            chunks: BTreeMap::new(),
        }
    }

    /// Number of chunks holding data
    pub fn resident_chunks(&self) -> usize {
        self.chunks.len()
    }

    /// Copy `data` to `physical` in `pool`
    pub fn write(&mut self, pool: MemoryBank, physical: u64, data: &[u8]) {
        let mut addr = physical;
        let mut rest = data;
        while !rest.is_empty() {
            let base = addr & !(CHUNK_SIZE - 1);
            let start = (addr - base) as usize;
            let length = rest.len().min(CHUNK_SIZE as usize - start);

            let chunk = self
                .chunks
                .entry((pool, base))
                .or_insert_with(|| alloc::vec![0u8; CHUNK_SIZE as usize].into_boxed_slice());
            chunk[start..start + length].copy_from_slice(&rest[..length]);

            addr += length as u64;
            rest = &rest[length..];
        }
    }

    /// Fill `buf` from `physical` in `pool`
    pub fn read(&self, pool: MemoryBank, physical: u64, buf: &mut [u8]) {
        let mut addr = physical;
        let mut rest = buf;
        while !rest.is_empty() {
            let base = addr & !(CHUNK_SIZE - 1);
            let start = (addr - base) as usize;
            let length = rest.len().min(CHUNK_SIZE as usize - start);

            let (head, tail) = rest.split_at_mut(length);
            match self.chunks.get(&(pool, base)) {
                Some(chunk) => head.copy_from_slice(&chunk[start..start + length]),
                None => head.fill(0),
            }

            addr += length as u64;
            rest = tail;
        }
    }
}
