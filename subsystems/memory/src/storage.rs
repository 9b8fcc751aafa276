//! # Allocation Record Store
//!
//! Holds device allocations the host has let go of while the simulated
//! device may still be using them.
//!
//! Two ordered lists:
//! - **temporary**: released once the device passes their completion marker
//! - **reusable**: handed back out for new work, or released the same way
//!
//! A record is owned by exactly one of the caller, the temporary list or the
//! reusable list at any instant. One lock covers both lists; records are
//! detached under the lock and handed to the releaser after it drops.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use simgpu_core::TaskTimeline;
use spin::Mutex;

// =============================================================================
// TRACKED ALLOCATION
// =============================================================================

/// An allocation whose lifetime follows device progress
pub trait TrackedAllocation: Send {
    /// Task count the device must reach before the allocation is idle
    fn completion_marker(&self) -> u64;

    /// Overwrite the completion marker
    fn set_completion_marker(&mut self, marker: u64);

    /// Usable bytes
    fn capacity(&self) -> u64;

    /// Created by the runtime for its own use rather than for a client
    fn is_internal(&self) -> bool {
        false
    }

    /// Host pointer wrapped by the allocation, if any
    fn host_address(&self) -> Option<u64> {
        None
    }
}

// =============================================================================
// RELEASER
// =============================================================================

/// Final destination of records leaving the store
pub trait MemoryReleaser<A>: Send + Sync {
    /// Return the allocation's memory
    fn release(&self, allocation: A);
}

/// Releases by dropping the record
#[derive(Debug, Clone, Copy, Default)]
pub struct DropReleaser;

impl<A> MemoryReleaser<A> for DropReleaser {
    fn release(&self, allocation: A) {
        drop(allocation);
    }
}

impl<A, R: MemoryReleaser<A>> MemoryReleaser<A> for Arc<R> {
    fn release(&self, allocation: A) {
        (**self).release(allocation);
    }
}

// =============================================================================
// LISTS
// =============================================================================

/// Which list a record lives on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocationList {
    /// Freed once the device catches up
    Temporary,
    /// Kept around for reuse
    Reusable,
}

impl fmt::Display for AllocationList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Temporary => write!(f, "temporary"),
            Self::Reusable => write!(f, "reusable"),
        }
    }
}

/// Storage statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageStats {
    /// Records stored
    pub stored: u64,
    /// Records handed to the releaser
    pub released: u64,
    /// Records taken back out for reuse
    pub reused: u64,
}

struct Lists<A> {
    temporary: Vec<A>,
    reusable: Vec<A>,
    stats: StorageStats,
}

impl<A> Lists<A> {
    fn get(&self, list: AllocationList) -> &Vec<A> {
        match list {
            AllocationList::Temporary => &self.temporary,
            AllocationList::Reusable => &self.reusable,
        }
    }

    fn get_mut(&mut self, list: AllocationList) -> &mut Vec<A> {
        match list {
            AllocationList::Temporary => &mut self.temporary,
            AllocationList::Reusable => &mut self.reusable,
        }
    }
}

// =============================================================================
// ALLOCATION STORAGE
// =============================================================================

/// Deferred-release store for device allocations
pub struct AllocationStorage<A, R = DropReleaser>
where
    A: TrackedAllocation,
    R: MemoryReleaser<A>,
{
    /// Device progress
    timeline: Arc<TaskTimeline>,
    /// Where released records go
    releaser: R,
    /// Both lists under one lock
    lists: Mutex<Lists<A>>,
}

impl<A, R> AllocationStorage<A, R>
where
    A: TrackedAllocation,
    R: MemoryReleaser<A>,
{
    /// Create an empty store
    pub fn new(timeline: Arc<TaskTimeline>, releaser: R) -> Self {
        Self {
            timeline,
            releaser,
            lists: Mutex::new(Lists {
                temporary: Vec::new(),
                reusable: Vec::new(),
                stats: StorageStats::default(),
            }),
        }
    }

    /// Get the timeline markers are compared against
    pub fn timeline(&self) -> &Arc<TaskTimeline> {
        &self.timeline
    }

    /// Append a record to the tail of `list`
    ///
    /// The stored marker is `marker` when given. Otherwise temporary records
    /// keep their own marker and reusable records take the latest issued
    /// task count, since any submission so far may still reference them.
    pub fn store(&self, mut allocation: A, list: AllocationList, marker: Option<u64>) {
        let marker = marker.unwrap_or_else(|| match list {
            AllocationList::Temporary => allocation.completion_marker(),
            AllocationList::Reusable => self.timeline.issued(),
        });
        allocation.set_completion_marker(marker);

        log::debug!(
            "storage: {} record ({:#x} bytes) stored until {}",
            list,
            allocation.capacity(),
            marker
        );

        let mut lists = self.lists.lock();
        lists.get_mut(list).push(allocation);
        lists.stats.stored += 1;
    }

    /// Release every record in `list` whose marker is at most `observed`
    ///
    /// Survivors keep their relative order. Returns the number released.
    pub fn reclaim(&self, observed: u64, list: AllocationList) -> usize {
        self.reclaim_where(list, |allocation| allocation.completion_marker() <= observed)
    }

    /// Release against the timeline's latest completion value
    pub fn reclaim_completed(&self, list: AllocationList) -> usize {
        self.reclaim(self.timeline.completed(), list)
    }

    /// Release everything in `list` regardless of markers
    pub fn reclaim_all(&self, list: AllocationList) -> usize {
        self.reclaim_where(list, |_| true)
    }

    fn reclaim_where<F>(&self, list: AllocationList, mut idle: F) -> usize
    where
        F: FnMut(&A) -> bool,
    {
        let released: Vec<A> = {
            let mut lists = self.lists.lock();
            let records = lists.get_mut(list);
            if records.is_empty() {
                return 0;
            }

            let (released, kept): (Vec<A>, Vec<A>) =
                core::mem::take(records).into_iter().partition(|a| idle(a));
            *records = kept;
            lists.stats.released += released.len() as u64;
            released
        };

        let count = released.len();
        if count > 0 {
            log::debug!("storage: {} {} records released", count, list);
        }
        for allocation in released {
            self.releaser.release(allocation);
        }
        count
    }

    /// Detach the first reusable record fitting `required_size` whose marker
    /// is at most `marker_bound`
    ///
    /// With `internal_only` set only internal records qualify; otherwise any
    /// record does.
    pub fn obtain_for_reuse(&self, required_size: u64, marker_bound: u64, internal_only: bool) -> Option<A> {
        self.detach_first(AllocationList::Reusable, |allocation| {
            allocation.capacity() >= required_size
                && allocation.completion_marker() <= marker_bound
                && (!internal_only || allocation.is_internal())
        })
    }

    /// Detach an idle temporary record wrapping `host_address`
    pub fn obtain_temporary_with_host_ptr(&self, required_size: u64, host_address: u64) -> Option<A> {
        let completed = self.timeline.completed();
        self.detach_first(AllocationList::Temporary, |allocation| {
            allocation.host_address() == Some(host_address)
                && allocation.capacity() >= required_size
                && allocation.completion_marker() <= completed
        })
    }

    fn detach_first<F>(&self, list: AllocationList, matches: F) -> Option<A>
    where
        F: Fn(&A) -> bool,
    {
        let mut lists = self.lists.lock();
        let records = lists.get_mut(list);
        let position = records.iter().position(matches)?;
        let allocation = records.remove(position);
        lists.stats.reused += 1;

        log::debug!(
            "storage: {} record ({:#x} bytes) taken for reuse",
            list,
            allocation.capacity()
        );
        Some(allocation)
    }

    /// Check if `list` holds no records
    pub fn is_empty(&self, list: AllocationList) -> bool {
        self.lists.lock().get(list).is_empty()
    }

    /// Number of records in `list`
    pub fn len(&self, list: AllocationList) -> usize {
        self.lists.lock().get(list).len()
    }

    /// Get statistics
    pub fn stats(&self) -> StorageStats {
        self.lists.lock().stats.clone()
    }
}

impl<A, R> Drop for AllocationStorage<A, R>
where
    A: TrackedAllocation,
    R: MemoryReleaser<A>,
{
    fn drop(&mut self) {
        let lists = self.lists.get_mut();
        let remaining = lists.temporary.len() + lists.reusable.len();
        if remaining > 0 {
            log::debug!("storage: releasing {} records on teardown", remaining);
        }
        for allocation in lists.temporary.drain(..).chain(lists.reusable.drain(..)) {
            self.releaser.release(allocation);
        }
    }
}

impl<A, R> fmt::Debug for AllocationStorage<A, R>
where
    A: TrackedAllocation,
    R: MemoryReleaser<A>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lists = self.lists.lock();
        f.debug_struct("AllocationStorage")
            .field("temporary", &lists.temporary.len())
            .field("reusable", &lists.reusable.len())
            .field("stats", &lists.stats)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::vec::Vec;

    use super::*;

    #[derive(Debug)]
    struct Buffer {
        id: u32,
        marker: u64,
        capacity: u64,
        internal: bool,
        host: Option<u64>,
    }

    impl Buffer {
        fn new(id: u32, marker: u64, capacity: u64) -> Self {
            Self {
                id,
                marker,
                capacity,
                internal: false,
                host: None,
            }
        }

        fn internal(mut self) -> Self {
            self.internal = true;
            self
        }

        fn wrapping(mut self, host: u64) -> Self {
            self.host = Some(host);
            self
        }
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

        fn host_address(&self) -> Option<u64> {
            self.host
        }
    }

    #[derive(Default)]
    struct Recorder {
        released: Mutex<Vec<(u32, u64)>>,
    }

    impl Recorder {
        fn ids(&self) -> Vec<u32> {
            self.released.lock().iter().map(|(id, _)| *id).collect()
        }
    }

    impl MemoryReleaser<Buffer> for Recorder {
        fn release(&self, allocation: Buffer) {
            self.released.lock().push((allocation.id, allocation.marker));
        }
    }

    fn storage() -> (AllocationStorage<Buffer, Arc<Recorder>>, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let storage = AllocationStorage::new(Arc::new(TaskTimeline::new()), recorder.clone());
        (storage, recorder)
    }

    #[test]
    fn test_temporary_waits_for_its_marker() {
        let (storage, recorder) = storage();
        storage.store(Buffer::new(1, 5, 0x1000), AllocationList::Temporary, None);

        assert_eq!(storage.reclaim(4, AllocationList::Temporary), 0);
        assert_eq!(storage.len(AllocationList::Temporary), 1);
        assert!(recorder.ids().is_empty());

        assert_eq!(storage.reclaim(5, AllocationList::Temporary), 1);
        assert!(storage.is_empty(AllocationList::Temporary));
        assert_eq!(recorder.ids(), [1]);
    }

    #[test]
    fn test_reclaim_keeps_survivor_order() {
        let (storage, recorder) = storage();
        for (id, marker) in [(1, 3), (2, 9), (3, 1), (4, 7), (5, 2)] {
            storage.store(Buffer::new(id, marker, 0x1000), AllocationList::Temporary, None);
        }

        assert_eq!(storage.reclaim(3, AllocationList::Temporary), 3);
        assert_eq!(recorder.ids(), [1, 3, 5]);

        // Idempotent
        assert_eq!(storage.reclaim(3, AllocationList::Temporary), 0);

        assert_eq!(storage.reclaim(8, AllocationList::Temporary), 1);
        assert_eq!(recorder.ids(), [1, 3, 5, 4]);
        assert_eq!(storage.len(AllocationList::Temporary), 1);
    }

    #[test]
    fn test_reclaim_of_empty_list() {
        let (storage, _) = storage();
        assert_eq!(storage.reclaim(u64::MAX, AllocationList::Reusable), 0);
        assert_eq!(storage.stats(), StorageStats::default());
    }

    #[test]
    fn test_reclaim_only_touches_named_list() {
        let (storage, recorder) = storage();
        storage.store(Buffer::new(1, 1, 0x1000), AllocationList::Temporary, None);
        storage.store(Buffer::new(2, 0, 0x1000), AllocationList::Reusable, Some(1));

        assert_eq!(storage.reclaim(10, AllocationList::Reusable), 1);
        assert_eq!(recorder.ids(), [2]);
        assert_eq!(storage.len(AllocationList::Temporary), 1);
    }

    #[test]
    fn test_marker_override_and_defaults() {
        let (storage, _) = storage();
        storage.timeline().issue();
        storage.timeline().issue();

        storage.store(Buffer::new(1, 0, 0x1000), AllocationList::Reusable, None);
        storage.store(Buffer::new(2, 4, 0x1000), AllocationList::Temporary, None);
        storage.store(Buffer::new(3, 4, 0x1000), AllocationList::Temporary, Some(9));

        let reused = storage.obtain_for_reuse(0, u64::MAX, false).expect("reusable record");
        assert_eq!(reused.marker, 2);

        assert_eq!(storage.reclaim(4, AllocationList::Temporary), 1);
        assert_eq!(storage.reclaim(8, AllocationList::Temporary), 0);
        assert_eq!(storage.reclaim(9, AllocationList::Temporary), 1);
    }

    #[test]
    fn test_reuse_respects_bound_and_size() {
        let (storage, _) = storage();
        storage.store(Buffer::new(1, 0, 0x1000), AllocationList::Reusable, Some(2));
        storage.store(Buffer::new(2, 0, 0x10000), AllocationList::Reusable, Some(8));
        storage.store(Buffer::new(3, 0, 0x10000), AllocationList::Reusable, Some(3));

        // Too big for anything
        assert!(storage.obtain_for_reuse(0x20000, u64::MAX, false).is_none());
        // Large enough ones are still busy
        assert!(storage.obtain_for_reuse(0x8000, 2, false).is_none());

        let reused = storage.obtain_for_reuse(0x8000, 5, false).expect("idle record");
        assert_eq!(reused.id, 3);
        assert!(reused.marker <= 5);
        assert!(reused.capacity >= 0x8000);
        assert_eq!(storage.len(AllocationList::Reusable), 2);
        assert_eq!(storage.stats().reused, 1);
    }

    #[test]
    fn test_reuse_takes_first_match() {
        let (storage, _) = storage();
        for id in 1..=3 {
            storage.store(Buffer::new(id, 0, 0x1000), AllocationList::Reusable, Some(1));
        }
        let ids: Vec<u32> = (0..3)
            .filter_map(|_| storage.obtain_for_reuse(0x1000, 1, false))
            .map(|b| b.id)
            .collect();
        assert_eq!(ids, [1, 2, 3]);
        assert!(storage.obtain_for_reuse(0x1000, 1, false).is_none());
    }

    #[test]
    fn test_internal_only_reuse() {
        let (storage, _) = storage();
        storage.store(Buffer::new(1, 0, 0x1000), AllocationList::Reusable, Some(0));
        storage.store(Buffer::new(2, 0, 0x1000).internal(), AllocationList::Reusable, Some(0));

        let internal = storage.obtain_for_reuse(0x1000, 0, true).expect("internal record");
        assert_eq!(internal.id, 2);
        assert!(storage.obtain_for_reuse(0x1000, 0, true).is_none());

        let any = storage.obtain_for_reuse(0x1000, 0, false).expect("any record");
        assert_eq!(any.id, 1);
    }

    #[test]
    fn test_temporary_host_pointer_lookup() {
        let (storage, _) = storage();
        storage.store(Buffer::new(1, 3, 0x1000).wrapping(0xdead_0000), AllocationList::Temporary, None);
        storage.store(Buffer::new(2, 1, 0x1000).wrapping(0xbeef_0000), AllocationList::Temporary, None);

        // Still in flight
        assert!(storage.obtain_temporary_with_host_ptr(0x1000, 0xdead_0000).is_none());

        storage.timeline().signal(3);
        assert!(storage.obtain_temporary_with_host_ptr(0x2000, 0xdead_0000).is_none());
        let found = storage
            .obtain_temporary_with_host_ptr(0x800, 0xdead_0000)
            .expect("idle wrapper");
        assert_eq!(found.id, 1);
        assert_eq!(storage.len(AllocationList::Temporary), 1);
    }

    #[test]
    fn test_reclaim_all_and_completed() {
        let (storage, recorder) = storage();
        storage.store(Buffer::new(1, 2, 0x1000), AllocationList::Temporary, None);
        storage.store(Buffer::new(2, 6, 0x1000), AllocationList::Temporary, None);
        storage.store(Buffer::new(3, u64::MAX, 0x1000), AllocationList::Temporary, None);

        storage.timeline().signal(2);
        assert_eq!(storage.reclaim_completed(AllocationList::Temporary), 1);
        assert_eq!(storage.reclaim_all(AllocationList::Temporary), 2);
        assert_eq!(recorder.ids(), [1, 2, 3]);
        assert_eq!(storage.stats().released, 3);
    }

    #[test]
    fn test_drop_releases_remaining_records() {
        let (storage, recorder) = storage();
        storage.store(Buffer::new(1, 100, 0x1000), AllocationList::Temporary, None);
        storage.store(Buffer::new(2, 0, 0x1000), AllocationList::Reusable, Some(100));
        drop(storage);

        let mut ids = recorder.ids();
        ids.sort_unstable();
        assert_eq!(ids, [1, 2]);
    }

    #[test]
    fn test_drop_releaser_default() {
        let storage: AllocationStorage<Buffer> = AllocationStorage::new(Arc::new(TaskTimeline::new()), DropReleaser);
        storage.store(Buffer::new(1, 1, 0x1000), AllocationList::Temporary, None);
        assert_eq!(storage.reclaim(1, AllocationList::Temporary), 1);
    }

    struct Checked {
        timeline: Arc<TaskTimeline>,
        released: Mutex<Vec<u32>>,
    }

    impl MemoryReleaser<Buffer> for Checked {
        fn release(&self, allocation: Buffer) {
            assert!(allocation.marker <= self.timeline.completed());
            self.released.lock().push(allocation.id);
        }
    }

    #[test]
    fn test_concurrent_store_never_releases_early() {
        let timeline = Arc::new(TaskTimeline::new());
        let checked = Arc::new(Checked {
            timeline: timeline.clone(),
            released: Mutex::new(Vec::new()),
        });
        let storage = AllocationStorage::new(timeline.clone(), checked.clone());

        std::thread::scope(|s| {
            for t in 0..4u32 {
                let storage = &storage;
                s.spawn(move || {
                    for i in 0..100u32 {
                        let marker = u64::from(i % 50) + 1;
                        storage.store(Buffer::new(t * 100 + i, marker, 0x1000), AllocationList::Temporary, None);
                    }
                });
            }
            let storage = &storage;
            let timeline = &timeline;
            s.spawn(move || {
                for value in 1..=50 {
                    timeline.signal(value);
                    storage.reclaim_completed(AllocationList::Temporary);
                }
            });
        });

        storage.reclaim_completed(AllocationList::Temporary);
        assert!(storage.is_empty(AllocationList::Temporary));
        assert_eq!(checked.released.lock().len(), 400);
    }
}
