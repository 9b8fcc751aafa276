//! # Synchronization Primitives
//!
//! Task timeline tracking simulated-device progress.

use core::sync::atomic::{AtomicU64, Ordering};

// =============================================================================
// TASK TIMELINE
// =============================================================================

/// Monotonic task counters shared between submitters and the completion poller
///
/// `issued` is the task count of the most recent submission; `completed`
/// is the most recent completion marker observed from the simulated device.
/// Both only ever move forward.
#[derive(Debug, Default)]
pub struct TaskTimeline {
    /// Latest task count handed to a submission
    issued: AtomicU64,
    /// Latest completion value signaled by the device
    completed: AtomicU64,
}

impl TaskTimeline {
    /// Create a timeline with nothing issued or completed
    pub const fn new() -> Self {
        Self {
            issued: AtomicU64::new(0),
            completed: AtomicU64::new(0),
        }
    }

    /// Advance to the next task count and return it
    pub fn issue(&self) -> u64 {
        self.issued.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Latest issued task count
    pub fn issued(&self) -> u64 {
        self.issued.load(Ordering::Acquire)
    }

    /// Latest completed task count
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }

    /// Record device progress; stale values are ignored
    ///
    /// Returns the completion value in effect afterwards.
    pub fn signal(&self, value: u64) -> u64 {
        let previous = self.completed.fetch_max(value, Ordering::AcqRel);
        if value < previous {
            log::trace!("timeline: stale completion {} ignored (at {})", value, previous);
        }
        previous.max(value)
    }

    /// Check if a task count has completed
    pub fn is_completed(&self, value: u64) -> bool {
        self.completed() >= value
    }
}
