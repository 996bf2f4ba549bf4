use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use bitflags::bitflags;

bitflags! {
    /// How in-flight rendering references a resource.
    ///
    /// An empty set means "unused": nothing submitted since the last
    /// synchronization point reads or writes it.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ResourceStatus: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
    }
}

/// Per-resource status bits.
///
/// Only the frontend mutates these (during draw submission, copies, maps and
/// after waiting on a fence). Workers never look at them; a fence wait always
/// precedes any decision that depends on the bits being cleared.
#[derive(Debug, Default)]
pub struct StatusTracker {
    bits: AtomicU8,
    /// Fence value of the submission carrying the most recent use.
    last_use: AtomicU64,
}

impl StatusTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> ResourceStatus {
        ResourceStatus::from_bits_truncate(self.bits.load(Ordering::Acquire))
    }

    /// Record a use by work that fence value `submission` will cover.
    pub fn mark(&self, status: ResourceStatus, submission: u64) {
        self.bits.fetch_or(status.bits(), Ordering::AcqRel);
        self.last_use.fetch_max(submission, Ordering::AcqRel);
    }

    pub fn mark_read(&self, submission: u64) {
        self.mark(ResourceStatus::READ, submission);
    }

    pub fn mark_written(&self, submission: u64) {
        self.mark(ResourceStatus::WRITE, submission);
    }

    /// Fence value that must complete before the most recent use is done.
    pub fn last_use(&self) -> u64 {
        self.last_use.load(Ordering::Acquire)
    }

    /// Forget all references. Only valid once every submission that touched
    /// the resource is known to be complete.
    pub fn mark_unused(&self) {
        self.bits.store(0, Ordering::Release);
    }

    pub fn is_unused(&self) -> bool {
        self.get().is_empty()
    }

    pub fn has_pending_writes(&self) -> bool {
        self.get().contains(ResourceStatus::WRITE)
    }
}
