use std::sync::atomic::{AtomicU64, Ordering};

/// Per-worker outcome counters, shared with the coordinator for aggregation
/// at shutdown.
#[derive(Default)]
pub struct WorkerStats {
    pub n_commit: AtomicU64,
    pub n_abort_lock: AtomicU64,
    pub n_abort_read_validation: AtomicU64,
    pub n_abort_no_retry: AtomicU64,
    pub n_network_size: AtomicU64,
}

impl WorkerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn commits(&self) -> u64 {
        self.n_commit.load(Ordering::Relaxed)
    }

    pub fn aborts(&self) -> u64 {
        self.n_abort_lock.load(Ordering::Relaxed)
            + self.n_abort_read_validation.load(Ordering::Relaxed)
    }
}
