use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

/// Hooks for observing the locking and id-allocation protocols.
///
/// Implementations are shared across threads and called on hot paths, so they
/// should not block.
pub trait ClaimMetrics: Send + Sync {
    /// Records a claim column written to the lock store.
    fn lock_written(&self);

    /// Records a successful seniority check of a claim.
    fn lock_checked(&self);

    /// Records a lock attempt that lost to another holder, locally or remotely.
    fn lock_contended(&self);

    /// Records a lock released by its transaction.
    fn lock_released(&self);

    /// Records an id block handed out by the authority.
    ///
    /// # Parameters
    /// * `len` - Number of ids in the block.
    fn block_allocated(&self, len: u64);

    /// Records a `(partition, namespace)` scope reported as exhausted.
    fn partition_exhausted(&self);

    /// Records a retry of a store call after a temporary failure.
    fn backend_retry(&self);
}

/// A no-op implementation of [`ClaimMetrics`] that discards all recorded metrics.
#[derive(Default)]
pub struct NoopMetrics;

impl ClaimMetrics for NoopMetrics {
    fn lock_written(&self) {}
    fn lock_checked(&self) {}
    fn lock_contended(&self) {}
    fn lock_released(&self) {}
    fn block_allocated(&self, _len: u64) {}
    fn partition_exhausted(&self) {}
    fn backend_retry(&self) {}
}

/// A thread-safe counter-based implementation of [`ClaimMetrics`].
#[derive(Default)]
pub struct CounterMetrics {
    /// Number of claim columns written.
    pub locks_written: AtomicU64,

    /// Number of claims that passed a seniority check.
    pub locks_checked: AtomicU64,

    /// Number of lock attempts lost to another holder.
    pub locks_contended: AtomicU64,

    /// Number of locks released.
    pub locks_released: AtomicU64,

    /// Number of id blocks allocated.
    pub blocks_allocated: AtomicU64,

    /// Total ids across all allocated blocks.
    pub ids_allocated: AtomicU64,

    /// Number of scopes reported exhausted.
    pub partitions_exhausted: AtomicU64,

    /// Number of store calls retried after a temporary failure.
    pub backend_retries: AtomicU64,
}

/// Point-in-time copy of a [`CounterMetrics`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub locks_written: u64,
    pub locks_checked: u64,
    pub locks_contended: u64,
    pub locks_released: u64,
    pub blocks_allocated: u64,
    pub ids_allocated: u64,
    pub partitions_exhausted: u64,
    pub backend_retries: u64,
}

impl CounterMetrics {
    /// Reads every counter. Counters are loaded independently, so a snapshot
    /// taken under load is not a consistent cut.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            locks_written: self.locks_written.load(Ordering::Relaxed),
            locks_checked: self.locks_checked.load(Ordering::Relaxed),
            locks_contended: self.locks_contended.load(Ordering::Relaxed),
            locks_released: self.locks_released.load(Ordering::Relaxed),
            blocks_allocated: self.blocks_allocated.load(Ordering::Relaxed),
            ids_allocated: self.ids_allocated.load(Ordering::Relaxed),
            partitions_exhausted: self.partitions_exhausted.load(Ordering::Relaxed),
            backend_retries: self.backend_retries.load(Ordering::Relaxed),
        }
    }
}

impl ClaimMetrics for CounterMetrics {
    fn lock_written(&self) {
        self.locks_written.fetch_add(1, Ordering::Relaxed);
    }

    fn lock_checked(&self) {
        self.locks_checked.fetch_add(1, Ordering::Relaxed);
    }

    fn lock_contended(&self) {
        self.locks_contended.fetch_add(1, Ordering::Relaxed);
    }

    fn lock_released(&self) {
        self.locks_released.fetch_add(1, Ordering::Relaxed);
    }

    fn block_allocated(&self, len: u64) {
        self.blocks_allocated.fetch_add(1, Ordering::Relaxed);
        self.ids_allocated.fetch_add(len, Ordering::Relaxed);
    }

    fn partition_exhausted(&self) {
        self.partitions_exhausted.fetch_add(1, Ordering::Relaxed);
    }

    fn backend_retry(&self) {
        self.backend_retries.fetch_add(1, Ordering::Relaxed);
    }
}

/// Returns the default metrics implementation wrapped in an [`Arc`].
///
/// The default implementation is [`NoopMetrics`], which has zero overhead
/// as it discards all recorded metrics.
pub fn default_metrics() -> Arc<dyn ClaimMetrics> {
    Arc::new(NoopMetrics)
}
