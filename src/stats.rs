//! Pool-wide counters and their JSON-exportable snapshot. Mirrors the
//! teacher's "atomics plus a `#[cold]` snapshot method" shape used
//! throughout its buffer pool statistics structs.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct PoolStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub page_reads: AtomicU64,
    pub page_writes: AtomicU64,
    pub flushes: AtomicU64,
    pub checkpoints_completed: AtomicU64,
    pub bgwriter_buffers_written: AtomicU64,
}

impl PoolStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// `evictions`/`failed_evictions` are the clock sweep's own counters
    /// (the only place eviction attempts actually happen), folded in here
    /// rather than duplicated as separate atomics that nothing would ever
    /// write to.
    #[cold]
    pub fn snapshot(&self, evictions: u64, failed_evictions: u64) -> PoolStatsSnapshot {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        PoolStatsSnapshot {
            hits,
            misses,
            hit_rate: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
            evictions,
            failed_evictions,
            page_reads: self.page_reads.load(Ordering::Relaxed),
            page_writes: self.page_writes.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            checkpoints_completed: self.checkpoints_completed.load(Ordering::Relaxed),
            bgwriter_buffers_written: self.bgwriter_buffers_written.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PoolStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub evictions: u64,
    pub failed_evictions: u64,
    pub page_reads: u64,
    pub page_writes: u64,
    pub flushes: u64,
    pub checkpoints_completed: u64,
    pub bgwriter_buffers_written: u64,
}
