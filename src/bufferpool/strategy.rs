//! Replacement strategy (C3): global clock sweep plus bounded ring
//! strategies for bulk scans. Adapted from the teacher's
//! `buffer::eviction::ClockEvictionPolicy`, generalized from a single
//! reference bit to the spec's 4-bit usage counter (0-5, decremented on
//! each pass rather than cleared outright).

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use super::descriptor::{BufferDescriptor, BufferId, MAX_USAGE_COUNT};
use crate::error::{BufferPoolError, Result};

/// A full clock sweep decrements usage at most `MAX_USAGE_COUNT` times per
/// buffer before it becomes reusable; bound the search to a small multiple
/// of the table size so a pool saturated with pinned buffers fails fast
/// with `NoUnpinnedBuffersAvailable` rather than spinning forever.
const SWEEP_STEPS_PER_BUFFER: usize = MAX_USAGE_COUNT as usize + 2;

#[derive(Debug, Default)]
pub struct ClockStats {
    pub sweeps: AtomicU64,
    pub evictions: AtomicU64,
    pub failed_evictions: AtomicU64,
}

/// Global clock sweep over the descriptor table, shared by every caller
/// that doesn't use a ring strategy.
pub struct ClockSweep {
    hand: AtomicUsize,
    stats: ClockStats,
}

impl ClockSweep {
    pub fn new() -> Self {
        Self {
            hand: AtomicUsize::new(0),
            stats: ClockStats::default(),
        }
    }

    pub fn hand_position(&self) -> usize {
        self.hand.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> &ClockStats {
        &self.stats
    }

    /// Finds and claims one victim buffer, bumping its refcount to 1 on
    /// success (SPEC_FULL.md §4.3).
    pub fn find_victim(&self, descriptors: &[BufferDescriptor]) -> Result<BufferId> {
        let n = descriptors.len();
        if n == 0 {
            return Err(BufferPoolError::NoUnpinnedBuffersAvailable);
        }
        self.stats.sweeps.fetch_add(1, Ordering::Relaxed);
        let max_steps = n.saturating_mul(SWEEP_STEPS_PER_BUFFER);
        for _ in 0..max_steps {
            let pos = self.hand.fetch_add(1, Ordering::AcqRel) % n;
            let desc = &descriptors[pos];
            if desc.refcount() > 0 {
                continue;
            }
            if desc.usage_count() > 0 {
                desc.decrement_usage();
                continue;
            }
            if desc.try_claim_for_eviction() {
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                return Ok(desc.buf_id);
            }
            // Lost a race with a concurrent pinner between the usage_count
            // read and the claim; move on.
        }
        self.stats.failed_evictions.fetch_add(1, Ordering::Relaxed);
        Err(BufferPoolError::NoUnpinnedBuffersAvailable)
    }
}

impl Default for ClockSweep {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingKind {
    BulkRead,
    BulkWrite,
    Vacuum,
}

impl RingKind {
    fn ring_size(self) -> usize {
        match self {
            RingKind::BulkRead => 32,
            RingKind::BulkWrite => 16,
            RingKind::Vacuum => 256,
        }
    }
}

/// A bounded ring of candidate buffers used by bulk-scan callers to cap
/// their cache footprint, so a sequential scan doesn't evict the whole
/// pool's worth of working-set buffers.
pub struct RingStrategy {
    kind: RingKind,
    ring: Mutex<Vec<Option<BufferId>>>,
    position: AtomicUsize,
}

impl RingStrategy {
    pub fn new(kind: RingKind) -> Self {
        Self {
            ring: Mutex::new(vec![None; kind.ring_size()]),
            kind,
            position: AtomicUsize::new(0),
        }
    }

    pub fn kind(&self) -> RingKind {
        self.kind
    }

    /// Picks the next victim. `dirty_needs_wal_flush` is supplied by the
    /// caller (the pool, which alone knows WAL state) and answers "would
    /// flushing this buffer require a synchronous WAL flush right now?" —
    /// if so the ring rejects it and falls back to the global sweep, per
    /// SPEC_FULL.md §4.3.
    pub fn next_victim(
        &self,
        descriptors: &[BufferDescriptor],
        clock: &ClockSweep,
        dirty_needs_wal_flush: impl Fn(BufferId) -> bool,
    ) -> Result<BufferId> {
        let slot_idx = self.position.fetch_add(1, Ordering::Relaxed) % self.ring.lock().len();
        let candidate = self.ring.lock()[slot_idx];

        if let Some(buf_id) = candidate {
            let desc = &descriptors[buf_id.get() as usize];
            let dirty = desc.is(super::descriptor::BufFlag::Dirty);
            if desc.refcount() == 0 && !(dirty && dirty_needs_wal_flush(buf_id)) {
                if desc.try_claim_for_eviction() {
                    return Ok(buf_id);
                }
            }
        }

        let victim = clock.find_victim(descriptors)?;
        // Ring strategies pin new victims to usage=1 at most so the global
        // sweep reclaims strategy buffers quickly (SPEC_FULL.md §4.3).
        descriptors[victim.get() as usize].set_usage(1);
        self.ring.lock()[slot_idx] = Some(victim);
        Ok(victim)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bufferpool::descriptor::BufFlag;

    fn make_descriptors(n: usize) -> Vec<BufferDescriptor> {
        (0..n).map(|i| BufferDescriptor::new(BufferId::new(i as u32))).collect()
    }

    #[test]
    fn clock_sweep_skips_pinned_and_decrements_usage() {
        let descs = make_descriptors(3);
        descs[0].pin(); // refcount 1, skip forever
        descs[1].bump_usage(); // usage 1: gets one decrement pass, not claimed yet
        // descs[2] starts at refcount 0, usage 0: immediately claimable.
        let clock = ClockSweep::new();
        let victim = clock.find_victim(&descs).unwrap();
        assert_eq!(victim, BufferId::new(2));
        assert_eq!(descs[1].usage_count(), 0); // decremented on the pass over it
        assert_eq!(descs[2].refcount(), 1); // claimed by eviction
    }

    #[test]
    fn clock_sweep_fails_when_all_pinned() {
        let descs = make_descriptors(2);
        descs[0].pin();
        descs[1].pin();
        let clock = ClockSweep::new();
        assert!(clock.find_victim(&descs).is_err());
    }

    #[test]
    fn ring_strategy_falls_back_to_global_sweep_when_empty() {
        let descs = make_descriptors(4);
        let clock = ClockSweep::new();
        let ring = RingStrategy::new(RingKind::BulkRead);
        let victim = ring.next_victim(&descs, &clock, |_| false).unwrap();
        assert!(descs[victim.get() as usize].refcount() >= 1);
    }

    #[test]
    fn ring_strategy_rejects_dirty_buffer_needing_wal_flush() {
        let descs = make_descriptors(4);
        let clock = ClockSweep::new();
        let ring = RingStrategy::new(RingKind::BulkWrite);
        let first = ring.next_victim(&descs, &clock, |_| false).unwrap();
        descs[first.get() as usize].set_flag(BufFlag::Dirty);
        descs[first.get() as usize].unpin();

        // Advance the ring pointer back to the same slot by cycling through
        // its full size once.
        for _ in 0..(RingKind::BulkWrite.ring_size() - 1) {
            ring.next_victim(&descs, &clock, |_| false).unwrap();
        }
        let victim = ring.next_victim(&descs, &clock, |_| true).unwrap();
        // The dirty ring slot must not have been reused directly; whatever
        // the fallback global sweep returned has its own fresh claim.
        assert_eq!(descs[victim.get() as usize].refcount(), 1);
    }
}
