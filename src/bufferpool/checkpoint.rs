//! Checkpoint scan/sort/balanced-write loop and the LRU-ahead background
//! writer (C8). Grounded on the teacher's
//! `memory::buffer_pool::checkpoint::{CheckpointQueue, IncrementalCheckpointer}`
//! and `memory::buffer_pool::writer::BackgroundWriter` for the
//! atomics-plus-`std::thread::spawn` start/stop shape; the per-tablespace
//! min-heap balance itself is authored fresh since the teacher checkpoints a
//! single LSN-ordered queue rather than interleaving across tablespaces.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::Result;
use crate::tag::BufferTag;

use super::descriptor::{BufFlag, BufferId};
use super::pool::BufferPool;

/// Number of samples the background writer's allocation-rate estimate is
/// smoothed over (SPEC_FULL.md §4.8 step 3), matching the fast-attack/
/// slow-decline shape: a rise in `recent_alloc` is adopted immediately, a
/// fall is averaged in over this many ticks.
const BGWRITER_SMOOTHING_SAMPLES: f64 = 16.0;

/// Exponentially-smoothed allocation rate and scan density the background
/// writer carries between ticks (SPEC_FULL.md §4.8 steps 2-4).
pub(crate) struct BgWriterState {
    smoothed_alloc: f64,
    smoothed_density: f64,
}

impl BgWriterState {
    pub(crate) fn new() -> Self {
        Self {
            smoothed_alloc: 0.0,
            smoothed_density: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CheckpointFlags {
    pub shutdown: bool,
    pub end_of_recovery: bool,
}

impl CheckpointFlags {
    fn requires_permanent_only(self) -> bool {
        !(self.shutdown || self.end_of_recovery)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CheckpointSummary {
    pub pages_scanned: u64,
    pub pages_written: u64,
}

struct TablespaceQueue {
    tablespace_id: u32,
    items: VecDeque<(BufferId, BufferTag)>,
    progress: f64,
    progress_slice: f64,
}

/// Min-heap entry ordered by `progress`, ties broken by tablespace id for a
/// deterministic interleave order.
struct ProgressEntry(TablespaceQueue);

impl PartialEq for ProgressEntry {
    fn eq(&self, other: &Self) -> bool {
        self.0.progress == other.0.progress && self.0.tablespace_id == other.0.tablespace_id
    }
}
impl Eq for ProgressEntry {}

impl PartialOrd for ProgressEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for ProgressEntry {
    /// Reverse by progress (min-heap via `BinaryHeap`, which is a max-heap).
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .0
            .progress
            .partial_cmp(&self.0.progress)
            .unwrap_or(CmpOrdering::Equal)
            .then_with(|| other.0.tablespace_id.cmp(&self.0.tablespace_id))
    }
}

/// Runs a full checkpoint: scans every descriptor for dirty+eligible
/// buffers, sorts each tablespace's run by (relation, fork, block) for
/// sequential writes, then interleaves writes across tablespaces
/// proportional to each one's share of the total dirty set
/// (SPEC_FULL.md §4.8).
pub fn checkpoint_buffers(pool: &Arc<BufferPool>, flags: CheckpointFlags) -> Result<CheckpointSummary> {
    let span = tracing::info_span!("checkpoint_buffers", shutdown = flags.shutdown, end_of_recovery = flags.end_of_recovery);
    let _enter = span.enter();

    let mut by_tablespace: HashMap<u32, Vec<(BufferId, BufferTag)>> = HashMap::new();
    let mut pages_scanned = 0u64;
    for (idx, desc) in pool.descriptors.iter().enumerate() {
        if !desc.is(BufFlag::Valid) || !desc.is(BufFlag::Dirty) {
            continue;
        }
        if flags.requires_permanent_only() && !desc.is(BufFlag::Permanent) {
            continue;
        }
        let Some(tag) = desc.tag() else { continue };
        desc.set_flag(BufFlag::CheckpointNeeded);
        by_tablespace
            .entry(tag.tablespace_id)
            .or_default()
            .push((BufferId::new(idx as u32), tag));
        pages_scanned += 1;
    }

    if pages_scanned == 0 {
        tracing::debug!("checkpoint found nothing dirty, skipping write loop");
        return Ok(CheckpointSummary::default());
    }

    let total = pages_scanned as f64;
    let mut heap = BinaryHeap::new();
    for (tablespace_id, mut items) in by_tablespace {
        items.sort_by_key(|(_, tag)| (tag.relation_id, tag.fork_id, tag.block_number));
        let num_to_scan = items.len() as f64;
        heap.push(ProgressEntry(TablespaceQueue {
            tablespace_id,
            items: items.into(),
            progress: 0.0,
            progress_slice: total / num_to_scan,
        }));
    }

    let mut pages_written = 0u64;
    let start = Instant::now();
    let target_fraction = pool.config.checkpoint_completion_target.clamp(0.01, 1.0);
    let flush_after = pool.config.checkpoint_flush_after;

    while let Some(ProgressEntry(mut tsq)) = heap.pop() {
        if let Some((buf_id, tag)) = tsq.items.pop_front() {
            let desc = &pool.descriptors[buf_id.get() as usize];
            if desc.is(BufFlag::CheckpointNeeded) {
                pool.flush_descriptor(desc, tag)?;
                pages_written += 1;
                if flush_after > 0 && pages_written % flush_after as u64 == 0 {
                    let _ = pool.smgr_writeback_hint(tag);
                }
            }
            tsq.progress += tsq.progress_slice;
            if !tsq.items.is_empty() {
                heap.push(ProgressEntry(tsq));
            }
            throttle(start, pages_written, pages_scanned, target_fraction);
        }
    }

    // Per SPEC_FULL.md §9 open question 3: don't report completion while a
    // hint-bit WAL race is in flight.
    while pool.checkpoint_delay_active() {
        std::thread::sleep(Duration::from_millis(1));
    }
    pool.stats.checkpoints_completed.fetch_add(1, Ordering::Relaxed);
    tracing::info!(pages_scanned, pages_written, "checkpoint complete");

    Ok(CheckpointSummary {
        pages_scanned,
        pages_written,
    })
}

/// Sleeps briefly if writes are running ahead of `checkpoint_completion_target`'s
/// implied pace, spreading I/O across the checkpoint interval instead of
/// bursting it.
fn throttle(start: Instant, written: u64, total: u64, target_fraction: f64) {
    if total == 0 {
        return;
    }
    let actual_fraction = written as f64 / total as f64;
    let elapsed = start.elapsed().as_secs_f64();
    if elapsed <= 0.0 {
        return;
    }
    let implied_total_secs = elapsed / actual_fraction.max(1e-6) * target_fraction;
    let expected_elapsed = implied_total_secs * actual_fraction;
    if expected_elapsed > elapsed {
        std::thread::sleep(Duration::from_secs_f64((expected_elapsed - elapsed).min(0.05)));
    }
}

/// One tick of the LRU-ahead background writer: scans a window of slots just
/// ahead of the clock-sweep hand and flushes any that are dirty, so the next
/// sweep finds them already clean. The window is sized off a smoothed
/// estimate of recent allocation rate and scan density rather than a static
/// constant (SPEC_FULL.md §4.8 steps 2-4). Returns `true` ("hibernate ok")
/// when nothing needed writing and no allocations happened this tick.
pub fn bg_buffer_sync(pool: &Arc<BufferPool>) -> Result<bool> {
    if pool.config.bgwriter_lru_maxpages == 0 {
        return Ok(true);
    }
    let n = pool.descriptors.len();
    if n == 0 {
        return Ok(true);
    }

    let recent_alloc = pool.recent_alloc.swap(0, Ordering::AcqRel) as f64;
    let (scan_target, window) = {
        let mut bg = pool.bgwriter_state.lock();
        if recent_alloc > bg.smoothed_alloc {
            bg.smoothed_alloc = recent_alloc;
        } else {
            bg.smoothed_alloc += (recent_alloc - bg.smoothed_alloc) / BGWRITER_SMOOTHING_SAMPLES;
        }
        let scan_target = ((bg.smoothed_alloc * pool.config.bgwriter_lru_multiplier).ceil() as usize)
            .max(1)
            .min(pool.config.bgwriter_lru_maxpages);
        let window = ((scan_target as f64 * bg.smoothed_density).ceil() as usize)
            .max(scan_target)
            .min(n);
        (scan_target, window)
    };

    let start = pool.clock.hand_position() % n;
    let mut written = 0usize;
    let mut reusable = 0usize;

    for offset in 0..window {
        let idx = (start + offset) % n;
        let desc = &pool.descriptors[idx];
        if desc.refcount() == 0 && desc.usage_count() == 0 {
            reusable += 1;
        }
        if !desc.is(BufFlag::Valid) || !desc.is(BufFlag::Dirty) || desc.refcount() > 0 {
            continue;
        }
        if let Some(tag) = desc.tag() {
            pool.flush_descriptor(desc, tag)?;
            written += 1;
            pool.stats.bgwriter_buffers_written.fetch_add(1, Ordering::Relaxed);
            if pool.config.bgwriter_flush_after > 0 && written % pool.config.bgwriter_flush_after == 0 {
                let _ = pool.smgr_writeback_hint(tag);
            }
            if written >= scan_target {
                break;
            }
        }
    }

    let density = window as f64 / reusable.max(1) as f64;
    {
        let mut bg = pool.bgwriter_state.lock();
        bg.smoothed_density += (density - bg.smoothed_density) * 0.1;
    }

    Ok(written == 0 && recent_alloc == 0.0)
}

/// Handle to a running background writer thread; dropping it does not stop
/// the thread, call `stop()` explicitly (matching the teacher's
/// `BackgroundWriter::start`/`stop` pair).
pub struct BackgroundWriterHandle {
    running: Arc<AtomicBool>,
    join: Option<std::thread::JoinHandle<()>>,
}

impl BackgroundWriterHandle {
    pub fn stop(mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

/// Spawns the background writer loop: sleeps `bgwriter_delay`, then runs one
/// `bg_buffer_sync` tick, matching `BackgroundWriter::start` in shape.
pub fn start_background_writer(pool: Arc<BufferPool>) -> BackgroundWriterHandle {
    let running = Arc::new(AtomicBool::new(true));
    let running_thread = Arc::clone(&running);
    let delay = pool.config.bgwriter_delay;
    let join = std::thread::spawn(move || {
        while running_thread.load(Ordering::Acquire) {
            std::thread::sleep(delay);
            if !running_thread.load(Ordering::Acquire) {
                break;
            }
            if let Err(e) = bg_buffer_sync(&pool) {
                tracing::warn!(error = %e, "background writer tick failed");
            }
        }
    });
    BackgroundWriterHandle {
        running,
        join: Some(join),
    }
}
