//! Read/pin path (C5), dirty/flush path (C6), extension path (C7), and the
//! cleanup-lock protocol (C10). This is the main entry point into the
//! module: `BufferPool` owns the shared state (descriptor table, mapping
//! index, strategy, free list); `Session` is a thin per-caller wrapper that
//! adds local pin accounting (C4) and a writeback-coalescing list (§4.6.1).
//!
//! Adapted from the teacher's `buffer::manager::BufferPoolManager`
//! (`pin_page`/`pin_page_slow_path`/`allocate_frame`/`evict_page`/
//! `flush_page`/`flush_all`), with the per-core pool and Windows IOCP paths
//! dropped (no counterpart in scope) and the typo bugs in that file
//! (`ffn new`, a shadowed private `PageTable`) not carried over.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::config::PoolConfig;
use crate::error::{BufferPoolError, Result};
use crate::smgr::Smgr;
use crate::stats::{PoolStats, PoolStatsSnapshot};
use crate::tag::{BufferTag, MAX_BLOCK_NUMBER};
use crate::wal::WalSink;

use super::checkpoint::BgWriterState;
use super::descriptor::{BufFlag, BufferDescriptor, BufferId};
use super::page_table::PageTable;
use super::pin_tracker::PinTracker;
use super::strategy::{ClockSweep, RingKind, RingStrategy};

/// Read mode, mirroring SPEC_FULL.md §4.5.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    Normal,
    NormalNoLog,
    ZeroOnError,
    ZeroAndLock,
    ZeroAndCleanupLock,
}

/// Outcome of `prefetch_buffer`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefetchOutcome {
    AlreadyCached,
    IoInitiated,
    Neither,
}

pub struct BufferPool {
    pub(crate) config: PoolConfig,
    pub(crate) descriptors: Vec<BufferDescriptor>,
    pub(crate) page_table: PageTable,
    pub(crate) clock: ClockSweep,
    free_list: Mutex<Vec<BufferId>>,
    smgr: Arc<dyn Smgr>,
    wal: Arc<dyn WalSink>,
    pub(crate) stats: PoolStats,
    /// Nonzero while a session is between starting and finishing a
    /// hint-bit WAL write in `mark_dirty_hint`; `checkpoint_buffers` will
    /// not report completion while this is nonzero (SPEC_FULL.md §9, open
    /// question 3).
    delaying_checkpoint_start: AtomicUsize,
    next_session_id: AtomicU64,
    /// Buffer allocations (victim acquisitions) since the background
    /// writer's last tick; consumed and reset by `bg_buffer_sync`
    /// (SPEC_FULL.md §4.8 step 2).
    pub(crate) recent_alloc: AtomicU64,
    pub(crate) bgwriter_state: Mutex<BgWriterState>,
}

impl BufferPool {
    pub fn new(config: PoolConfig, smgr: Arc<dyn Smgr>, wal: Arc<dyn WalSink>) -> Arc<Self> {
        let span = tracing::info_span!("buffer_pool_new", shared_buffers = config.shared_buffers);
        let _enter = span.enter();
        let descriptors = (0..config.shared_buffers)
            .map(|i| BufferDescriptor::new(BufferId::new(i as u32)))
            .collect();
        let page_table = PageTable::new(config.page_table_partitions, 16);
        tracing::info!(shared_buffers = config.shared_buffers, "buffer pool constructed");
        Arc::new(Self {
            config,
            descriptors,
            page_table,
            clock: ClockSweep::new(),
            free_list: Mutex::new(Vec::new()),
            smgr,
            wal,
            stats: PoolStats::new(),
            delaying_checkpoint_start: AtomicUsize::new(0),
            next_session_id: AtomicU64::new(1),
            recent_alloc: AtomicU64::new(0),
            bgwriter_state: Mutex::new(BgWriterState::new()),
        })
    }

    pub fn stats_snapshot(&self) -> PoolStatsSnapshot {
        let clock_stats = self.clock.stats();
        self.stats.snapshot(
            clock_stats.evictions.load(Ordering::Relaxed),
            clock_stats.failed_evictions.load(Ordering::Relaxed),
        )
    }

    pub fn capacity(&self) -> usize {
        self.descriptors.len()
    }

    /// Creates a new per-caller session with its own pin tracker.
    pub fn new_session(self: &Arc<Self>) -> Session {
        let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        Session {
            pool: Arc::clone(self),
            tracker: Rc::new(RefCell::new(PinTracker::new(id))),
            pending_writeback: RefCell::new(Vec::new()),
        }
    }

    // ---- C5: read / pin path -------------------------------------------

    pub fn read_buffer_extended(
        self: &Arc<Self>,
        tag: BufferTag,
        mode: ReadMode,
        strategy: Option<&RingStrategy>,
    ) -> Result<BufferGuard> {
        loop {
            if let Some(buf_id) = self.page_table.lookup(&tag) {
                let desc = &self.descriptors[buf_id.get() as usize];
                let state_before_pin = desc.pin();
                if state_before_pin.has(BufFlag::Valid) {
                    self.stats.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(BufferGuard::new(Arc::clone(self), buf_id));
                }
                // Someone else is still loading this buffer (or a previous
                // load failed); race to do the read ourselves.
                if let Some(io) = IoGuard::start(self, buf_id) {
                    self.load_into(io, desc, tag, mode)?;
                    return Ok(BufferGuard::new(Arc::clone(self), buf_id));
                }
                desc.wait_io(Duration::from_millis(50));
                desc.unpin();
                continue; // re-check from scratch
            }

            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            let victim_id = self.acquire_victim(strategy, strategy.is_some())?;
            match self.page_table.insert(tag, victim_id) {
                None => {
                    // No catalog collaborator in scope to distinguish
                    // permanent from unlogged relations; every buffer is
                    // treated as permanent (conservatively requires WAL
                    // flush before eviction).
                    let desc = &self.descriptors[victim_id.get() as usize];
                    desc.install_tag(tag, true);
                    let Some(io) = IoGuard::start(self, victim_id) else {
                        // Unreachable in practice (we just installed the
                        // tag ourselves) but handled defensively.
                        continue;
                    };
                    self.load_into(io, desc, tag, mode)?;
                    return Ok(BufferGuard::new(Arc::clone(self), victim_id));
                }
                Some(existing_id) => {
                    // Race: release our victim back to the free list and
                    // retry against the descriptor that won.
                    self.release_victim(victim_id);
                    let desc = &self.descriptors[existing_id.get() as usize];
                    desc.pin();
                    if desc.is(BufFlag::Valid) {
                        self.stats.hits.fetch_add(1, Ordering::Relaxed);
                        return Ok(BufferGuard::new(Arc::clone(self), existing_id));
                    }
                    if let Some(io) = IoGuard::start(self, existing_id) {
                        self.load_into(io, desc, tag, mode)?;
                        return Ok(BufferGuard::new(Arc::clone(self), existing_id));
                    }
                    desc.wait_io(Duration::from_millis(50));
                    desc.unpin();
                    continue;
                }
            }
        }
    }

    /// Fast-path recheck: if `prior` still names a valid buffer for `tag`,
    /// pin and return it without touching the partition lock machinery
    /// beyond a single lookup.
    pub fn read_recent_buffer(self: &Arc<Self>, tag: BufferTag) -> Option<BufferGuard> {
        let buf_id = self.page_table.lookup(&tag)?;
        let desc = &self.descriptors[buf_id.get() as usize];
        let before = desc.pin();
        if before.has(BufFlag::Valid) && desc.tag() == Some(tag) {
            Some(BufferGuard::new(Arc::clone(self), buf_id))
        } else {
            desc.unpin();
            None
        }
    }

    pub fn prefetch_buffer(&self, tag: BufferTag) -> PrefetchOutcome {
        if self.page_table.lookup(&tag).is_some() {
            return PrefetchOutcome::AlreadyCached;
        }
        if self.config.effective_io_concurrency == 0
            || self.config.io_direct_flags & crate::config::IO_DIRECT_DISABLE_PREFETCH != 0
        {
            return PrefetchOutcome::Neither;
        }
        match self.smgr.prefetch(tag) {
            Ok(()) => PrefetchOutcome::IoInitiated,
            Err(_) => PrefetchOutcome::Neither,
        }
    }

    fn load_into(
        &self,
        io: IoGuard<'_>,
        desc: &BufferDescriptor,
        tag: BufferTag,
        mode: ReadMode,
    ) -> Result<()> {
        let mut page = desc.content_write();
        match mode {
            ReadMode::ZeroAndLock | ReadMode::ZeroAndCleanupLock => {
                page.zero();
            }
            _ => {
                let mut buf = vec![0u8; crate::smgr::PAGE_SIZE];
                match self.smgr.read(tag, &mut buf) {
                    Ok(()) => {
                        page.copy_from(&buf);
                        if self.config.checksums_enabled && !self.verify(&page) {
                            self.handle_corruption(&mut page, mode, tag)?;
                        }
                    }
                    Err(_) if matches!(mode, ReadMode::ZeroOnError) => {
                        tracing::warn!(%tag, "read failed, zeroing page (ZeroOnError)");
                        page.zero();
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        self.stats.page_reads.fetch_add(1, Ordering::Relaxed);
        drop(page);
        desc.set_flag(BufFlag::Valid);
        io.finish();
        Ok(())
    }

    fn verify(&self, page: &super::descriptor::PageBuffer) -> bool {
        // A page that has never been written through the checksummed flush
        // path (freshly zero-extended, never flushed) is all zeroes,
        // including its reserved checksum header; treat that as valid
        // rather than flagging every brand-new page as corrupt.
        if page.data().iter().all(|&b| b == 0) {
            return true;
        }
        page.stored_checksum() == page.compute_checksum()
    }

    fn handle_corruption(
        &self,
        page: &mut super::descriptor::PageBuffer,
        mode: ReadMode,
        tag: BufferTag,
    ) -> Result<()> {
        if self.config.zero_damaged_pages {
            tracing::warn!(%tag, "corrupt page, zeroing (zero_damaged_pages)");
            page.zero();
            Ok(())
        } else if mode == ReadMode::ZeroOnError {
            page.zero();
            Ok(())
        } else {
            Err(BufferPoolError::CorruptPage {
                tag,
                detail: "checksum mismatch".to_string(),
            })
        }
    }

    pub(crate) fn smgr_writeback_hint(&self, tag: BufferTag) -> Result<()> {
        if self.config.maintenance_io_concurrency == 0
            || self.config.io_direct_flags & crate::config::IO_DIRECT_DISABLE_WRITEBACK != 0
        {
            return Ok(());
        }
        self.smgr.writeback(tag.relation_fork(), tag.block_number, 1)
    }

    #[cfg(test)]
    pub(crate) fn smgr_zero_extend_for_test(
        &self,
        rf: (u32, u32, u32, crate::tag::ForkId),
        first: u64,
        n: u64,
    ) {
        self.smgr.zero_extend(rf, first, n, true).unwrap();
    }

    // ---- C3 support: victim acquisition --------------------------------

    fn acquire_victim(
        &self,
        strategy: Option<&RingStrategy>,
        avoid_wal_stall: bool,
    ) -> Result<BufferId> {
        self.recent_alloc.fetch_add(1, Ordering::Relaxed);
        if let Some(id) = self.free_list.lock().pop() {
            let desc = &self.descriptors[id.get() as usize];
            desc.pin();
            return Ok(id);
        }
        let victim_id = match strategy {
            Some(ring) => ring.next_victim(&self.descriptors, &self.clock, |buf_id| {
                avoid_wal_stall
                    && self.wal.wal_needs_flush(
                        self.descriptors[buf_id.get() as usize].page_lsn(),
                    )
            })?,
            None => self.clock.find_victim(&self.descriptors)?,
        };
        self.prepare_victim(victim_id)?;
        Ok(victim_id)
    }

    /// Flushes and evicts whatever old tag `victim_id` held, leaving it
    /// reset but still pinned once (the evictor's own claim).
    fn prepare_victim(&self, victim_id: BufferId) -> Result<()> {
        let desc = &self.descriptors[victim_id.get() as usize];
        if let Some(old_tag) = desc.tag() {
            if desc.is(BufFlag::Valid) && desc.is(BufFlag::Dirty) {
                self.flush_descriptor(desc, old_tag)?;
            }
            self.page_table.remove(&old_tag);
        }
        desc.reset_keep_pin();
        Ok(())
    }

    fn release_victim(&self, victim_id: BufferId) {
        let desc = &self.descriptors[victim_id.get() as usize];
        desc.reset();
        self.free_list.lock().push(victim_id);
    }

    // ---- release / incr_ref (C4 glue) ----------------------------------

    pub(crate) fn unpin_page(&self, buf_id: BufferId) {
        let desc = &self.descriptors[buf_id.get() as usize];
        let refcount = desc.unpin();
        if refcount == 1 && desc.is(BufFlag::PinCountWaiter) {
            desc.clear_flag(BufFlag::PinCountWaiter);
            desc.set_wait_backend_id(None);
            desc.signal_io();
        }
    }

    pub(crate) fn pin_again(&self, buf_id: BufferId) {
        self.descriptors[buf_id.get() as usize].pin();
    }

    // ---- C6: dirty / flush path -----------------------------------------

    /// Requires the caller to already hold the content-lock exclusive
    /// (enforced by taking `_lock` as proof, a `BufferWriteGuard`).
    pub fn mark_dirty(&self, guard: &BufferGuard) {
        let desc = &self.descriptors[guard.buf_id.get() as usize];
        debug_assert!(desc.refcount() > 0);
        desc.set_flag(BufFlag::Dirty);
        desc.set_flag(BufFlag::JustDirtied);
    }

    /// Weaker variant for hint-bit updates; requires only a share lock.
    /// Emits a full-page WAL image first if checksums are on and the page
    /// is permanent, guarding against torn pages.
    pub fn mark_dirty_hint(&self, guard: &BufferGuard, _is_standard_layout: bool) -> Result<()> {
        if self.wal.is_recovery() {
            return Ok(());
        }
        let desc = &self.descriptors[guard.buf_id.get() as usize];
        if self.config.checksums_enabled && desc.is(BufFlag::Permanent) {
            self.delaying_checkpoint_start.fetch_add(1, Ordering::AcqRel);
            let tag_hash = guard.tag().map(|t| t.block_number).unwrap_or(0);
            let result = self.wal.log_full_page(tag_hash);
            self.delaying_checkpoint_start.fetch_sub(1, Ordering::AcqRel);
            let lsn = result?;
            desc.set_page_lsn(lsn);
        }
        desc.set_flag(BufFlag::Dirty);
        desc.set_flag(BufFlag::JustDirtied);
        Ok(())
    }

    pub(crate) fn checkpoint_delay_active(&self) -> bool {
        self.delaying_checkpoint_start.load(Ordering::Acquire) > 0
    }

    /// Flushes one descriptor holding `tag`, enforcing WAL-before-data.
    pub(crate) fn flush_descriptor(&self, desc: &BufferDescriptor, tag: BufferTag) -> Result<()> {
        let Some(io) = IoGuard::start(self, desc.buf_id) else {
            return Ok(());
        };
        desc.clear_flag(BufFlag::JustDirtied);
        let lsn = desc.page_lsn();

        let flush_result = (|| -> Result<()> {
            if desc.is(BufFlag::Permanent) {
                self.wal
                    .flush_wal_up_to(lsn)
                    .map_err(|_| BufferPoolError::WalFlushError {
                        lsn,
                        detail: "wal sink reported failure".to_string(),
                    })?;
            }
            let bytes = if self.config.checksums_enabled {
                let page = desc.content_read();
                let mut scratch = super::descriptor::PageBuffer::new();
                scratch.copy_from(page.data());
                drop(page);
                scratch.set_checksum(scratch.compute_checksum());
                scratch.data().to_vec()
            } else {
                desc.content_read().data().to_vec()
            };
            self.smgr.write(tag, &bytes, false)?;
            self.stats.page_writes.fetch_add(1, Ordering::Relaxed);
            Ok(())
        })();

        match flush_result {
            Ok(()) => {
                if !desc.is(BufFlag::JustDirtied) {
                    desc.clear_flag(BufFlag::Dirty);
                }
                desc.clear_flag(BufFlag::CheckpointNeeded);
                self.stats.flushes.fetch_add(1, Ordering::Relaxed);
                io.finish();
                Ok(())
            }
            Err(e) => {
                tracing::warn!(%tag, error = ?e, "buffer flush failed");
                desc.set_flag(BufFlag::Dirty);
                // `io` drops here uncalled, aborting the I/O: sets
                // `IoError`, clears `IoInProgress`, wakes waiters.
                Err(e)
            }
        }
    }

    pub fn flush_one_buffer(&self, guard: &BufferGuard) -> Result<()> {
        let desc = &self.descriptors[guard.buf_id.get() as usize];
        if let Some(tag) = desc.tag() {
            if desc.is(BufFlag::Valid) && desc.is(BufFlag::Dirty) {
                self.flush_descriptor(desc, tag)?;
            }
        }
        Ok(())
    }

    pub fn is_cleanup_ok(&self, guard: &BufferGuard) -> bool {
        self.descriptors[guard.buf_id.get() as usize].refcount() == 1
    }

    // ---- C10: cleanup-lock protocol --------------------------------------

    /// Caller must already hold `guard`'s pin. Blocks until the caller's is
    /// the only outstanding pin on the buffer, then returns the exclusive
    /// content lock for the duration of the cleanup work; dropping it
    /// releases the lock as usual.
    pub fn lock_for_cleanup<'a>(
        &'a self,
        guard: &'a BufferGuard,
        session_id: u64,
    ) -> Result<parking_lot::RwLockWriteGuard<'a, super::descriptor::PageBuffer>> {
        loop {
            let desc = &self.descriptors[guard.buf_id.get() as usize];
            let write = desc.content_write();
            if desc.refcount() == 1 {
                return Ok(write);
            }
            if desc.is(BufFlag::PinCountWaiter) {
                drop(write);
                return Err(BufferPoolError::ConcurrentPinCountWaiters(
                    guard.buf_id.get(),
                ));
            }
            desc.set_flag(BufFlag::PinCountWaiter);
            desc.set_wait_backend_id(Some(session_id));
            drop(write);
            desc.wait_io(Duration::from_millis(200));
        }
    }

    /// Non-blocking variant: returns `None` immediately if any other pin is
    /// outstanding instead of waiting.
    pub fn conditional_lock_for_cleanup<'a>(
        &'a self,
        guard: &'a BufferGuard,
    ) -> Option<parking_lot::RwLockWriteGuard<'a, super::descriptor::PageBuffer>> {
        let desc = &self.descriptors[guard.buf_id.get() as usize];
        if desc.refcount() != 1 {
            return None;
        }
        let write = desc.content_write();
        if desc.refcount() == 1 {
            Some(write)
        } else {
            None
        }
    }

    // ---- C7: extension path ----------------------------------------------

    /// Extends a relation fork by up to `n` blocks, returning the first new
    /// block number and guards for each new (pinned, zero-filled, VALID)
    /// buffer.
    pub fn extend_by(
        &self,
        pool_self: &Arc<BufferPool>,
        relation_fork: (u32, u32, u32, crate::tag::ForkId),
        n: u64,
        extend_upto: Option<u64>,
    ) -> Result<(u64, Vec<BufferGuard>)> {
        let mut n = n;
        // Step 1: victims acquired before the extension lock, outside of
        // it, per SPEC_FULL.md §4.7.
        let mut victims = Vec::with_capacity(n as usize);
        for _ in 0..n {
            let victim_id = self.acquire_victim(None, true)?;
            self.descriptors[victim_id.get() as usize].content_write().zero();
            victims.push(victim_id);
        }

        // Step 3/4: the "extension lock" here is the relation's own
        // mapping-index slot contention; current size is read from SMGR.
        let current_size = self.smgr.nblocks(relation_fork)?;
        if let Some(upto) = extend_upto {
            if current_size >= upto {
                for v in victims.drain(..) {
                    self.release_victim(v);
                }
                return Ok((current_size, Vec::new()));
            }
            let allowed = upto - current_size;
            if allowed < n {
                for v in victims.drain(allowed as usize..) {
                    self.release_victim(v);
                }
                n = allowed;
            }
        }
        if current_size + n > MAX_BLOCK_NUMBER {
            for v in victims.drain(..) {
                self.release_victim(v);
            }
            return Err(BufferPoolError::RelationTooLarge {
                block: current_size + n,
                max: MAX_BLOCK_NUMBER,
            });
        }

        let mut guards = Vec::with_capacity(n as usize);
        for (i, victim_id) in victims.into_iter().enumerate() {
            let block = current_size + i as u64;
            let tag = BufferTag::new(
                relation_fork.0,
                relation_fork.1,
                relation_fork.2,
                relation_fork.3,
                block,
            );
            match self.page_table.insert(tag, victim_id) {
                None => {
                    let desc = &self.descriptors[victim_id.get() as usize];
                    desc.install_tag(tag, true);
                    desc.set_flag(BufFlag::Valid);
                    guards.push(BufferGuard::new(Arc::clone(pool_self), victim_id));
                }
                Some(existing_id) => {
                    self.release_victim(victim_id);
                    let desc = &self.descriptors[existing_id.get() as usize];
                    desc.pin();
                    let existing_page_is_zero = desc.content_read().data().iter().all(|&b| b == 0);
                    if !existing_page_is_zero {
                        desc.unpin();
                        return Err(BufferPoolError::UnexpectedDataBeyondEof(tag));
                    }
                    guards.push(BufferGuard::new(Arc::clone(pool_self), existing_id));
                }
            }
        }

        self.smgr
            .zero_extend(relation_fork, current_size, n, false)?;

        Ok((current_size, guards))
    }
}

/// RAII claim on a buffer's `IoInProgress` flag. Call `finish` on the
/// success path; dropping without it (an early `?`, an `Err` return, or a
/// panic unwinding through it) runs `abort_buffer_io` instead, so a single
/// I/O in flight can never wedge `IoInProgress` on permanently.
pub struct IoGuard<'a> {
    pool: &'a BufferPool,
    buf_id: BufferId,
    done: bool,
}

impl<'a> IoGuard<'a> {
    /// Claims the flag, or returns `None` if another backend already owns it.
    fn start(pool: &'a BufferPool, buf_id: BufferId) -> Option<Self> {
        let desc = &pool.descriptors[buf_id.get() as usize];
        if desc.is(BufFlag::IoInProgress) {
            return None;
        }
        desc.set_flag(BufFlag::IoInProgress);
        Some(Self {
            pool,
            buf_id,
            done: false,
        })
    }

    /// Marks the I/O as having completed successfully.
    fn finish(mut self) {
        let desc = &self.pool.descriptors[self.buf_id.get() as usize];
        desc.clear_flag(BufFlag::IoInProgress);
        desc.signal_io();
        self.done = true;
    }
}

impl Drop for IoGuard<'_> {
    fn drop(&mut self) {
        if !self.done {
            abort_buffer_io(self.pool, self.buf_id);
        }
    }
}

/// Aborts an in-progress I/O on `buf_id`: flags it as failed and clears
/// `IoInProgress` so backends waiting on it wake up and retry rather than
/// block forever.
pub fn abort_buffer_io(pool: &BufferPool, buf_id: BufferId) {
    let desc = &pool.descriptors[buf_id.get() as usize];
    desc.set_flag(BufFlag::IoError);
    desc.clear_flag(BufFlag::IoInProgress);
    desc.signal_io();
}

/// RAII pin handle: dropping it releases the shared pin (`release_buffer`).
/// Grounded on the teacher's `buffer::page_cache::FrameGuard`.
pub struct BufferGuard {
    pool: Arc<BufferPool>,
    buf_id: BufferId,
}

impl BufferGuard {
    fn new(pool: Arc<BufferPool>, buf_id: BufferId) -> Self {
        Self { pool, buf_id }
    }

    pub fn buffer_id(&self) -> u32 {
        self.buf_id.get()
    }

    pub fn tag(&self) -> Option<BufferTag> {
        self.pool.descriptors[self.buf_id.get() as usize].tag()
    }

    pub fn is_permanent(&self) -> bool {
        self.pool.descriptors[self.buf_id.get() as usize].is(BufFlag::Permanent)
    }

    pub fn lsn(&self) -> u64 {
        self.pool.descriptors[self.buf_id.get() as usize].page_lsn()
    }

    pub fn read_data(&self) -> parking_lot::RwLockReadGuard<'_, super::descriptor::PageBuffer> {
        self.pool.descriptors[self.buf_id.get() as usize].content_read()
    }

    pub fn write_data(&self) -> parking_lot::RwLockWriteGuard<'_, super::descriptor::PageBuffer> {
        self.pool.descriptors[self.buf_id.get() as usize].content_write()
    }

    /// Clones this pin, bumping the shared refcount (`incr_ref`).
    pub fn incr_ref(&self) -> BufferGuard {
        self.pool.pin_again(self.buf_id);
        BufferGuard {
            pool: Arc::clone(&self.pool),
            buf_id: self.buf_id,
        }
    }
}

impl Drop for BufferGuard {
    fn drop(&mut self) {
        self.pool.unpin_page(self.buf_id);
    }
}

/// Per-session wrapper adding local pin accounting (C4) and writeback
/// coalescing (§4.6.1). Never shared across threads.
pub struct Session {
    pub pool: Arc<BufferPool>,
    tracker: Rc<RefCell<PinTracker>>,
    pending_writeback: RefCell<Vec<BufferTag>>,
}

const WRITEBACK_COALESCE_THRESHOLD: usize = 16;

impl Session {
    pub fn session_id(&self) -> u64 {
        self.tracker.borrow().session_id()
    }

    pub fn read_buffer_extended(&self, tag: BufferTag, mode: ReadMode) -> Result<SessionGuard> {
        let guard = self.pool.read_buffer_extended(tag, mode, None)?;
        self.tracker.borrow_mut().pin(BufferId::new(guard.buffer_id()));
        Ok(SessionGuard {
            inner: Some(guard),
            tracker: Rc::clone(&self.tracker),
        })
    }

    pub fn mark_dirty(&self, guard: &SessionGuard) {
        self.pool.mark_dirty(guard.inner.as_ref().unwrap());
    }

    pub fn mark_dirty_hint(&self, guard: &SessionGuard, is_standard_layout: bool) -> Result<()> {
        self.pool
            .mark_dirty_hint(guard.inner.as_ref().unwrap(), is_standard_layout)
    }

    /// Schedules an advisory writeback hint for `tag`; flushes the pending
    /// list once it reaches the coalescing threshold (SPEC_FULL.md §4.6.1).
    pub fn schedule_writeback(&self, tag: BufferTag) {
        let mut pending = self.pending_writeback.borrow_mut();
        pending.push(tag);
        if pending.len() >= WRITEBACK_COALESCE_THRESHOLD {
            Self::flush_writebacks_locked(&self.pool, &mut pending);
        }
    }

    pub fn flush_writebacks(&self) {
        let mut pending = self.pending_writeback.borrow_mut();
        Self::flush_writebacks_locked(&self.pool, &mut pending);
    }

    fn flush_writebacks_locked(pool: &Arc<BufferPool>, pending: &mut Vec<BufferTag>) {
        if pending.is_empty() {
            return;
        }
        if pool.config.effective_io_concurrency == 0
            || pool.config.io_direct_flags & crate::config::IO_DIRECT_DISABLE_WRITEBACK != 0
        {
            pending.clear();
            return;
        }
        pending.sort();
        let mut run_start = 0usize;
        for i in 1..=pending.len() {
            let breaks = i == pending.len()
                || pending[i].relation_fork() != pending[run_start].relation_fork()
                || pending[i].block_number != pending[i - 1].block_number + 1;
            if breaks {
                let first = pending[run_start];
                let nblocks = (i - run_start) as u64;
                if let Err(e) = pool.smgr.writeback(first.relation_fork(), first.block_number, nblocks)
                {
                    tracing::debug!(error = %e, "writeback hint failed, ignoring");
                }
                run_start = i;
            }
        }
        pending.clear();
    }
}

/// Per-session pin handle returned by `Session::read_buffer_extended`. On
/// drop, releases the local pin-tracker entry first, then the shared pin.
pub struct SessionGuard {
    inner: Option<BufferGuard>,
    tracker: Rc<RefCell<PinTracker>>,
}

impl SessionGuard {
    pub fn buffer(&self) -> &BufferGuard {
        self.inner.as_ref().unwrap()
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if let Some(inner) = &self.inner {
            self.tracker.borrow_mut().unpin(BufferId::new(inner.buffer_id()));
        }
        self.inner = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfigBuilder;
    use crate::tag::ForkId;
    use crate::wal::MemWal;
    use std::sync::Arc as StdArc;

    fn test_pool(shared_buffers: usize) -> (StdArc<BufferPool>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = PoolConfigBuilder::new()
            .shared_buffers(shared_buffers)
            .page_table_partitions(4)
            .data_directory(dir.path().to_string_lossy())
            .build()
            .unwrap();
        let smgr = StdArc::new(crate::smgr::FileSmgr::new(dir.path()).unwrap());
        let wal = StdArc::new(MemWal::new());
        (BufferPool::new(config, smgr, wal), dir)
    }

    #[test]
    fn s1_hit_returns_same_buffer_without_second_read() {
        let (pool, _dir) = test_pool(16);
        let rf = (1, 1, 1, ForkId::Main);
        pool.smgr.zero_extend(rf, 0, 6, true).unwrap();
        let tag = BufferTag::new(1, 1, 1, ForkId::Main, 5);

        let g1 = pool.read_buffer_extended(tag, ReadMode::Normal, None).unwrap();
        let id1 = g1.buffer_id();
        drop(g1);
        let reads_before = pool.stats_snapshot().page_reads;
        let g2 = pool.read_buffer_extended(tag, ReadMode::Normal, None).unwrap();
        assert_eq!(g2.buffer_id(), id1);
        assert_eq!(pool.stats_snapshot().page_reads, reads_before);
        assert!(pool.stats_snapshot().hits >= 1);
    }

    #[test]
    fn s2_miss_evicts_dirty_buffer_with_wal_before_write() {
        let (pool, _dir) = test_pool(2);
        let rf = (1, 1, 1, ForkId::Main);
        pool.smgr.zero_extend(rf, 0, 3, true).unwrap();

        let t0 = BufferTag::new(1, 1, 1, ForkId::Main, 0);
        let t1 = BufferTag::new(1, 1, 1, ForkId::Main, 1);
        let t2 = BufferTag::new(1, 1, 1, ForkId::Main, 2);

        let g0 = pool.read_buffer_extended(t0, ReadMode::Normal, None).unwrap();
        pool.mark_dirty(&g0);
        drop(g0);
        let g1 = pool.read_buffer_extended(t1, ReadMode::Normal, None).unwrap();
        pool.mark_dirty(&g1);
        drop(g1);

        let g2 = pool.read_buffer_extended(t2, ReadMode::Normal, None).unwrap();
        assert!(g2.tag().unwrap() == t2);
        assert!(pool.stats_snapshot().page_writes >= 1);
        assert!(pool.stats_snapshot().flushes >= 1);
    }

    #[test]
    fn s5_extension_race_each_session_gets_distinct_block() {
        let (pool, _dir) = test_pool(16);
        let rf = (1, 1, 1, ForkId::Main);
        let (first_a, guards_a) = pool.extend_by(&pool, rf, 1, None).unwrap();
        assert_eq!(guards_a.len(), 1);
        let (first_b, guards_b) = pool.extend_by(&pool, rf, 1, None).unwrap();
        assert_eq!(guards_b.len(), 1);
        assert_ne!(first_a, first_b);
        assert_eq!(pool.smgr.nblocks(rf).unwrap(), 2);
    }

    #[test]
    fn s6_cleanup_lock_waits_for_sole_pin() {
        let (pool, _dir) = test_pool(4);
        let rf = (1, 1, 1, ForkId::Main);
        pool.smgr.zero_extend(rf, 0, 1, true).unwrap();
        let tag = BufferTag::new(1, 1, 1, ForkId::Main, 0);

        let a = pool.read_buffer_extended(tag, ReadMode::Normal, None).unwrap();
        let b = pool.read_buffer_extended(tag, ReadMode::Normal, None).unwrap();
        assert!(!pool.is_cleanup_ok(&b));
        assert!(pool.conditional_lock_for_cleanup(&b).is_none());
        drop(a);
        assert!(pool.conditional_lock_for_cleanup(&b).is_some());
    }

    #[test]
    fn session_pin_tracker_updates_on_guard_drop() {
        let (pool, _dir) = test_pool(4);
        let rf = (1, 1, 1, ForkId::Main);
        pool.smgr.zero_extend(rf, 0, 1, true).unwrap();
        let tag = BufferTag::new(1, 1, 1, ForkId::Main, 0);

        let session = pool.new_session();
        let guard = session.read_buffer_extended(tag, ReadMode::Normal).unwrap();
        assert_eq!(session.tracker.borrow().local_refcount(BufferId::new(guard.buffer().buffer_id())), 1);
        drop(guard);
        assert!(session.tracker.borrow().is_empty());
    }
}
