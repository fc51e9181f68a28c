//! Buffer descriptor table (C1): a fixed array of descriptors, each with a
//! tag, a packed atomic state word, a content lock, and an I/O condition
//! variable. Grounded on the teacher's `buffer::page_cache::BufferFrame` for
//! overall shape (frame id, pin/dirty/ref accounting, `PageBuffer` payload,
//! `FrameGuard`-style RAII), but the state is represented as one packed
//! 32-bit word rather than split atomics — see SPEC_FULL.md §4.1/§9: this is
//! required to make "bump refcount while observing VALID" a single atomic
//! operation, which split fields cannot express.

use crate::smgr::PAGE_SIZE;
use crate::tag::BufferTag;
use parking_lot::{Condvar, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::sync::atomic::{AtomicU32, Ordering};

/// Dense index into the descriptor table. The sentinel used for "no
/// buffer" at the public API boundary is handled by the caller (buffer
/// handles there are `BufferId + 1`); internally `BufferId` is always valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BufferId(u32);

impl BufferId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

const REFCOUNT_BITS: u32 = 18;
const REFCOUNT_MASK: u32 = (1 << REFCOUNT_BITS) - 1;
const USAGE_SHIFT: u32 = REFCOUNT_BITS;
const USAGE_BITS: u32 = 4;
const USAGE_MASK: u32 = ((1 << USAGE_BITS) - 1) << USAGE_SHIFT;
const FLAGS_SHIFT: u32 = USAGE_SHIFT + USAGE_BITS;

pub const MAX_USAGE_COUNT: u32 = 5;

/// Bits above `FLAGS_SHIFT`. Matches the flag list in SPEC_FULL.md §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum BufFlag {
    Locked = 1 << (FLAGS_SHIFT),
    Dirty = 1 << (FLAGS_SHIFT + 1),
    Valid = 1 << (FLAGS_SHIFT + 2),
    TagValid = 1 << (FLAGS_SHIFT + 3),
    IoInProgress = 1 << (FLAGS_SHIFT + 4),
    IoError = 1 << (FLAGS_SHIFT + 5),
    JustDirtied = 1 << (FLAGS_SHIFT + 6),
    PinCountWaiter = 1 << (FLAGS_SHIFT + 7),
    CheckpointNeeded = 1 << (FLAGS_SHIFT + 8),
    Permanent = 1 << (FLAGS_SHIFT + 9),
}

/// A snapshot of the packed state word, decoded for callers that need to
/// inspect more than one field consistently (read once, decode many).
#[derive(Debug, Clone, Copy)]
pub struct BufState(u32);

impl BufState {
    pub fn refcount(self) -> u32 {
        self.0 & REFCOUNT_MASK
    }

    pub fn usage_count(self) -> u32 {
        (self.0 & USAGE_MASK) >> USAGE_SHIFT
    }

    pub fn has(self, flag: BufFlag) -> bool {
        self.0 & (flag as u32) != 0
    }
}

/// Fixed-size, cacheline-ish aligned page payload. Alignment matters for
/// direct-I/O-friendly SMGR implementations even though `FileSmgr` itself
/// doesn't use `O_DIRECT`.
#[repr(C, align(4096))]
pub struct PageBuffer {
    data: [u8; PAGE_SIZE],
}

impl PageBuffer {
    pub fn new() -> Self {
        Self {
            data: [0u8; PAGE_SIZE],
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn zero(&mut self) {
        self.data.fill(0);
    }

    pub fn copy_from(&mut self, bytes: &[u8]) {
        self.data.copy_from_slice(bytes);
    }

    /// Number of leading bytes reserved for the stored checksum; the
    /// checksum itself covers everything after them.
    pub const CHECKSUM_SIZE: usize = 4;

    /// Recomputes the checksum over the payload (everything past the
    /// reserved header bytes).
    pub fn compute_checksum(&self) -> u32 {
        crc32fast::hash(&self.data[Self::CHECKSUM_SIZE..])
    }

    /// The checksum as last written into the reserved header bytes.
    pub fn stored_checksum(&self) -> u32 {
        u32::from_le_bytes(self.data[..Self::CHECKSUM_SIZE].try_into().unwrap())
    }

    pub fn set_checksum(&mut self, checksum: u32) {
        self.data[..Self::CHECKSUM_SIZE].copy_from_slice(&checksum.to_le_bytes());
    }
}

impl Default for PageBuffer {
    fn default() -> Self {
        Self::new()
    }
}

struct DescriptorHeader {
    tag: Option<BufferTag>,
    wait_backend_id: Option<u64>,
    freelist_next: Option<BufferId>,
}

/// One cache slot. Created once at pool construction and never destroyed;
/// its `tag`/`state` cycle through Free → TagValid(IoInProgress) → Valid →
/// Valid+Dirty → Valid(flushed) → Invalidated → Free over the pool's
/// lifetime (SPEC_FULL.md §3 "Lifecycle").
///
/// The `header` mutex doubles as the `LOCKED` spinlock described in the
/// spec: `parking_lot::Mutex` already spins briefly before parking, which
/// is exactly the short, non-blocking critical section `LOCKED` calls for,
/// and using a real mutex keeps the non-atomic `tag`/`wait_backend_id`
/// fields memory-safe without a separate hand-rolled spin primitive.
pub struct BufferDescriptor {
    pub buf_id: BufferId,
    state: AtomicU32,
    header: Mutex<DescriptorHeader>,
    content_lock: RwLock<PageBuffer>,
    io_mutex: Mutex<()>,
    io_cv: Condvar,
    page_lsn: AtomicU32,
    page_lsn_hi: AtomicU32,
}

impl BufferDescriptor {
    pub fn new(buf_id: BufferId) -> Self {
        Self {
            buf_id,
            state: AtomicU32::new(0),
            header: Mutex::new(DescriptorHeader {
                tag: None,
                wait_backend_id: None,
                freelist_next: None,
            }),
            content_lock: RwLock::new(PageBuffer::new()),
            io_mutex: Mutex::new(()),
            io_cv: Condvar::new(),
            page_lsn: AtomicU32::new(0),
            page_lsn_hi: AtomicU32::new(0),
        }
    }

    /// The page's LSN as of its last `mark_dirty`, used to enforce
    /// WAL-before-data on flush (SPEC_FULL.md §4.6). Stored as two u32
    /// halves rather than a single `AtomicU64` to avoid pulling in 64-bit
    /// atomics on targets that only support them with an extra fence; reads
    /// the high half first, then low, which is safe here because the only
    /// writer is `set_page_lsn`, itself called under the caller's exclusive
    /// content-lock.
    pub fn page_lsn(&self) -> u64 {
        let hi = self.page_lsn_hi.load(Ordering::Acquire) as u64;
        let lo = self.page_lsn.load(Ordering::Acquire) as u64;
        (hi << 32) | lo
    }

    pub fn set_page_lsn(&self, lsn: u64) {
        self.page_lsn.store(lsn as u32, Ordering::Release);
        self.page_lsn_hi.store((lsn >> 32) as u32, Ordering::Release);
    }

    /// Like `reset`, but keeps the current refcount intact: used when an
    /// evictor has already claimed the descriptor (refcount bumped to 1 by
    /// `try_claim_for_eviction`) and is about to reuse it for a new tag.
    pub fn reset_keep_pin(&self) {
        let mut header = self.header.lock();
        header.tag = None;
        header.wait_backend_id = None;
        header.freelist_next = None;
        drop(header);
        let refcount = self.state.load(Ordering::Acquire) & REFCOUNT_MASK;
        self.state.store(refcount, Ordering::Release);
        self.page_lsn.store(0, Ordering::Release);
        self.page_lsn_hi.store(0, Ordering::Release);
    }

    pub fn load_state(&self) -> BufState {
        BufState(self.state.load(Ordering::Acquire))
    }

    pub fn refcount(&self) -> u32 {
        self.load_state().refcount()
    }

    pub fn usage_count(&self) -> u32 {
        self.load_state().usage_count()
    }

    pub fn is(&self, flag: BufFlag) -> bool {
        self.load_state().has(flag)
    }

    pub fn tag(&self) -> Option<BufferTag> {
        self.header.lock().tag
    }

    /// Bumps the shared refcount by one, returning the state word observed
    /// immediately before the bump (so callers can atomically learn whether
    /// the buffer was `VALID` at the moment they acquired their pin).
    pub fn pin(&self) -> BufState {
        // Refcount occupies the low bits, so a plain fetch_add correctly
        // increments just that field; overflow into the usage bits would
        // require 2^18 concurrent pins on one buffer, far beyond any
        // supported workload.
        let old = self.state.fetch_add(1, Ordering::AcqRel);
        BufState(old)
    }

    /// Drops the shared refcount by one. Returns the resulting refcount.
    pub fn unpin(&self) -> u32 {
        let old = self.state.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(old & REFCOUNT_MASK > 0, "refcount underflow on unpin");
        (old & REFCOUNT_MASK) - 1
    }

    pub fn bump_usage(&self) {
        let mut word = self.state.load(Ordering::Relaxed);
        loop {
            let usage = (word & USAGE_MASK) >> USAGE_SHIFT;
            if usage >= MAX_USAGE_COUNT {
                return;
            }
            let new_word = (word & !USAGE_MASK) | ((usage + 1) << USAGE_SHIFT);
            match self.state.compare_exchange_weak(
                word,
                new_word,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(observed) => word = observed,
            }
        }
    }

    pub fn decrement_usage(&self) {
        let mut word = self.state.load(Ordering::Relaxed);
        loop {
            let usage = (word & USAGE_MASK) >> USAGE_SHIFT;
            if usage == 0 {
                return;
            }
            let new_word = (word & !USAGE_MASK) | ((usage - 1) << USAGE_SHIFT);
            match self.state.compare_exchange_weak(
                word,
                new_word,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(observed) => word = observed,
            }
        }
    }

    pub fn set_usage(&self, usage: u32) {
        let usage = usage.min(MAX_USAGE_COUNT);
        let mut word = self.state.load(Ordering::Relaxed);
        loop {
            let new_word = (word & !USAGE_MASK) | (usage << USAGE_SHIFT);
            match self.state.compare_exchange_weak(
                word,
                new_word,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(observed) => word = observed,
            }
        }
    }

    pub fn set_flag(&self, flag: BufFlag) {
        self.state.fetch_or(flag as u32, Ordering::AcqRel);
    }

    pub fn clear_flag(&self, flag: BufFlag) {
        self.state.fetch_and(!(flag as u32), Ordering::AcqRel);
    }

    /// Attempts to atomically claim this descriptor as an eviction victim:
    /// succeeds only if refcount and usage are both currently zero, and
    /// leaves refcount at 1 (the evictor's own pin) on success.
    pub fn try_claim_for_eviction(&self) -> bool {
        let mut word = self.state.load(Ordering::Acquire);
        loop {
            if word & (REFCOUNT_MASK | USAGE_MASK) != 0 {
                return false;
            }
            let new_word = word + 1;
            match self.state.compare_exchange_weak(
                word,
                new_word,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => word = observed,
            }
        }
    }

    /// Resets a descriptor to the empty Free state. Only valid when the
    /// caller holds the sole pin (refcount == 1, about to be released) and
    /// has already removed the old tag from the mapping index.
    pub fn reset(&self) {
        let mut header = self.header.lock();
        header.tag = None;
        header.wait_backend_id = None;
        header.freelist_next = None;
        self.state.store(0, Ordering::Release);
        self.content_lock.write().zero();
    }

    /// Installs a new tag and the initial flag set under the header lock,
    /// per SPEC_FULL.md §4.5 step 6.
    pub fn install_tag(&self, tag: BufferTag, permanent: bool) {
        let mut header = self.header.lock();
        header.tag = Some(tag);
        drop(header);
        self.set_usage(1);
        self.set_flag(BufFlag::TagValid);
        if permanent {
            self.set_flag(BufFlag::Permanent);
        }
    }

    pub fn clear_tag(&self) {
        let mut header = self.header.lock();
        header.tag = None;
    }

    pub fn content_read(&self) -> RwLockReadGuard<'_, PageBuffer> {
        self.content_lock.read()
    }

    pub fn content_write(&self) -> RwLockWriteGuard<'_, PageBuffer> {
        self.content_lock.write()
    }

    pub fn wait_backend_id(&self) -> Option<u64> {
        self.header.lock().wait_backend_id
    }

    pub fn set_wait_backend_id(&self, id: Option<u64>) {
        self.header.lock().wait_backend_id = id;
    }

    /// Blocks the calling thread until the descriptor's I/O condition
    /// variable is signalled (terminate_io broadcasts it), or `timeout`
    /// elapses. Returns `false` on timeout.
    pub fn wait_io(&self, timeout: std::time::Duration) -> bool {
        let mut guard = self.io_mutex.lock();
        !self.io_cv.wait_for(&mut guard, timeout).timed_out()
    }

    pub fn signal_io(&self) {
        let _guard = self.io_mutex.lock();
        self.io_cv.notify_all();
    }
}
