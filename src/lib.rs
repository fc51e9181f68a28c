//! Shared buffer pool manager for a page-oriented storage engine: a
//! fixed-size cache of disk blocks shared by many concurrent worker
//! threads, coordinating reads, evictions, dirty-page writeback, and
//! checkpoint-driven flushes.

pub mod bufferpool;
pub mod config;
pub mod error;
pub mod smgr;
pub mod stats;
pub mod tag;
pub mod wal;

pub use bufferpool::{
    abort_buffer_io, bg_buffer_sync, checkpoint_buffers, drop_database_buffers,
    drop_relation_buffers, drop_relations_all_buffers, flush_database_buffers,
    flush_relation_buffers, flush_relations_all, start_background_writer, BackgroundWriterHandle,
    BufferGuard, BufferId, BufferPool, CheckpointFlags, CheckpointSummary, IoGuard,
    PrefetchOutcome, ReadMode, RingKind, RingStrategy, Session, SessionGuard,
};
pub use config::{PoolConfig, PoolConfigBuilder};
pub use error::{BufferPoolError, Result};
pub use smgr::{FileSmgr, Smgr, PAGE_SIZE};
pub use stats::{PoolStats, PoolStatsSnapshot};
pub use tag::{BufferTag, ForkId, MAX_BLOCK_NUMBER, P_NEW};
pub use wal::{MemWal, WalSink};
