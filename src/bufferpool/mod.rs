//! Core buffer pool: descriptor table, mapping index, replacement
//! strategy, per-session pin tracking, and the pin/flush/extend/cleanup
//! operations built on top of them.

pub mod bulk;
pub mod checkpoint;
pub mod descriptor;
pub mod page_table;
pub mod pin_tracker;
pub mod pool;
pub mod strategy;

pub use bulk::{
    drop_database_buffers, drop_relation_buffers, drop_relations_all_buffers,
    flush_database_buffers, flush_relation_buffers, flush_relations_all,
};
pub use checkpoint::{
    bg_buffer_sync, checkpoint_buffers, start_background_writer, BackgroundWriterHandle,
    CheckpointFlags, CheckpointSummary,
};
pub use descriptor::{BufFlag, BufferDescriptor, BufferId, PageBuffer};
pub use page_table::PageTable;
pub use pin_tracker::PinTracker;
pub use pool::{
    abort_buffer_io, BufferGuard, BufferPool, IoGuard, PrefetchOutcome, ReadMode, Session,
    SessionGuard,
};
pub use strategy::{ClockSweep, RingKind, RingStrategy};
