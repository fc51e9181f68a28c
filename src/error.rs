use crate::tag::BufferTag;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BufferPoolError {
    #[error("bad buffer id: {0}")]
    BadBufferId(u32),

    #[error("corrupt page at {tag}: {detail}")]
    CorruptPage { tag: BufferTag, detail: String },

    #[error("unexpected non-zero data beyond EOF at {0}")]
    UnexpectedDataBeyondEof(BufferTag),

    #[error("write failed for {tag}: {source}")]
    WriteError {
        tag: BufferTag,
        #[source]
        source: std::io::Error,
    },

    #[error("WAL flush failed up to lsn {lsn}: {detail}")]
    WalFlushError { lsn: u64, detail: String },

    #[error("concurrent pin-count waiters on buffer {0}")]
    ConcurrentPinCountWaiters(u32),

    #[error("relation too large: block {block} exceeds max block number {max}")]
    RelationTooLarge { block: u64, max: u64 },

    #[error("no unpinned buffers available after a full clock sweep")]
    NoUnpinnedBuffersAvailable,

    #[error("temp table access forbidden for session {0}")]
    TempTableAccessForbidden(u64),

    #[error("snapshot too old")]
    SnapshotTooOld,

    #[error("timed out waiting on buffer {buffer}: {detail}")]
    Timeout { buffer: u32, detail: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BufferPoolError>;
