use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of a cached block: which tablespace, database, relation, fork
/// and block number it belongs to. Total-ordered by field order, which is
/// what the checkpoint sort (see `bufferpool::checkpoint`) relies on to make
/// per-file writes sequential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BufferTag {
    pub tablespace_id: u32,
    pub database_id: u32,
    pub relation_id: u32,
    pub fork_id: ForkId,
    pub block_number: u64,
}

impl BufferTag {
    pub fn new(
        tablespace_id: u32,
        database_id: u32,
        relation_id: u32,
        fork_id: ForkId,
        block_number: u64,
    ) -> Self {
        Self {
            tablespace_id,
            database_id,
            relation_id,
            fork_id,
            block_number,
        }
    }

    /// Tag identifying the relation+fork this block belongs to, ignoring
    /// the block number. Used by bulk drop/flush to match all blocks of a
    /// relation fork without constructing one tag per block.
    pub fn relation_fork(&self) -> (u32, u32, u32, ForkId) {
        (
            self.tablespace_id,
            self.database_id,
            self.relation_id,
            self.fork_id,
        )
    }
}

impl fmt::Display for BufferTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{ts={} db={} rel={} fork={:?} block={}}}",
            self.tablespace_id, self.database_id, self.relation_id, self.fork_id, self.block_number
        )
    }
}

/// Named sub-file of a relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ForkId {
    Main = 0,
    FreeSpaceMap = 1,
    VisibilityMap = 2,
    Init = 3,
}

impl ForkId {
    pub fn is_init(self) -> bool {
        matches!(self, ForkId::Init)
    }
}

/// Maximum block number a relation fork may reach. Matches a 32-bit block
/// counter; extension beyond this raises `RelationTooLarge`.
pub const MAX_BLOCK_NUMBER: u64 = u32::MAX as u64 - 1;

/// Sentinel block number requesting relation extension via the legacy
/// `read_buffer_extended` path rather than `extend_by` directly.
pub const P_NEW: u64 = u64::MAX;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_is_by_field_tuple() {
        let a = BufferTag::new(1, 1, 1, ForkId::Main, 5);
        let b = BufferTag::new(1, 1, 1, ForkId::Main, 6);
        let c = BufferTag::new(1, 1, 2, ForkId::Main, 0);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn relation_fork_ignores_block() {
        let a = BufferTag::new(1, 2, 3, ForkId::Main, 5);
        let b = BufferTag::new(1, 2, 3, ForkId::Main, 999);
        assert_eq!(a.relation_fork(), b.relation_fork());
    }
}
