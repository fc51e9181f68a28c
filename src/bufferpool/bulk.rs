//! Bulk drop / flush across whole relations or databases (C9). Authored
//! fresh per SPEC_FULL.md §4.9: the teacher has no equivalent whole-relation
//! scan, but its linear-scan-plus-batch-flush shape (`manager.rs::api_flush_all`
//! delegating to a pool-wide `flush_all`) is the stylistic ancestor of the
//! loop structure here.

use std::time::{Duration, Instant};

use crate::error::{BufferPoolError, Result};
use crate::tag::ForkId;

use super::descriptor::BufFlag;
use super::pool::BufferPool;

type RelationFork = (u32, u32, u32, ForkId);

/// Threshold below which `drop_relation_buffers` prefers targeted mapping-
/// index lookups over a full linear scan (SPEC_FULL.md §4.9: "< N/32").
fn prefers_targeted_lookup(n_to_invalidate: u64, shared_buffers: usize) -> bool {
    n_to_invalidate < (shared_buffers as u64 / 32).max(1)
}

/// Drops every buffer at or past `first_del_block` for each `(relation,
/// fork)` pair. Dirty buffers are discarded without flushing: the caller is
/// expected to be about to delete the underlying file.
pub fn drop_relation_buffers(
    pool: &BufferPool,
    relation: (u32, u32, u32),
    forks_and_first_del_block: &[(ForkId, u64)],
) -> Result<u64> {
    let mut invalidated = 0u64;
    for &(fork, first_del_block) in forks_and_first_del_block {
        let rf: RelationFork = (relation.0, relation.1, relation.2, fork);
        let cached_size = pool.page_table.len() as u64; // conservative upper bound
        let n_to_invalidate = cached_size.saturating_sub(first_del_block);

        if prefers_targeted_lookup(n_to_invalidate, pool.capacity()) {
            let mut block = first_del_block;
            loop {
                let tag = crate::tag::BufferTag::new(rf.0, rf.1, rf.2, rf.3, block);
                match pool.page_table.lookup(&tag) {
                    Some(buf_id) => {
                        invalidate(pool, buf_id.get())?;
                        invalidated += 1;
                        block += 1;
                    }
                    None => break,
                }
            }
        } else {
            invalidated += linear_scan_invalidate(pool, rf, first_del_block)?;
        }
    }
    Ok(invalidated)
}

fn linear_scan_invalidate(pool: &BufferPool, rf: RelationFork, first_del_block: u64) -> Result<u64> {
    let mut invalidated = 0u64;
    for idx in 0..pool.descriptors.len() {
        let desc = &pool.descriptors[idx];
        let Some(tag) = desc.tag() else { continue };
        if tag.relation_fork() == rf && tag.block_number >= first_del_block {
            invalidate(pool, idx as u32)?;
            invalidated += 1;
        }
    }
    Ok(invalidated)
}

/// Removes every cached buffer for a relation, all forks.
pub fn drop_relations_all_buffers(pool: &BufferPool, relations: &[(u32, u32, u32)]) -> Result<u64> {
    let mut invalidated = 0u64;
    for idx in 0..pool.descriptors.len() {
        let desc = &pool.descriptors[idx];
        let Some(tag) = desc.tag() else { continue };
        let rel = (tag.tablespace_id, tag.database_id, tag.relation_id);
        if relations.contains(&rel) {
            invalidate(pool, idx as u32)?;
            invalidated += 1;
        }
    }
    Ok(invalidated)
}

/// Removes every cached buffer belonging to `database_id`, every relation.
pub fn drop_database_buffers(pool: &BufferPool, database_id: u32) -> Result<u64> {
    let mut invalidated = 0u64;
    for idx in 0..pool.descriptors.len() {
        let desc = &pool.descriptors[idx];
        let Some(tag) = desc.tag() else { continue };
        if tag.database_id == database_id {
            invalidate(pool, idx as u32)?;
            invalidated += 1;
        }
    }
    Ok(invalidated)
}

/// Invalidates one buffer: waits out any in-flight pin, then clears its tag,
/// flags, and mapping-index entry and returns it to the free list. Dirty
/// contents are discarded without a flush (SPEC_FULL.md §4.9).
fn invalidate(pool: &BufferPool, buf_id: u32) -> Result<()> {
    use super::descriptor::BufferId;

    let desc = &pool.descriptors[buf_id as usize];
    let deadline = Instant::now() + pool.config.invalidate_wait_timeout;
    loop {
        let Some(tag) = desc.tag() else {
            desc.reset();
            return Ok(());
        };
        // `remove_if` holds the mapping partition's write lock across the
        // refcount check and the removal, so a racing `read_buffer_extended`
        // lookup on the same tag either sees the mapping gone (miss, loads
        // fresh) or completes its pin first (refcount nonzero, we retry) —
        // never a pin landing on a descriptor we're mid-reset on.
        let removed = pool
            .page_table
            .remove_if(&tag, |id| id == BufferId::new(buf_id) && desc.refcount() == 0);
        if removed.is_some() {
            desc.reset();
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(BufferPoolError::Timeout {
                buffer: buf_id,
                detail: "invalidate timed out waiting for pin to clear".to_string(),
            });
        }
        desc.wait_io(Duration::from_millis(50));
    }
}

/// Flushes every `VALID ∧ DIRTY` buffer for one relation fork.
pub fn flush_relation_buffers(pool: &BufferPool, rf: RelationFork) -> Result<u64> {
    let mut flushed = 0u64;
    for idx in 0..pool.descriptors.len() {
        let desc = &pool.descriptors[idx];
        if !desc.is(BufFlag::Valid) || !desc.is(BufFlag::Dirty) {
            continue;
        }
        if let Some(tag) = desc.tag() {
            if tag.relation_fork() == rf {
                pool.flush_descriptor(desc, tag)?;
                flushed += 1;
            }
        }
    }
    Ok(flushed)
}

/// Flushes every `VALID ∧ DIRTY` buffer belonging to `database_id`.
pub fn flush_database_buffers(pool: &BufferPool, database_id: u32) -> Result<u64> {
    let mut flushed = 0u64;
    for idx in 0..pool.descriptors.len() {
        let desc = &pool.descriptors[idx];
        if !desc.is(BufFlag::Valid) || !desc.is(BufFlag::Dirty) {
            continue;
        }
        if let Some(tag) = desc.tag() {
            if tag.database_id == database_id {
                pool.flush_descriptor(desc, tag)?;
                flushed += 1;
            }
        }
    }
    Ok(flushed)
}

/// Flushes every `VALID ∧ DIRTY` buffer in the pool, regardless of relation
/// or database (used for shutdown / end-of-recovery checkpoints that have
/// already run their own scan, and for tests).
pub fn flush_relations_all(pool: &BufferPool) -> Result<u64> {
    let mut flushed = 0u64;
    for idx in 0..pool.descriptors.len() {
        let desc = &pool.descriptors[idx];
        if !desc.is(BufFlag::Valid) || !desc.is(BufFlag::Dirty) {
            continue;
        }
        if let Some(tag) = desc.tag() {
            pool.flush_descriptor(desc, tag)?;
            flushed += 1;
        }
    }
    Ok(flushed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bufferpool::pool::ReadMode;
    use crate::config::PoolConfigBuilder;
    use crate::smgr::FileSmgr;
    use crate::tag::BufferTag;
    use crate::wal::MemWal;
    use std::sync::Arc;

    fn test_pool(shared_buffers: usize) -> (Arc<BufferPool>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = PoolConfigBuilder::new()
            .shared_buffers(shared_buffers)
            .page_table_partitions(4)
            .data_directory(dir.path().to_string_lossy())
            .build()
            .unwrap();
        let smgr = Arc::new(FileSmgr::new(dir.path()).unwrap());
        let wal = Arc::new(MemWal::new());
        (BufferPool::new(config, smgr, wal), dir)
    }

    #[test]
    fn drop_relation_buffers_removes_matching_tags_only() {
        let (pool, _dir) = test_pool(16);
        pool.smgr_zero_extend_for_test((1, 1, 1, ForkId::Main), 0, 4);
        pool.smgr_zero_extend_for_test((1, 1, 2, ForkId::Main), 0, 4);

        for block in 0..4 {
            let g = pool
                .read_buffer_extended(BufferTag::new(1, 1, 1, ForkId::Main, block), ReadMode::Normal, None)
                .unwrap();
            drop(g);
            let g2 = pool
                .read_buffer_extended(BufferTag::new(1, 1, 2, ForkId::Main, block), ReadMode::Normal, None)
                .unwrap();
            drop(g2);
        }

        let removed = drop_relation_buffers(&pool, (1, 1, 1), &[(ForkId::Main, 0)]).unwrap();
        assert_eq!(removed, 4);
        assert!(pool.page_table.lookup(&BufferTag::new(1, 1, 1, ForkId::Main, 0)).is_none());
        assert!(pool.page_table.lookup(&BufferTag::new(1, 1, 2, ForkId::Main, 0)).is_some());
    }

    #[test]
    fn flush_relation_buffers_only_flushes_dirty_matching_relation() {
        let (pool, _dir) = test_pool(16);
        pool.smgr_zero_extend_for_test((1, 1, 1, ForkId::Main), 0, 2);
        pool.smgr_zero_extend_for_test((1, 1, 2, ForkId::Main), 0, 2);

        let g = pool
            .read_buffer_extended(BufferTag::new(1, 1, 1, ForkId::Main, 0), ReadMode::Normal, None)
            .unwrap();
        pool.mark_dirty(&g);
        let g2 = pool
            .read_buffer_extended(BufferTag::new(1, 1, 2, ForkId::Main, 0), ReadMode::Normal, None)
            .unwrap();
        pool.mark_dirty(&g2);

        let flushed = flush_relation_buffers(&pool, (1, 1, 1, ForkId::Main)).unwrap();
        assert_eq!(flushed, 1);
        assert!(pool.stats_snapshot().flushes >= 1);
    }
}
