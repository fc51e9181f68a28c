//! Buffer mapping index (C2): a partitioned concurrent hash from tag to
//! descriptor index. Adapted directly from the teacher's
//! `buffer::page_table::PageTable`, generalized from a flat integer page id
//! to the spec's composite `BufferTag`.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::atomic::{AtomicU64, Ordering};

use super::descriptor::BufferId;
use crate::tag::BufferTag;

pub struct PageTable {
    partitions: Vec<RwLock<HashMap<BufferTag, BufferId>>>,
    num_partitions: usize,
    lookups: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl PageTable {
    pub fn new(num_partitions: usize, initial_capacity_per_partition: usize) -> Self {
        assert!(num_partitions > 0, "page table needs at least one partition");
        let mut partitions = Vec::with_capacity(num_partitions);
        for _ in 0..num_partitions {
            partitions.push(RwLock::new(HashMap::with_capacity(
                initial_capacity_per_partition,
            )));
        }
        Self {
            partitions,
            num_partitions,
            lookups: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Stable hash of a tag, same multiplicative-prime technique the
    /// teacher uses for flat page ids, applied over the tag's fields.
    fn hash_tag(tag: &BufferTag) -> u64 {
        let mut h: u64 = 0xcbf29ce484222325; // FNV offset basis
        for part in [
            tag.tablespace_id as u64,
            tag.database_id as u64,
            tag.relation_id as u64,
            tag.fork_id as u64,
            tag.block_number,
        ] {
            h ^= part;
            h = h.wrapping_mul(0x9e3779b97f4a7c15);
        }
        h
    }

    #[inline(always)]
    fn partition_index(&self, tag: &BufferTag) -> usize {
        (Self::hash_tag(tag) as usize) % self.num_partitions
    }

    pub fn lookup(&self, tag: &BufferTag) -> Option<BufferId> {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        let idx = self.partition_index(tag);
        let result = self.partitions[idx].read().get(tag).copied();
        if result.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    /// Inserts `(tag, buf_id)` unless `tag` is already present, in which
    /// case the existing id is returned and the table is left unchanged
    /// (the race described in SPEC_FULL.md §4.5 step 5).
    pub fn insert(&self, tag: BufferTag, buf_id: BufferId) -> Option<BufferId> {
        let idx = self.partition_index(&tag);
        let mut partition = self.partitions[idx].write();
        match partition.entry(tag) {
            Entry::Occupied(entry) => Some(*entry.get()),
            Entry::Vacant(entry) => {
                entry.insert(buf_id);
                None
            }
        }
    }

    pub fn remove(&self, tag: &BufferTag) -> Option<BufferId> {
        let idx = self.partition_index(tag);
        self.partitions[idx].write().remove(tag)
    }

    /// Removes `tag` only if `pred` (given the mapped id) accepts it, all
    /// under the one partition write-lock acquisition — so a concurrent
    /// `lookup`/`insert` on the same tag either completes entirely before
    /// this call or sees the removal's result, never a half-finished one.
    /// Used by `invalidate` (SPEC_FULL.md §4.9) to make the refcount check
    /// and the removal atomic with respect to a racing pinner.
    pub fn remove_if<F>(&self, tag: &BufferTag, pred: F) -> Option<BufferId>
    where
        F: FnOnce(BufferId) -> bool,
    {
        let idx = self.partition_index(tag);
        let mut partition = self.partitions[idx].write();
        match partition.entry(*tag) {
            Entry::Occupied(entry) if pred(*entry.get()) => Some(entry.remove()),
            _ => None,
        }
    }

    #[cold]
    pub fn clear(&self) {
        for partition in &self.partitions {
            partition.write().clear();
        }
        self.lookups.store(0, Ordering::Relaxed);
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }

    pub fn hit_rate(&self) -> f64 {
        let lookups = self.lookups.load(Ordering::Relaxed);
        let hits = self.hits.load(Ordering::Relaxed);
        if lookups == 0 {
            0.0
        } else {
            hits as f64 / lookups as f64
        }
    }

    #[cold]
    pub fn stats(&self) -> (u64, u64, u64, f64) {
        (
            self.lookups.load(Ordering::Relaxed),
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
            self.hit_rate(),
        )
    }

    #[cold]
    pub fn len(&self) -> usize {
        self.partitions.iter().map(|p| p.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tag::ForkId;

    fn tag(block: u64) -> BufferTag {
        BufferTag::new(1, 1, 1, ForkId::Main, block)
    }

    #[test]
    fn insert_lookup_remove() {
        let table = PageTable::new(4, 8);
        table.insert(tag(1), BufferId::new(5));
        table.insert(tag(2), BufferId::new(7));

        assert_eq!(table.lookup(&tag(1)), Some(BufferId::new(5)));
        assert_eq!(table.lookup(&tag(2)), Some(BufferId::new(7)));
        assert_eq!(table.lookup(&tag(3)), None);

        table.remove(&tag(1));
        assert_eq!(table.lookup(&tag(1)), None);
    }

    #[test]
    fn insert_collision_returns_existing_without_overwrite() {
        let table = PageTable::new(4, 8);
        assert_eq!(table.insert(tag(1), BufferId::new(5)), None);
        assert_eq!(table.insert(tag(1), BufferId::new(99)), Some(BufferId::new(5)));
        assert_eq!(table.lookup(&tag(1)), Some(BufferId::new(5)));
    }

    #[test]
    fn stats_track_hits_and_misses() {
        let table = PageTable::new(4, 8);
        table.insert(tag(1), BufferId::new(5));
        table.lookup(&tag(1));
        table.lookup(&tag(2));
        let (lookups, hits, misses, hit_rate) = table.stats();
        assert_eq!(lookups, 2);
        assert_eq!(hits, 1);
        assert_eq!(misses, 1);
        assert!((hit_rate - 0.5).abs() < 0.01);
    }
}
