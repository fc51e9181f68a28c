//! End-to-end scenarios against the public crate API, exercising the
//! behaviors the unit tests inside `src/bufferpool/` check in isolation —
//! here through real concurrency rather than sequenced calls on one thread.

use std::sync::Arc;
use std::thread;

use bufferpool::{BufferPool, BufferTag, FileSmgr, ForkId, MemWal, PoolConfigBuilder, ReadMode, Smgr};

fn test_pool(shared_buffers: usize) -> (Arc<BufferPool>, Arc<FileSmgr>, tempfile::TempDir) {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let dir = tempfile::tempdir().unwrap();
    let config = PoolConfigBuilder::new()
        .shared_buffers(shared_buffers)
        .page_table_partitions(4)
        .data_directory(dir.path().to_string_lossy())
        .build()
        .unwrap();
    let smgr = Arc::new(FileSmgr::new(dir.path()).unwrap());
    let wal = Arc::new(MemWal::new());
    let pool = BufferPool::new(config, smgr.clone(), wal);
    (pool, smgr, dir)
}

#[test]
fn s1_two_sessions_hit_the_same_buffer() {
    let (pool, smgr, _dir) = test_pool(16);
    smgr.zero_extend((1, 1, 1, ForkId::Main), 0, 6, true).unwrap();
    let tag = BufferTag::new(1, 1, 1, ForkId::Main, 5);

    let session1 = pool.new_session();
    let session2 = pool.new_session();

    let g1 = session1.read_buffer_extended(tag, ReadMode::Normal).unwrap();
    let id1 = g1.buffer().buffer_id();
    drop(g1);

    let reads_before = pool.stats_snapshot().page_reads;
    let g2 = session2.read_buffer_extended(tag, ReadMode::Normal).unwrap();
    assert_eq!(g2.buffer().buffer_id(), id1);
    assert_eq!(pool.stats_snapshot().page_reads, reads_before);
}

#[test]
fn s3_concurrent_miss_reads_block_exactly_once() {
    let (pool, smgr, _dir) = test_pool(16);
    smgr.zero_extend((1, 1, 1, ForkId::Main), 0, 10, true).unwrap();
    let tag = BufferTag::new(1, 1, 1, ForkId::Main, 9);

    let barrier = Arc::new(std::sync::Barrier::new(2));
    let mut handles = Vec::new();
    for _ in 0..2 {
        let pool = Arc::clone(&pool);
        let barrier = Arc::clone(&barrier);
        handles.push(thread::spawn(move || {
            barrier.wait();
            let guard = pool.read_buffer_extended(tag, ReadMode::Normal, None).unwrap();
            guard.buffer_id()
        }));
    }

    let ids: Vec<u32> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(ids[0], ids[1]);
    assert_eq!(pool.stats_snapshot().page_reads, 1);
}

#[test]
fn s5_extension_race_across_threads_gives_distinct_blocks() {
    let (pool, smgr, _dir) = test_pool(16);
    let rf = (1, 1, 1, ForkId::Main);

    let barrier = Arc::new(std::sync::Barrier::new(2));
    let mut handles = Vec::new();
    for _ in 0..2 {
        let pool = Arc::clone(&pool);
        let barrier = Arc::clone(&barrier);
        handles.push(thread::spawn(move || {
            barrier.wait();
            let (first, guards) = pool.extend_by(&pool, rf, 1, None).unwrap();
            assert_eq!(guards.len(), 1);
            first
        }));
    }

    let mut firsts: Vec<u64> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    firsts.sort();
    assert_eq!(firsts, vec![0, 1]);
    assert_eq!(smgr.nblocks(rf).unwrap(), 2);
}

#[test]
fn s6_cleanup_lock_blocks_until_other_pin_releases() {
    let (pool, smgr, _dir) = test_pool(8);
    smgr.zero_extend((1, 1, 1, ForkId::Main), 0, 1, true).unwrap();
    let tag = BufferTag::new(1, 1, 1, ForkId::Main, 0);

    let a = pool.read_buffer_extended(tag, ReadMode::Normal, None).unwrap();
    let b = pool.read_buffer_extended(tag, ReadMode::Normal, None).unwrap();

    let pool_for_thread = Arc::clone(&pool);
    let handle = thread::spawn(move || {
        let _write_guard = pool_for_thread.lock_for_cleanup(&b, 42).unwrap();
        b.buffer_id()
    });

    thread::sleep(std::time::Duration::from_millis(50));
    drop(a);
    let id = handle.join().unwrap();
    assert_eq!(
        pool.read_buffer_extended(tag, ReadMode::Normal, None)
            .unwrap()
            .buffer_id(),
        id
    );
}
