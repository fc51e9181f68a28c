// Buffer pool performance benchmarks.
// Covers the pin/unpin hot path, the clock-sweep victim search under
// different fill levels, concurrent pin contention, and checkpoint scans.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use bufferpool::{
    bg_buffer_sync, checkpoint_buffers, BufferPool, BufferTag, CheckpointFlags, FileSmgr,
    ForkId, MemWal, PoolConfigBuilder, ReadMode, Smgr,
};

fn create_pool(shared_buffers: usize) -> (Arc<BufferPool>, Arc<FileSmgr>, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let config = PoolConfigBuilder::new()
        .shared_buffers(shared_buffers)
        .page_table_partitions(16)
        .data_directory(temp_dir.path().to_string_lossy())
        .build()
        .unwrap();
    let smgr = Arc::new(FileSmgr::new(temp_dir.path()).unwrap());
    let wal = Arc::new(MemWal::new());
    let pool = BufferPool::new(config, smgr.clone(), wal);
    (pool, smgr, temp_dir)
}

fn bench_page_pin_unpin(c: &mut Criterion) {
    let mut group = c.benchmark_group("page_pin_unpin");

    for shared_buffers in [64usize, 1000] {
        group.bench_with_input(
            BenchmarkId::new("pin_unpin", shared_buffers),
            &shared_buffers,
            |b, &shared_buffers| {
                let (pool, smgr, _temp) = create_pool(shared_buffers);
                let rf = (1, 1, 1, ForkId::Main);
                smgr.zero_extend(rf, 0, 1, true).unwrap();
                let tag = BufferTag::new(1, 1, 1, ForkId::Main, 0);

                b.iter(|| {
                    let guard = pool
                        .read_buffer_extended(black_box(tag), ReadMode::Normal, None)
                        .unwrap();
                    black_box(guard.buffer_id());
                });
            },
        );
    }

    group.finish();
}

fn bench_clock_sweep_under_pressure(c: &mut Criterion) {
    let mut group = c.benchmark_group("clock_sweep_eviction");

    for shared_buffers in [64usize, 256] {
        group.bench_with_input(
            BenchmarkId::from_parameter(shared_buffers),
            &shared_buffers,
            |b, &shared_buffers| {
                let (pool, smgr, _temp) = create_pool(shared_buffers);
                let rf = (1, 1, 1, ForkId::Main);
                let n_blocks = (shared_buffers * 4) as u64;
                smgr.zero_extend(rf, 0, n_blocks, true).unwrap();

                b.iter(|| {
                    // Access more blocks than fit in the pool, forcing the
                    // clock sweep to find a victim on every other read.
                    for block in 0..n_blocks {
                        let tag = BufferTag::new(1, 1, 1, ForkId::Main, block);
                        let guard = pool
                            .read_buffer_extended(black_box(tag), ReadMode::Normal, None)
                            .unwrap();
                        black_box(guard.buffer_id());
                    }
                });
            },
        );
    }

    group.finish();
}

fn bench_concurrent_pin_contention(c: &mut Criterion) {
    let mut group = c.benchmark_group("concurrent_pin_contention");

    for num_threads in [1usize, 2, 4, 8] {
        group.bench_with_input(
            BenchmarkId::from_parameter(num_threads),
            &num_threads,
            |b, &num_threads| {
                let (pool, smgr, _temp) = create_pool(1000);
                let rf = (1, 1, 1, ForkId::Main);
                smgr.zero_extend(rf, 0, 200, true).unwrap();

                b.iter(|| {
                    let handles: Vec<_> = (0..num_threads)
                        .map(|i| {
                            let pool = Arc::clone(&pool);
                            std::thread::spawn(move || {
                                for j in 0..10u64 {
                                    let block = (i as u64 * 10 + j) % 200;
                                    let tag = BufferTag::new(1, 1, 1, ForkId::Main, block);
                                    if let Ok(guard) =
                                        pool.read_buffer_extended(tag, ReadMode::Normal, None)
                                    {
                                        black_box(guard.buffer_id());
                                    }
                                }
                            })
                        })
                        .collect();

                    for handle in handles {
                        handle.join().ok();
                    }
                });
            },
        );
    }

    group.finish();
}

fn bench_mark_dirty_and_checkpoint(c: &mut Criterion) {
    c.bench_function("checkpoint_scan_all_dirty", |b| {
        b.iter(|| {
            let (pool, smgr, _temp) = create_pool(256);
            let rf = (1, 1, 1, ForkId::Main);
            smgr.zero_extend(rf, 0, 256, true).unwrap();

            for block in 0..256 {
                let tag = BufferTag::new(1, 1, 1, ForkId::Main, block);
                let guard = pool.read_buffer_extended(tag, ReadMode::Normal, None).unwrap();
                pool.mark_dirty(&guard);
            }

            let summary = checkpoint_buffers(&pool, CheckpointFlags::default()).unwrap();
            black_box(summary);
        });
    });
}

fn bench_page_table_lookup(c: &mut Criterion) {
    let (pool, smgr, _temp) = create_pool(10_000);
    let rf = (1, 1, 1, ForkId::Main);
    smgr.zero_extend(rf, 0, 5000, true).unwrap();

    // Pre-populate the pool so lookups below are cache hits.
    for block in 0..5000u64 {
        let tag = BufferTag::new(1, 1, 1, ForkId::Main, block);
        drop(pool.read_buffer_extended(tag, ReadMode::Normal, None).unwrap());
    }

    c.bench_function("page_table_lookup_hit", |b| {
        b.iter(|| {
            for block in (0..5000u64).step_by(100) {
                let tag = BufferTag::new(1, 1, 1, ForkId::Main, block);
                let guard = pool
                    .read_buffer_extended(black_box(tag), ReadMode::Normal, None)
                    .unwrap();
                black_box(guard.buffer_id());
            }
        });
    });
}

fn bench_background_writer_tick(c: &mut Criterion) {
    c.bench_function("bg_buffer_sync_tick", |b| {
        let (pool, smgr, _temp) = create_pool(256);
        let rf = (1, 1, 1, ForkId::Main);
        smgr.zero_extend(rf, 0, 256, true).unwrap();
        for block in 0..256 {
            let tag = BufferTag::new(1, 1, 1, ForkId::Main, block);
            let guard = pool.read_buffer_extended(tag, ReadMode::Normal, None).unwrap();
            pool.mark_dirty(&guard);
        }

        b.iter(|| {
            black_box(bg_buffer_sync(&pool).unwrap());
        });
    });
}

criterion_group! {
    name = benches;
    config = Criterion::default().measurement_time(Duration::from_secs(5));
    targets = bench_page_pin_unpin,
        bench_clock_sweep_under_pressure,
        bench_concurrent_pin_contention,
        bench_mark_dirty_and_checkpoint,
        bench_page_table_lookup,
        bench_background_writer_tick
}
criterion_main!(benches);
