use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::{thread_rng, Rng};
use std::sync::Arc;
use std::thread;
use tierdb_core::cache::ShardedLruCache;

const KEYS: u64 = 16_384;
const LOOKUPS_PER_THREAD: usize = 20_000;

fn filled_cache(shard_bits: u32) -> Arc<ShardedLruCache<u64>> {
    let cache = Arc::new(ShardedLruCache::new(KEYS as usize, shard_bits));
    for k in 0..KEYS {
        drop(cache.insert(&k.to_be_bytes(), k, 1, None));
    }
    cache
}

fn run_lookups(cache: &Arc<ShardedLruCache<u64>>, threads: usize) {
    let workers: Vec<_> = (0..threads)
        .map(|_| {
            let cache = Arc::clone(cache);
            thread::spawn(move || {
                let mut rng = thread_rng();
                for _ in 0..LOOKUPS_PER_THREAD {
                    // a quarter of the lookups miss
                    let k = rng.gen_range(0..KEYS + KEYS / 3);
                    if let Some(handle) = cache.lookup(&k.to_be_bytes()) {
                        black_box(*handle.value());
                    }
                }
            })
        })
        .collect();
    for worker in workers {
        let _ = worker.join();
    }
}

fn bench_contended_lookups(c: &mut Criterion) {
    let mut group = c.benchmark_group("sharded_lru_lookup");
    group.sample_size(20);
    for shard_bits in [0u32, 4] {
        let cache = filled_cache(shard_bits);
        for threads in [1usize, 4, 8] {
            group.bench_with_input(
                BenchmarkId::new(format!("shards_{}", 1 << shard_bits), threads),
                &threads,
                |b, &threads| b.iter(|| run_lookups(&cache, threads)),
            );
        }
    }
    group.finish();
}

fn bench_insert_evict(c: &mut Criterion) {
    c.bench_function("sharded_lru_insert_evict", |b| {
        let cache = ShardedLruCache::new(4096, 4);
        let mut rng = thread_rng();
        b.iter(|| {
            let k: u64 = rng.gen_range(0..KEYS);
            drop(cache.insert(&k.to_be_bytes(), k, 1, None));
        })
    });
}

criterion_group!(cache, bench_contended_lookups, bench_insert_evict);
criterion_main!(cache);
