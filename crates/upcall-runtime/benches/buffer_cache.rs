//! Benchmarks the "amortized O(1)" claim in spec.md §4.2 for
//! `BufferCache::alloc`/`free` under steady-state recycling.

use criterion::{criterion_group, criterion_main, Criterion};
use upcall_runtime::buffer::BufferCache;

fn alloc_free_round_trip(c: &mut Criterion) {
    let mut cache = BufferCache::new(4096, 256, 0);
    c.bench_function("buffer_cache_alloc_free", |b| {
        b.iter(|| {
            let ptr = cache.alloc();
            cache.free(ptr);
        })
    });
}

fn sustained_churn(c: &mut Criterion) {
    let mut cache = BufferCache::new(4096, 256, 0);
    c.bench_function("buffer_cache_sustained_churn", |b| {
        b.iter(|| {
            let bufs: Vec<_> = (0..64).map(|_| cache.alloc()).collect();
            for ptr in bufs {
                cache.free(ptr);
            }
        })
    });
}

criterion_group!(benches, alloc_free_round_trip, sustained_churn);
criterion_main!(benches);
