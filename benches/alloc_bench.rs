// Allocator Performance Benchmarks
// Measures the hot allocation paths: small-bin throughput across size
// classes, the large-pool path, and an allocate/free churn mix.

use std::hint::black_box;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};

fn bench_small_alloc_free(c: &mut Criterion) {
    let mut group = c.benchmark_group("small_alloc_free");
    for size in [16usize, 64, 256, 448, 2048] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter(|| {
                let p = fwdalloc::alloc(black_box(size));
                fwdalloc::free(p);
            });
        });
    }
    group.finish();
}

fn bench_large_alloc_free(c: &mut Criterion) {
    let mut group = c.benchmark_group("large_alloc_free");
    for size in [8 * 1024usize, 64 * 1024, 512 * 1024] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter(|| {
                let p = fwdalloc::alloc(black_box(size));
                fwdalloc::free(p);
            });
        });
    }
    group.finish();
}

fn bench_churn(c: &mut Criterion) {
    c.bench_function("churn_64_live_blocks", |b| {
        let mut live: Vec<*mut u8> = vec![std::ptr::null_mut(); 64];
        let mut next = 0usize;
        b.iter(|| {
            let slot = &mut live[next % 64];
            if !slot.is_null() {
                fwdalloc::free(*slot);
            }
            *slot = fwdalloc::alloc(black_box(32 + (next % 8) * 48));
            next += 1;
        });
        for p in live {
            if !p.is_null() {
                fwdalloc::free(p);
            }
        }
    });
}

fn bench_realloc_growth(c: &mut Criterion) {
    c.bench_function("realloc_doubling", |b| {
        b.iter(|| {
            let mut p = fwdalloc::alloc(black_box(4096));
            for shift in 13..17 {
                p = fwdalloc::realloc(p, 1 << shift);
            }
            fwdalloc::free(p);
        });
    });
}

criterion_group!(
    benches,
    bench_small_alloc_free,
    bench_large_alloc_free,
    bench_churn,
    bench_realloc_growth
);
criterion_main!(benches);
