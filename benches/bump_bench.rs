//! Allocator micro-benchmarks using criterion.
//!
//! Run with: cargo bench --bench bump_bench

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use strata::{BlockConfig, Bump, Grow, PageAllocator, Provider};

/// One 64-byte allocation, recycling the single block when it fills
///
/// Keeps the arena's footprint bounded however many iterations criterion
/// decides to run.
fn allocate_or_recycle<P: Provider>(arena: &mut Bump<u8, P>) {
    match arena.allocate(black_box(64)) {
        Some(p) => {
            black_box(p);
        }
        None => {
            arena.reset();
            black_box(arena.allocate(64).unwrap());
        }
    }
}

fn bench_bump_allocate(c: &mut Criterion) {
    let mut group = c.benchmark_group("bump_allocate");
    group.throughput(Throughput::Elements(1));

    group.bench_function("64B_from_heap", |b| {
        let mut arena = Bump::<u8>::with_config(
            BlockConfig::new().size(1 << 20).grow(Grow::ReturnNull),
        );
        b.iter(|| allocate_or_recycle(&mut arena));
    });

    group.bench_function("64B_from_pages", |b| {
        let pages = PageAllocator::new();
        let mut arena = Bump::<u8, &PageAllocator>::with_provider_and_config(
            &pages,
            BlockConfig::new().size(1 << 20).grow(Grow::ReturnNull),
        );
        b.iter(|| allocate_or_recycle(&mut arena));
    });

    group.finish();
}

fn bench_bump_reset(c: &mut Criterion) {
    c.bench_function("bump_fill_then_reset", |b| {
        let mut arena = Bump::<u8>::with_config(BlockConfig::new().size(4096));
        b.iter(|| {
            for _ in 0..64 {
                black_box(arena.allocate(64).unwrap());
            }
            arena.reset();
        });
    });
}

fn bench_page_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("page_allocator");

    group.bench_function("allocate_release_1_page", |b| {
        let allocator = PageAllocator::new();
        b.iter(|| {
            let p = allocator.allocate(1).unwrap();
            unsafe { allocator.release(black_box(p).as_ptr()).unwrap() };
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_bump_allocate,
    bench_bump_reset,
    bench_page_round_trip
);
criterion_main!(benches);
