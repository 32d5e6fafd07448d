//! Benchmarks for the exception tracker allocator.
//!
//! Measures the slot-claim paths of the paged tracker slab:
//! - Allocate and free on a warm page
//! - Allocate a burst that forces new pages
//! - Raise and release through a thread's tracker chain

extern crate rootwalk;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use rootwalk::{
    config::TrackerAllocatorConfig,
    eh::{ExceptionRecord, ThreadExceptionState, ThreadId, TrackerAllocator, TrackerMemoryType},
    gc::ObjectRef,
};
use std::{hint::black_box, sync::Arc};

/// Benchmark one allocate/free pair on a page that already exists.
fn bench_alloc_free_warm(c: &mut Criterion) {
    let allocator = TrackerAllocator::new(TrackerAllocatorConfig::new());
    let owner = ThreadId::new(1);
    let id = allocator.get_tracker_memory(owner).unwrap();
    allocator.free_tracker_memory(id, TrackerMemoryType::Both).unwrap();

    c.bench_function("tracker_alloc_free_warm", |b| {
        b.iter(|| {
            let id = allocator.get_tracker_memory(black_box(owner)).unwrap();
            allocator.free_tracker_memory(id, TrackerMemoryType::Both).unwrap();
            black_box(id)
        });
    });
}

/// Benchmark allocating `n` live trackers on one-slot pages, so every
/// allocation after the first grows the slab.
fn bench_alloc_burst(c: &mut Criterion) {
    let mut group = c.benchmark_group("tracker_alloc_burst");
    for n in [8usize, 64, 256] {
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, &n| {
            b.iter(|| {
                let allocator = TrackerAllocator::new(TrackerAllocatorConfig::new().with_page_size(1));
                let ids: Vec<_> = (0..n)
                    .map(|_| allocator.get_tracker_memory(ThreadId::new(1)).unwrap())
                    .collect();
                black_box(allocator.page_count());
                for id in ids {
                    allocator.free_tracker_memory(id, TrackerMemoryType::Both).unwrap();
                }
            });
        });
    }
    group.finish();
}

/// Benchmark raising an exception and releasing it as unhandled.
fn bench_raise_unhandled(c: &mut Criterion) {
    let allocator = Arc::new(TrackerAllocator::new(TrackerAllocatorConfig::new()));
    let mut state = ThreadExceptionState::new(allocator, ThreadId::new(2));

    c.bench_function("tracker_raise_unhandled", |b| {
        b.iter(|| {
            let id = state
                .try_raise(ExceptionRecord::clr(black_box(0x4000)), 0, ObjectRef::new(0x9000))
                .unwrap();
            state.first_pass_unhandled(id).unwrap();
        });
    });
}

criterion_group!(
    benches,
    bench_alloc_free_warm,
    bench_alloc_burst,
    bench_raise_unhandled
);
criterion_main!(benches);
