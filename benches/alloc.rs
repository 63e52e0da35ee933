//! Benchmarks for allocator hot paths.
//!
//! - alloc/free pairs per class (exercises the ring cache fast path)
//! - batch churn (exercises refill/drain and chain traversal)
//!
//! Run with: cargo bench --bench alloc

use criterion::{Criterion, Throughput, black_box, criterion_group, criterion_main};
use nvm_slab::{MappedRegion, NvmAllocator, SLAB_SIZE};

fn bench_alloc_free_pair(c: &mut Criterion) {
    let mut group = c.benchmark_group("nvm/alloc_free");
    group.throughput(Throughput::Elements(1));

    for size in [8usize, 64, 1024, 4096] {
        let region = MappedRegion::anonymous(64 * SLAB_SIZE).expect("mmap failed");
        let allocator =
            NvmAllocator::new(region.as_ptr(), region.len()).expect("create failed");

        group.bench_function(format!("{size}B"), |b| {
            b.iter(|| {
                let addr = allocator.allocate(black_box(size)).expect("allocate failed");
                allocator.free(black_box(addr.as_ptr()));
            });
        });
    }

    group.finish();
}

fn bench_batch_churn(c: &mut Criterion) {
    let mut group = c.benchmark_group("nvm/batch_churn");

    // Allocate a full batch window, then free it all: every iteration
    // crosses the refill and drain boundaries.
    for batch in [128usize, 1024] {
        let region = MappedRegion::anonymous(64 * SLAB_SIZE).expect("mmap failed");
        let allocator =
            NvmAllocator::new(region.as_ptr(), region.len()).expect("create failed");
        let mut held = Vec::with_capacity(batch);

        group.throughput(Throughput::Elements(batch as u64));
        group.bench_function(format!("{batch}blocks"), |b| {
            b.iter(|| {
                for _ in 0..batch {
                    held.push(allocator.allocate(64).expect("allocate failed"));
                }
                for addr in held.drain(..) {
                    allocator.free(addr.as_ptr());
                }
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_alloc_free_pair, bench_batch_churn);
criterion_main!(benches);
