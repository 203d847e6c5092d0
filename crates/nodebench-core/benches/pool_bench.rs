//! Per-node pool benchmarks
//!
//! Measures the instance lock path and single-threaded workload operations.
//!
//! Run with: cargo bench --bench pool_bench

use std::hint::black_box;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use fastrand::Rng;
use nodebench_core::numa::{NodeLocalAllocator, NumaNodeId};
use nodebench_core::pool::PerNodePool;
use nodebench_core::workload::{Array, Queue, Stack, Workload, WorkloadParams};

const NODE: NumaNodeId = NumaNodeId::new(0);

/// Benchmark an uncontended `with_instance` call
fn bench_with_instance(c: &mut Criterion) {
    let mut group = c.benchmark_group("pool_with_instance");
    group.throughput(Throughput::Elements(1));

    for size in [1usize, 64] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let alloc = NodeLocalAllocator::system();
            let pool = PerNodePool::new(&alloc, NODE, size, |_| Ok(0u64)).unwrap();
            let mut rng = Rng::with_seed(123);
            b.iter(|| {
                let index = rng.usize(..size);
                pool.with_instance(index, |count| {
                    *count += 1;
                    black_box(*count)
                })
            });
        });
    }

    group.finish();
}

fn bench_workload<'a, W: Workload<'a>>(
    c: &mut Criterion,
    name: &str,
    alloc: &'a NodeLocalAllocator,
) {
    let params = WorkloadParams::default();
    let pool = PerNodePool::new(alloc, NODE, 1, |place| W::create(place, &params)).unwrap();
    let mut rng = Rng::with_seed(123);

    c.bench_function(name, |b| {
        b.iter(|| {
            let op = W::pick_op(rng.u32(1..=100), &mut rng, &params);
            pool.with_instance(0, |instance| instance.apply(black_box(op)))
                .unwrap();
        });
    });
}

/// Benchmark one randomized operation per workload
fn bench_workload_ops(c: &mut Criterion) {
    let alloc = NodeLocalAllocator::direct();
    bench_workload::<Stack<'_>>(c, "workload_stack", &alloc);
    bench_workload::<Queue<'_>>(c, "workload_queue", &alloc);
    bench_workload::<Array<'_>>(c, "workload_array", &alloc);
}

criterion_group!(benches, bench_with_instance, bench_workload_ops);
criterion_main!(benches);
