//! Merge throughput benchmarks.
//!
//! Run with:
//! ```
//! cargo bench --bench merge_benchmark
//! ```

use criterion::{criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput};
use std::hint::black_box;
use std::time::Duration;
use tempfile::tempdir;

#[path = "../src/test_support.rs"]
#[allow(dead_code)]
mod test_support;

use provmerge::{LoadType, PersistentLedger, Reconciler, Source, Store};
use test_support::{build_reconciler, default_priorities, default_reconciler, Delivery};

fn load_all(reconciler: &mut Reconciler, deliveries: &[Delivery]) {
    let sources: Vec<(Source, Source)> = ["RefSeq", "GenBank", "Ensembl"]
        .iter()
        .map(|name| {
            (
                reconciler.main_source(name).unwrap(),
                reconciler.skeleton_source(name).unwrap(),
            )
        })
        .collect();
    reconciler.begin_transaction().unwrap();
    for delivery in deliveries {
        let (source, skeleton) = sources
            .iter()
            .find(|(source, _)| source.name == delivery.source)
            .unwrap();
        black_box(
            reconciler
                .store_record(&delivery.record, source, skeleton, LoadType::Source)
                .unwrap(),
        );
    }
    reconciler.commit_transaction().unwrap();
}

fn benchmark_in_memory_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("merge_in_memory");
    group.measurement_time(Duration::from_secs(10));

    for overlap in [0.0, 0.3, 0.7] {
        let deliveries = test_support::generate_deliveries(2_000, overlap, 42);
        group.throughput(Throughput::Elements(deliveries.len() as u64));
        group.bench_with_input(
            BenchmarkId::new("overlap", overlap),
            &deliveries,
            |b, deliveries| {
                b.iter_batched(
                    default_reconciler,
                    |mut reconciler| load_all(&mut reconciler, deliveries),
                    BatchSize::LargeInput,
                )
            },
        );
    }
    group.finish();
}

fn benchmark_persistent_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("merge_persistent");
    group.sample_size(10);

    let deliveries = test_support::generate_deliveries(1_000, 0.5, 7);
    group.throughput(Throughput::Elements(deliveries.len() as u64));
    group.bench_function("overlap_0.5", |b| {
        b.iter_batched(
            || {
                let dir = tempdir().unwrap();
                let reconciler = build_reconciler(
                    Box::new(Store::new()),
                    Box::new(PersistentLedger::open(dir.path()).unwrap()),
                    default_priorities(),
                );
                (dir, reconciler)
            },
            |(_dir, mut reconciler)| {
                load_all(&mut reconciler, &deliveries);
                reconciler.close().unwrap();
            },
            BatchSize::PerIteration,
        )
    });
    group.finish();
}

criterion_group!(benches, benchmark_in_memory_merge, benchmark_persistent_merge);
criterion_main!(benches);
