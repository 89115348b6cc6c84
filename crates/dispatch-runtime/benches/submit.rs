use std::hint::black_box;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use dispatch_runtime::{Group, Queue, Source};

fn bench_submit(c: &mut Criterion) {
    let mut group = c.benchmark_group("submit");

    for size in [100usize, 1000, 10000] {
        group.throughput(Throughput::Elements(size as u64));

        group.bench_with_input(BenchmarkId::new("serial", size), &size, |b, &size| {
            let queue = Queue::serial("bench.serial");
            let counter = Arc::new(AtomicUsize::new(0));
            b.iter(|| {
                let g = Group::new();
                for _ in 0..size {
                    let counter = Arc::clone(&counter);
                    queue.submit_in_group(&g, move || {
                        counter.fetch_add(1, Ordering::Relaxed);
                    });
                }
                g.wait();
            });
        });

        group.bench_with_input(BenchmarkId::new("concurrent", size), &size, |b, &size| {
            let queue = Queue::concurrent("bench.concurrent");
            b.iter(|| {
                let g = Group::new();
                for i in 0..size {
                    queue.submit_in_group(&g, move || {
                        black_box(i);
                    });
                }
                g.wait();
            });
        });
    }
    group.finish();
}

fn bench_sync(c: &mut Criterion) {
    let queue = Queue::serial("bench.sync");
    c.bench_function("sync_round_trip", |b| b.iter(|| queue.sync(|| black_box(1))));
}

fn bench_apply(c: &mut Criterion) {
    let mut group = c.benchmark_group("apply");
    for size in [64usize, 1024] {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let sum = AtomicUsize::new(0);
            b.iter(|| {
                Queue::concurrent_perform(size, |i| {
                    sum.fetch_add(i, Ordering::Relaxed);
                });
            });
        });
    }
    group.finish();
}

fn bench_merge_data(c: &mut Criterion) {
    let source = Source::data_add(Some(&Queue::serial("bench.source")));
    source.set_event_handler(|| {});
    source.activate();
    c.bench_function("merge_data", |b| b.iter(|| source.merge_data(black_box(1))));
    source.cancel();
}

criterion_group!(benches, bench_submit, bench_sync, bench_apply, bench_merge_data);
criterion_main!(benches);
