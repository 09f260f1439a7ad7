use criterion::{BatchSize, BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use chrono::Utc;
use lockstep_events::JobNotification;
use lockstep_infra::jobs::{
    Adapter, ClaimQuery, ExecutionMode, InMemoryJobStore, JobExecutor, JobRegistry, JobStore,
    NewJob, PriorityOrder, ProcessRole, QueueSelector,
};
use std::sync::Arc;

fn seeded_store(n: usize, queues: usize) -> InMemoryJobStore {
    let store = InMemoryJobStore::new();
    let now = Utc::now();
    for i in 0..n {
        let job = NewJob::new("Work", serde_json::json!({ "i": i }))
            .on_queue(format!("q{}", i % queues))
            .with_priority((i % 7) as i32);
        store.insert(job.to_record(now)).unwrap();
    }
    store
}

/// Claim, finish and release every seeded record.
fn drain(store: &InMemoryJobStore, query: &ClaimQuery) -> usize {
    let mut drained = 0;
    while let Some(claimed) = store.claim_next(query).unwrap() {
        store.mark_performing(&claimed.lease).unwrap();
        store.mark_finished(&claimed.lease, None).unwrap();
        store.release(&claimed.lease).unwrap();
        drained += 1;
    }
    drained
}

fn bench_claim_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("claim_throughput");

    for size in [100usize, 1_000] {
        group.throughput(Throughput::Elements(size as u64));

        group.bench_with_input(BenchmarkId::new("all_queues", size), &size, |b, &size| {
            let query = ClaimQuery::new(QueueSelector::All, PriorityOrder::SmallerFirst);
            b.iter_batched(
                || seeded_store(size, 4),
                |store| black_box(drain(&store, &query)),
                BatchSize::SmallInput,
            );
        });

        group.bench_with_input(BenchmarkId::new("one_queue", size), &size, |b, &size| {
            let query = ClaimQuery::new(
                "q1".parse::<QueueSelector>().unwrap(),
                PriorityOrder::SmallerFirst,
            );
            b.iter_batched(
                || seeded_store(size, 4),
                |store| black_box(drain(&store, &query)),
                BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

fn bench_enqueue_all(c: &mut Criterion) {
    let mut group = c.benchmark_group("enqueue_all");
    let size = 500usize;
    group.throughput(Throughput::Elements(size as u64));

    for mode in [ExecutionMode::External, ExecutionMode::Inline] {
        group.bench_function(BenchmarkId::new("mode", mode), |b| {
            b.iter_batched(
                || {
                    let registry = JobRegistry::new().with("Work", |_| Ok(()));
                    let executor = JobExecutor::new(InMemoryJobStore::arc(), Arc::new(registry));
                    let adapter = Adapter::new(mode, ProcessRole::Cli, executor);
                    let jobs: Vec<NewJob> = (0..size)
                        .map(|i| NewJob::new("Work", serde_json::json!(i)).on_queue(format!("q{}", i % 8)))
                        .collect();
                    (adapter, jobs)
                },
                |(adapter, mut jobs)| black_box(adapter.enqueue_all(&mut jobs).unwrap()),
                BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

fn bench_notification_aggregate(c: &mut Criterion) {
    let now = Utc::now();
    let queues: Vec<String> = (0..1_000).map(|i| format!("q{}", i % 16)).collect();

    c.bench_function("notification_aggregate_1000", |b| {
        b.iter(|| {
            black_box(JobNotification::aggregate(
                queues.iter().map(|q| (q.as_str(), now)),
            ))
        });
    });
}

criterion_group!(
    benches,
    bench_claim_throughput,
    bench_enqueue_all,
    bench_notification_aggregate
);
criterion_main!(benches);
