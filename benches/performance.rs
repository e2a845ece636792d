//! Performance benchmarks for the event store.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use eventide::{ChangeFeed, EventEnvelope, EventStore, Filter, Position, StoreConfig, StreamVersion};
use serde_json::json;
use tempfile::TempDir;

fn create_store(dir: &TempDir, sync_interval: u64) -> EventStore {
    EventStore::create(StoreConfig {
        path: dir.path().join("store"),
        create_if_missing: true,
        sync_interval,
    })
    .unwrap()
}

fn event(i: u64) -> EventEnvelope {
    EventEnvelope::json(
        format!("evt-{}", i),
        "urn:bench",
        "Measured",
        &json!({ "index": i, "data": "payload payload payload" }),
    )
    .unwrap()
}

/// Benchmark single-event appends with varying fsync batching
fn bench_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("append");

    for sync_interval in [1u64, 100, 10_000] {
        group.bench_with_input(
            BenchmarkId::new("sync_interval", sync_interval),
            &sync_interval,
            |b, &interval| {
                let dir = TempDir::new().unwrap();
                let store = create_store(&dir, interval);
                let mut version = StreamVersion(0);
                let mut next = 0u64;

                b.iter(|| {
                    next += 1;
                    version = store.append("bench", version, vec![event(next)]).unwrap();
                    black_box(version);
                });
            },
        );
    }

    group.finish();
}

/// Benchmark batch appends (one commit, many events)
fn bench_append_batch(c: &mut Criterion) {
    let mut group = c.benchmark_group("append_batch");

    for batch_size in [1u64, 10, 100] {
        group.bench_with_input(
            BenchmarkId::new("events", batch_size),
            &batch_size,
            |b, &size| {
                let dir = TempDir::new().unwrap();
                let store = create_store(&dir, 10_000);
                let mut version = StreamVersion(0);
                let mut next = 0u64;

                b.iter(|| {
                    let events = (0..size)
                        .map(|_| {
                            next += 1;
                            event(next)
                        })
                        .collect();
                    version = store.append("bench", version, events).unwrap();
                });
            },
        );
    }

    group.finish();
}

/// Benchmark rehydrating streams of varying length
fn bench_read_stream(c: &mut Criterion) {
    let mut group = c.benchmark_group("read_stream");

    for length in [10u64, 100, 1000] {
        group.bench_with_input(BenchmarkId::new("events", length), &length, |b, &len| {
            let dir = TempDir::new().unwrap();
            let store = create_store(&dir, 10_000);
            let mut version = StreamVersion(0);
            for i in 0..len {
                version = store.append("bench", version, vec![event(i)]).unwrap();
            }

            b.iter(|| {
                black_box(store.read("bench").unwrap());
            });
        });
    }

    group.finish();
}

/// Benchmark change-feed reads and filter evaluation
fn bench_feed(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let store = create_store(&dir, 10_000);
    for i in 0..5_000u64 {
        let stream = format!("s-{}", i % 50);
        let version = store.stream_version(&stream);
        store.append(&stream, version, vec![event(i)]).unwrap();
    }

    let filter = Filter::event_types(["Measured"]).and(Filter::stream("s-7"));

    c.bench_function("commits_after_256", |b| {
        b.iter(|| black_box(store.commits_after(Position(2_500), 256).unwrap()));
    });

    c.bench_function("filter_256_commits", |b| {
        let commits = store.commits_after(Position(0), 256).unwrap();
        b.iter(|| {
            let matched = commits
                .iter()
                .flat_map(|c| c.events.iter())
                .filter(|e| filter.matches(e))
                .count();
            black_box(matched);
        });
    });
}

criterion_group!(
    benches,
    bench_append,
    bench_append_batch,
    bench_read_stream,
    bench_feed,
);

criterion_main!(benches);
