//! Performance benchmarks for the memory store.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use memstore::{DiffRequest, ItemInput, SequenceId, SessionId, Store, StoreConfig, WatcherFilter};
use tempfile::TempDir;

fn create_store(dir: &TempDir) -> Store {
    Store::create(StoreConfig {
        path: dir.path().join("store"),
        // Keep fsync out of the hot loop.
        sync_interval: 10_000,
        ..Default::default()
    })
    .unwrap()
}

fn seeded_store(dir: &TempDir, session: &SessionId, items: usize) -> Store {
    let store = create_store(dir);
    for i in 0..items {
        store
            .save_item(session, ItemInput::new(format!("key_{:06}", i), "payload"))
            .unwrap();
    }
    store
}

/// Benchmark item writes (each append a change record).
fn bench_save_item(c: &mut Criterion) {
    let mut group = c.benchmark_group("save_item");

    group.bench_function("create", |b| {
        let dir = TempDir::new().unwrap();
        let store = create_store(&dir);
        let session = SessionId::new("bench");
        let mut i = 0u64;

        b.iter(|| {
            i += 1;
            black_box(
                store
                    .save_item(&session, ItemInput::new(format!("key_{}", i), "payload"))
                    .unwrap(),
            );
        });
    });

    group.bench_function("update", |b| {
        let dir = TempDir::new().unwrap();
        let store = create_store(&dir);
        let session = SessionId::new("bench");
        store.save_item(&session, ItemInput::new("key", "v0")).unwrap();
        let mut i = 0u64;

        b.iter(|| {
            i += 1;
            black_box(
                store
                    .save_item(&session, ItemInput::new("key", format!("v{}", i)))
                    .unwrap(),
            );
        });
    });

    group.finish();
}

/// Benchmark change log scans with varying log depths.
fn bench_change_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("change_scan");

    for depth in [100, 1_000, 10_000] {
        group.bench_with_input(BenchmarkId::new("log_depth", depth), &depth, |b, &depth| {
            let dir = TempDir::new().unwrap();
            let session = SessionId::new("bench");
            let store = seeded_store(&dir, &session, depth);

            b.iter(|| {
                black_box(store.changes_since(SequenceId(0), Some(&session)));
            });
        });
    }

    group.finish();
}

/// Benchmark a filtered poll that scans the whole log past the cursor.
fn bench_filtered_poll(c: &mut Criterion) {
    let mut group = c.benchmark_group("filtered_poll");

    for depth in [1_000, 10_000] {
        group.bench_with_input(BenchmarkId::new("log_depth", depth), &depth, |b, &depth| {
            let dir = TempDir::new().unwrap();
            let session = SessionId::new("bench");
            let store = create_store(&dir);

            // A filter that matches nothing keeps the cursor pinned, so
            // every iteration scans the full backlog.
            let watch = store
                .create_watcher(
                    Some(&session),
                    WatcherFilter::keys(vec!["no_such_*".to_string()]),
                    None,
                )
                .unwrap();
            for i in 0..depth {
                store
                    .save_item(&session, ItemInput::new(format!("key_{:06}", i), "payload"))
                    .unwrap();
            }

            b.iter(|| {
                black_box(store.poll(watch.watcher_id, None).unwrap());
            });
        });
    }

    group.finish();
}

/// Benchmark checkpoint diffs with varying item counts.
fn bench_snapshot_diff(c: &mut Criterion) {
    let mut group = c.benchmark_group("snapshot_diff");

    for items in [100, 1_000, 10_000] {
        group.bench_with_input(BenchmarkId::new("items", items), &items, |b, &items| {
            let dir = TempDir::new().unwrap();
            let session = SessionId::new("bench");
            let store = seeded_store(&dir, &session, items);

            let checkpoint = store.create_checkpoint(&session, "bench").unwrap();

            // Touch a tenth of the items so the diff has work to do.
            for i in (0..items).step_by(10) {
                store
                    .save_item(&session, ItemInput::new(format!("key_{:06}", i), "changed"))
                    .unwrap();
            }

            b.iter(|| {
                black_box(store.diff(DiffRequest::checkpoint(session.clone(), checkpoint.id)));
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_save_item,
    bench_change_scan,
    bench_filtered_poll,
    bench_snapshot_diff
);
criterion_main!(benches);
