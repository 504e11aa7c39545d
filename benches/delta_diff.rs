//! Performance benchmarks for the delta path.
//!
//! Run with: `cargo bench --bench delta_diff`
//!
//! ## Performance Targets
//!
//! | Operation | Target | Notes |
//! |-----------|--------|-------|
//! | Snapshot diff | Linear in rows | Single merge walk |
//! | Shard partition | Linear in rows | One hash per key |
//! | Full import | <2s for 100k rows | In-memory store, 4 shards |

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::collections::BTreeMap;
use std::sync::Arc;

use delta_ledger::{
    collapse_snapshot, diff_snapshots, reduce, ImportPipeline, ImportRequest, InMemoryStore, Payload,
    PipelineConfig, ReasonVocabulary, Record, RecordKey, ShardPartitioner, TableSchema,
};

fn make_rows(count: usize, version: &str) -> Vec<Record> {
    (0..count)
        .map(|i| {
            Record::new(
                RecordKey::single(format!("{:015}", 350_000_000_000_000u64 + i as u64)),
                Payload::new().with("status", version).with("source", "bench"),
            )
        })
        .collect()
}

/// Current state with 1% of rows changed, 1% removed and 1% new.
fn make_pair(count: usize) -> (BTreeMap<RecordKey, Payload>, BTreeMap<RecordKey, Payload>) {
    let old: BTreeMap<_, _> = make_rows(count, "v1").into_iter().map(|r| (r.key, r.payload)).collect();
    let mut new = old.clone();
    let step = 100;
    for (i, (key, payload)) in old.iter().enumerate() {
        match i % step {
            0 => {
                new.remove(key);
            }
            1 => {
                new.insert(key.clone(), payload.clone().with("status", "v2"));
            }
            _ => {}
        }
    }
    for i in 0..count / step {
        new.insert(RecordKey::single(format!("new{i:08}")), Payload::new().with("status", "v1"));
    }
    (old, new)
}

fn bench_diff_snapshots(c: &mut Criterion) {
    let mut group = c.benchmark_group("diff_snapshots");

    for rows in [1_000, 10_000, 100_000] {
        let (old, new) = make_pair(rows);
        group.throughput(Throughput::Elements(rows as u64));
        group.bench_with_input(BenchmarkId::new("rows", rows), &(old, new), |b, (old, new)| {
            b.iter(|| diff_snapshots(black_box(old), black_box(new)))
        });
    }

    group.finish();
}

fn bench_collapse_snapshot(c: &mut Criterion) {
    let mut group = c.benchmark_group("collapse_snapshot");

    for rows in [1_000, 10_000, 100_000] {
        let mut input = make_rows(rows, "v1");
        input.extend(make_rows(rows / 10, "v1"));
        group.throughput(Throughput::Elements(input.len() as u64));
        group.bench_with_input(BenchmarkId::new("rows", rows), &input, |b, input| {
            b.iter(|| collapse_snapshot(black_box(input.clone())))
        });
    }

    group.finish();
}

fn bench_partition(c: &mut Criterion) {
    let mut group = c.benchmark_group("partition");
    let rows = make_rows(100_000, "v1");

    for shards in [1, 4, 16] {
        let partitioner = ShardPartitioner::new(shards).unwrap();
        group.throughput(Throughput::Elements(rows.len() as u64));
        group.bench_with_input(BenchmarkId::new("shards", shards), &rows, |b, rows| {
            b.iter(|| partitioner.partition(black_box(rows.clone()), |r| &r.key))
        });
    }

    group.finish();
}

fn bench_reduce(c: &mut Criterion) {
    let vocabulary = ReasonVocabulary::NOTIFICATIONS;
    let chains: Vec<Vec<&str>> = (0..10_000)
        .map(|i| match i % 4 {
            0 => vec!["new"],
            1 => vec!["new", "changed", "resolved"],
            2 => vec!["changed", "changed"],
            _ => vec!["no_longer_seen", "new", "blacklisted"],
        })
        .collect();

    c.bench_function("reduce_10k_chains", |b| {
        b.iter(|| {
            chains
                .iter()
                .filter_map(|chain| reduce(&vocabulary, black_box(chain)).unwrap())
                .count()
        })
    });
}

fn bench_import(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let schema = TableSchema::new("bench", ["imei"], ["status", "source"]);
    let mut group = c.benchmark_group("import");
    group.sample_size(10);

    for rows in [10_000, 100_000] {
        let first = make_rows(rows, "v1");
        let mut second = make_rows(rows, "v1");
        for record in second.iter_mut().step_by(100) {
            record.payload = record.payload.clone().with("status", "v2");
        }

        group.throughput(Throughput::Elements(rows as u64));
        group.bench_with_input(BenchmarkId::new("rows", rows), &(first, second), |b, (first, second)| {
            b.iter(|| {
                runtime.block_on(async {
                    let store = Arc::new(InMemoryStore::new());
                    let pipeline = ImportPipeline::new(store, PipelineConfig::default()).unwrap();
                    pipeline
                        .run(ImportRequest::snapshot(schema.clone(), first.clone()))
                        .await
                        .unwrap();
                    pipeline
                        .run(ImportRequest::snapshot(schema.clone(), second.clone()))
                        .await
                        .unwrap()
                })
            })
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_diff_snapshots,
    bench_collapse_snapshot,
    bench_partition,
    bench_reduce,
    bench_import,
);
criterion_main!(benches);
