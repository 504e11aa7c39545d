//! Integration tests for the import pipeline.
//!
//! These tests drive full imports against the in-memory store:
//! 1. Snapshot diffing and commit
//! 2. Idempotent re-import
//! 3. Historic size gate
//! 4. Tagged batches and their checks
//! 5. Overrides and their audit trail
//! 6. Metrics and locking

use delta_ledger::delta::TaggedRecord;
use delta_ledger::validation::HistoricSizeCheck;
use delta_ledger::{
    ChangeCounts, ChangeType, ImportPipeline, ImportRequest, InMemoryStore, LedgerStore, Marker,
    Payload, PipelineConfig, PipelineError, Record, RecordKey, RunStatus, RunStore, SafetyOverrides,
    ShardRange, TableSchema, TestMetrics,
};
use std::sync::Arc;

// ─────────────────────────────────────────────────────────────────────────────
// Test Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn schema() -> TableSchema {
    TableSchema::new("stolen", ["imei"], ["status"])
}

fn record(imei: &str, status: &str) -> Record {
    Record::new(RecordKey::single(imei), Payload::new().with("status", status))
}

fn initial_rows() -> Vec<Record> {
    (0..100).map(|i| record(&format!("k{i:03}"), "v1")).collect()
}

/// Drops k000..k004, updates k005..k007 and adds n000..n009.
fn second_rows() -> Vec<Record> {
    let mut rows: Vec<Record> = (5..100)
        .map(|i| record(&format!("k{i:03}"), if i < 8 { "v2" } else { "v1" }))
        .collect();
    rows.extend((0..10).map(|i| record(&format!("n{i:03}"), "v1")));
    rows
}

fn config() -> PipelineConfig {
    PipelineConfig::default().with_max_workers(4)
}

fn pipeline(store: &Arc<InMemoryStore>, config: PipelineConfig) -> ImportPipeline<InMemoryStore> {
    ImportPipeline::new(Arc::clone(store), config).unwrap()
}

async fn seeded() -> Arc<InMemoryStore> {
    let store = Arc::new(InMemoryStore::new());
    pipeline(&store, config())
        .run(ImportRequest::snapshot(schema(), initial_rows()))
        .await
        .unwrap();
    store
}

async fn last_run_status(store: &InMemoryStore) -> (RunStatus, serde_json::Map<String, serde_json::Value>) {
    let run = store.runs(Some("import_stolen"), false).await.unwrap().remove(0);
    (run.status, run.extra)
}

// ─────────────────────────────────────────────────────────────────────────────
// Snapshot imports
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_snapshot_import_applies_computed_delta() {
    let store = seeded().await;
    let first_run = store.runs(Some("import_stolen"), true).await.unwrap().remove(0);

    let outcome = pipeline(&store, config())
        .run(ImportRequest::snapshot(schema(), second_rows()))
        .await
        .unwrap();

    assert_eq!(outcome.applied, ChangeCounts { adds: 10, removes: 5, updates: 3 });
    assert_eq!(outcome.stats.rows_before, 100);
    assert_eq!(outcome.stats.rows_after, 105);
    assert_eq!(store.open_count("stolen").await.unwrap(), 105);
    assert!(outcome.run.success());

    // The previous state stays queryable.
    let before = store
        .as_of("stolen", Marker::from_timestamp(first_run.start_time))
        .await
        .unwrap();
    assert_eq!(before.len(), 100);
    assert!(before.iter().all(|r| r.payload.get("status") == Some("v1")));

    let history = store.history("stolen", &RecordKey::single("k005")).await.unwrap();
    assert_eq!(history.len(), 2);
    assert!(!history[0].is_open());
    assert_eq!(history[1].payload.get("status"), Some("v2"));
}

#[tokio::test]
async fn test_reimporting_same_snapshot_is_a_noop() {
    let store = seeded().await;
    let outcome = pipeline(&store, config())
        .run(ImportRequest::snapshot(schema(), initial_rows()))
        .await
        .unwrap();

    assert_eq!(outcome.applied, ChangeCounts::default());
    assert_eq!(outcome.stats.rows_after, 100);
    let history = store.history("stolen", &RecordKey::single("k000")).await.unwrap();
    assert_eq!(history.len(), 1);
}

#[tokio::test]
async fn test_duplicate_rows_collapse_and_conflicts_block() {
    let store = seeded().await;

    let mut rows = initial_rows();
    rows.push(record("k000", "v1"));
    let outcome = pipeline(&store, config())
        .run(ImportRequest::snapshot(schema(), rows.clone()))
        .await
        .unwrap();
    assert_eq!(outcome.stats.duplicate_rows, 1);
    assert_eq!(outcome.applied, ChangeCounts::default());

    rows.push(record("k001", "other"));
    let err = pipeline(&store, config())
        .run(ImportRequest::snapshot(schema(), rows).with_overrides(SafetyOverrides::new().disable("conflicting_payloads")))
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Conflict { conflict_count: 1, .. }));
    assert_eq!(store.open_count("stolen").await.unwrap(), 100);
}

// ─────────────────────────────────────────────────────────────────────────────
// Historic size gate
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_size_gate_threshold() {
    let shrunk: Vec<Record> = initial_rows().into_iter().skip(5).collect();

    let store = seeded().await;
    let outcome = pipeline(&store, config())
        .run(ImportRequest::snapshot(schema(), shrunk.clone()))
        .await
        .unwrap();
    assert_eq!(outcome.stats.rows_after, 95);
    assert!(outcome.report.get(HistoricSizeCheck::NAME).unwrap().pass);

    let store = seeded().await;
    let metrics = Arc::new(TestMetrics::default());
    let strict = PipelineConfig {
        import_size: HistoricSizeCheck { percent: 0.96, absolute: 1000 },
        ..config()
    };
    let err = pipeline(&store, strict)
        .with_metrics(metrics.clone())
        .run(ImportRequest::snapshot(schema(), shrunk))
        .await
        .unwrap_err();

    let PipelineError::ValidationFailure(report) = &err else {
        panic!("expected validation failure, got {err:?}");
    };
    let size = report.get(HistoricSizeCheck::NAME).unwrap();
    assert!(!size.pass);
    assert_eq!(size.observed, 95.0);
    assert_eq!(size.threshold, 96.0);
    assert_eq!(metrics.count("validation_failures.historic_import_size"), 1);

    assert_eq!(store.open_count("stolen").await.unwrap(), 100);
    let (status, extra) = last_run_status(&store).await;
    assert_eq!(status, RunStatus::Error);
    assert!(extra["error"].as_str().unwrap().contains("historic_size"));
}

#[tokio::test]
async fn test_size_gate_override_is_recorded() {
    let store = seeded().await;
    let strict = PipelineConfig {
        import_size: HistoricSizeCheck { percent: 0.99, absolute: 1000 },
        ..config()
    };
    let shrunk: Vec<Record> = initial_rows().into_iter().skip(5).collect();
    let outcome = pipeline(&store, strict)
        .run(
            ImportRequest::snapshot(schema(), shrunk)
                .with_overrides(SafetyOverrides::new().advisory(HistoricSizeCheck::NAME)),
        )
        .await
        .unwrap();

    assert!(!outcome.report.get(HistoricSizeCheck::NAME).unwrap().pass);
    assert_eq!(outcome.stats.rows_after, 95);
    let advisory = &outcome.run.extra["overrides"]["advisory_checks"];
    assert_eq!(advisory, &serde_json::json!([HistoricSizeCheck::NAME]));
}

// ─────────────────────────────────────────────────────────────────────────────
// Tagged imports
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_tagged_add_and_remove_on_one_key_is_a_conflict() {
    let store = seeded().await;
    let rows = vec![
        TaggedRecord::new(record("k000", "v1"), ChangeType::Remove),
        TaggedRecord::new(record("k000", "v1"), ChangeType::Add),
        TaggedRecord::new(record("n000", "v1"), ChangeType::Add),
    ];
    let err = pipeline(&store, config())
        .run(ImportRequest::tagged(schema(), rows))
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::Conflict { .. }));
    assert!(!err.report().unwrap().get("multiple_changes").unwrap().pass);
    assert_eq!(store.open_count("stolen").await.unwrap(), 100);
    assert!(store.history("stolen", &RecordKey::single("n000")).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_tagged_referential_failure() {
    let store = seeded().await;
    let rows = vec![
        TaggedRecord::new(record("ghost", "v1"), ChangeType::Remove),
        TaggedRecord::new(record("n000", "v1"), ChangeType::Add),
    ];
    let err = pipeline(&store, config())
        .run(ImportRequest::tagged(schema(), rows))
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::ReferentialIntegrity(_)));
    assert_eq!(err.code(), "REFERENTIAL_INTEGRITY");
    assert_eq!(store.open_count("stolen").await.unwrap(), 100);
}

#[tokio::test]
async fn test_tagged_advisory_override_applies_effective_changes() {
    let store = seeded().await;
    let rows = vec![
        TaggedRecord::new(record("ghost", "v1"), ChangeType::Remove),
        TaggedRecord::new(record("n000", "v1"), ChangeType::Add),
        TaggedRecord::new(record("k001", "v1"), ChangeType::Remove),
        TaggedRecord::new(record("k002", "v9"), ChangeType::Update),
    ];
    let outcome = pipeline(&store, config())
        .run(ImportRequest::tagged(schema(), rows).with_overrides(SafetyOverrides::new().advisory("removes_present")))
        .await
        .unwrap();

    assert_eq!(outcome.applied, ChangeCounts { adds: 1, removes: 1, updates: 1 });
    assert_eq!(outcome.stats.supplied, ChangeCounts { adds: 1, removes: 2, updates: 1 });
    assert_eq!(outcome.stats.invalid, ChangeCounts { adds: 0, removes: 1, updates: 0 });
    assert_eq!(outcome.stats.rows_after, 100);
    let removes = outcome.report.get("removes_present").unwrap();
    assert!(!removes.pass);
    assert_eq!(removes.sample, vec!["ghost".to_string()]);

    let history = store.history("stolen", &RecordKey::single("k001")).await.unwrap();
    assert!(!history[0].is_open());
}

// ─────────────────────────────────────────────────────────────────────────────
// Metrics, schema and locking
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_metrics_gauges() {
    let store = seeded().await;
    let metrics = Arc::new(TestMetrics::default());
    pipeline(&store, config())
        .with_metrics(metrics.clone())
        .run(ImportRequest::snapshot(schema(), second_rows()))
        .await
        .unwrap();

    assert_eq!(metrics.gauge_value("input_records.raw"), Some(105.0));
    assert_eq!(metrics.gauge_value("input_records.delta.valid"), Some(18.0));
    assert_eq!(metrics.gauge_value("input_records.delta.invalid"), Some(0.0));
    assert_eq!(metrics.gauge_value("input_records.delta_adds.valid"), Some(10.0));
    assert_eq!(metrics.gauge_value("imported_records.inserted"), Some(10.0));
    assert_eq!(metrics.gauge_value("imported_records.updated"), Some(3.0));
    assert_eq!(metrics.gauge_value("imported_records.deleted"), Some(5.0));
}

#[tokio::test]
async fn test_schema_violation_writes_nothing() {
    let store = Arc::new(InMemoryStore::new());
    let bad = Record::new(RecordKey::single("k"), Payload::new().with("colour", "red"));
    let err = pipeline(&store, config())
        .run(ImportRequest::snapshot(schema(), vec![bad]))
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Schema(_)));
    assert!(store.runs(None, false).await.unwrap().is_empty());

    let bad_table = TableSchema::new("stolen; drop", ["imei"], ["status"]);
    let err = pipeline(&store, config())
        .run(ImportRequest::snapshot(bad_table, vec![]))
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::InvalidIdentifier(_)));
}

#[tokio::test]
async fn test_held_lock_blocks_import() {
    let store = seeded().await;
    let guard = store.try_lock("import:stolen").await.unwrap().unwrap();

    let err = pipeline(&store, config())
        .run(ImportRequest::snapshot(schema(), second_rows()))
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::LockContention { .. }));
    assert_eq!(store.open_count("stolen").await.unwrap(), 100);

    // Other tables are not affected.
    let other = TableSchema::new("lost", ["imei"], ["status"]);
    pipeline(&store, config())
        .run(ImportRequest::snapshot(other, vec![record("1", "x")]))
        .await
        .unwrap();

    drop(guard);
    pipeline(&store, config())
        .run(ImportRequest::snapshot(schema(), second_rows()))
        .await
        .unwrap();
    assert_eq!(store.open_count("stolen").await.unwrap(), 105);
}

#[tokio::test]
async fn test_open_records_follow_shards() {
    let store = seeded().await;
    let partitioner = config().partitioner().unwrap();
    let mut total = 0;
    for range in partitioner.ranges() {
        let records = store.open_records("stolen", *range).await.unwrap();
        assert!(records.iter().all(|r| range.contains_key(&r.key)));
        total += records.len();
    }
    assert_eq!(total, 100);
    assert_eq!(store.open_records("stolen", ShardRange::all()).await.unwrap().len(), 100);
}
