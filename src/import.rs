//! Import pipeline: bring a ledger table in line with an incoming list.
//!
//! ```text
//! begin run ──▶ diff (per shard) ──▶ validate ──▶ stage (per shard) ──▶ commit ──▶ finish run
//!                  │                    │
//!                  ▼                    ▼
//!            open records         ValidationSuite
//! ```
//!
//! A full snapshot is diffed against the open records; a tagged batch is
//! collapsed and checked against them. Either way nothing is visible to
//! readers until every shard staged cleanly and the run committed.

use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::PipelineConfig;
use crate::coordinator::{ActiveRun, RunCoordinator, RunRequest, SafetyOverrides};
use crate::delta::{
    check_presence, collapse_snapshot, collapse_tagged, diff_snapshots, effective_events,
    PresenceFindings, TaggedRecord,
};
use crate::error::PipelineError;
use crate::executor::{ParallelExecutor, Task};
use crate::metrics::{MetricsSink, NoOpMetrics};
use crate::query::is_valid_identifier;
use crate::shard::ShardRange;
use crate::store::{LedgerStore, RunStore, StoreResultExt};
use crate::types::{
    ChangeCounts, ChangeEvent, ConflictReport, Marker, Payload, Record, RecordKey, RunMetadata,
    TableSchema,
};
use crate::validation::{ValidationContext, ValidationReport, ValidationSuite};

/// Incoming rows.
#[derive(Debug, Clone)]
pub enum ImportInput {
    /// The complete new list. The delta is computed.
    Snapshot(Vec<Record>),
    /// Pre-classified changes. The delta is validated.
    Tagged(Vec<TaggedRecord>),
}

impl ImportInput {
    fn mode(&self) -> &'static str {
        match self {
            Self::Snapshot(_) => "snapshot",
            Self::Tagged(_) => "tagged",
        }
    }

    fn len(&self) -> usize {
        match self {
            Self::Snapshot(rows) => rows.len(),
            Self::Tagged(rows) => rows.len(),
        }
    }

    fn records(&self) -> Box<dyn Iterator<Item = &Record> + '_> {
        match self {
            Self::Snapshot(rows) => Box::new(rows.iter()),
            Self::Tagged(rows) => Box::new(rows.iter().map(|t| &t.record)),
        }
    }
}

/// One import.
#[derive(Debug, Clone)]
pub struct ImportRequest {
    /// Target table.
    pub schema: TableSchema,
    /// Incoming rows.
    pub input: ImportInput,
    /// Safety overrides.
    pub overrides: SafetyOverrides,
}

impl ImportRequest {
    /// Import a full snapshot.
    pub fn snapshot(schema: TableSchema, rows: Vec<Record>) -> Self {
        Self { schema, input: ImportInput::Snapshot(rows), overrides: SafetyOverrides::default() }
    }

    /// Import a tagged delta.
    pub fn tagged(schema: TableSchema, rows: Vec<TaggedRecord>) -> Self {
        Self { schema, input: ImportInput::Tagged(rows), overrides: SafetyOverrides::default() }
    }

    /// Set overrides.
    pub fn with_overrides(mut self, overrides: SafetyOverrides) -> Self {
        self.overrides = overrides;
        self
    }
}

/// Row counts of one import.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportStats {
    /// Open records before the run.
    pub rows_before: u64,
    /// Open records after the run.
    pub rows_after: u64,
    /// Rows received.
    pub raw_records: u64,
    /// Changes received (tagged) or computed (snapshot), by type.
    pub supplied: ChangeCounts,
    /// Changes applied, by type.
    pub valid: ChangeCounts,
    /// Changes skipped as duplicate or ineffective, by type.
    pub invalid: ChangeCounts,
    /// Rows collapsed into an earlier row with the same key.
    pub duplicate_rows: u64,
}

impl ImportStats {
    /// Report the stats as gauges.
    pub fn emit(&self, metrics: &dyn MetricsSink, applied: &ChangeCounts) {
        metrics.gauge("input_records.raw", self.raw_records as f64);
        metrics.gauge("input_records.delta.valid", self.valid.total() as f64);
        metrics.gauge("input_records.delta.invalid", self.invalid.total() as f64);
        for (name, change_type) in [
            ("adds", crate::types::ChangeType::Add),
            ("removes", crate::types::ChangeType::Remove),
            ("updates", crate::types::ChangeType::Update),
        ] {
            metrics.gauge(&format!("input_records.delta_{name}.valid"), self.valid.get(change_type) as f64);
            metrics.gauge(&format!("input_records.delta_{name}.invalid"), self.invalid.get(change_type) as f64);
        }
        metrics.gauge("imported_records.inserted", applied.adds as f64);
        metrics.gauge("imported_records.updated", applied.updates as f64);
        metrics.gauge("imported_records.deleted", applied.removes as f64);
    }
}

/// Result of a successful import.
#[derive(Debug, Clone)]
pub struct ImportOutcome {
    /// Finished run.
    pub run: RunMetadata,
    /// Row counts.
    pub stats: ImportStats,
    /// Every check verdict, including advisory failures.
    pub report: ValidationReport,
    /// Changes the commit applied.
    pub applied: ChangeCounts,
}

#[derive(Debug)]
struct ShardDelta {
    range: ShardRange,
    events: Vec<ChangeEvent>,
    proposed: ChangeCounts,
    supplied: ChangeCounts,
    conflicts: Vec<ConflictReport>,
    multiple_changes: Vec<RecordKey>,
    findings: Option<PresenceFindings>,
    duplicate_rows: u64,
}

enum ShardInput {
    Snapshot(Vec<Record>),
    Tagged(Vec<TaggedRecord>),
}

/// Runs imports against a store.
pub struct ImportPipeline<S: RunStore> {
    coordinator: RunCoordinator<S>,
    config: PipelineConfig,
    metrics: Arc<dyn MetricsSink>,
}

impl<S: RunStore> ImportPipeline<S> {
    /// Create a pipeline. Fails on invalid configuration.
    pub fn new(store: Arc<S>, config: PipelineConfig) -> Result<Self, PipelineError> {
        config.validate()?;
        Ok(Self {
            coordinator: RunCoordinator::new(store),
            config,
            metrics: Arc::new(NoOpMetrics),
        })
    }

    /// Report gauges to `metrics`.
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Import one batch.
    pub async fn run(&self, request: ImportRequest) -> Result<ImportOutcome, PipelineError> {
        let ImportRequest { schema, input, overrides } = request;
        if !is_valid_identifier(&schema.name) {
            return Err(crate::query::IdentifierError::Malformed(schema.name.clone()).into());
        }
        for record in input.records() {
            schema.check(record).map_err(PipelineError::Schema)?;
        }

        let run_request = RunRequest::new(format!("import_{}", schema.name), format!("import:{}", schema.name))
            .with_overrides(overrides)
            .with_extra(json!({
                "table": schema.name,
                "mode": input.mode(),
                "thresholds": {
                    "size_variation_percent": self.config.import_size.percent,
                    "size_variation_absolute": self.config.import_size.absolute,
                },
            }));
        let active = self.coordinator.begin(run_request).await?;

        match self.execute(&active, &schema, input).await {
            Ok((stats, report, applied)) => {
                stats.emit(self.metrics.as_ref(), &applied);
                let metadata = json!({
                    "input_stats": {
                        "raw_records": stats.raw_records,
                        "supplied": stats.supplied,
                        "valid": stats.valid,
                        "invalid": stats.invalid,
                        "duplicate_rows": stats.duplicate_rows,
                    },
                    "output_stats": {
                        "rows_before": stats.rows_before,
                        "rows_after": stats.rows_after,
                        "applied": applied,
                    },
                    "validation": report,
                });
                if let Err(e) = self.coordinator.annotate(&active, metadata).await {
                    self.coordinator.fail(active, &e).await;
                    return Err(e);
                }
                let run = self.coordinator.succeed(active).await?;
                Ok(ImportOutcome { run, stats, report, applied })
            }
            Err(e) => {
                self.coordinator.fail(active, &e).await;
                Err(e)
            }
        }
    }

    async fn execute<L>(
        &self,
        active: &ActiveRun<L>,
        schema: &TableSchema,
        input: ImportInput,
    ) -> Result<(ImportStats, ValidationReport, ChangeCounts), PipelineError> {
        let store = self.coordinator.store();
        let table = schema.name.clone();
        let run_id = active.run_id();
        let at = Marker::from_timestamp(active.run.start_time);
        let partitioner = self.config.partitioner()?;
        let executor = ParallelExecutor::new(self.config.max_workers);
        let tagged = matches!(input, ImportInput::Tagged(_));
        let raw_records = input.len() as u64;

        let rows_before = store.open_count(&table).await.into_pipeline()?;
        tracing::info!(run_id = %run_id, table = %table, rows_before, raw_records, tagged, "Starting import");

        let shard_inputs: Vec<ShardInput> = match input {
            ImportInput::Snapshot(rows) => partitioner
                .partition(rows, |r| &r.key)
                .into_iter()
                .map(ShardInput::Snapshot)
                .collect(),
            ImportInput::Tagged(rows) => partitioner
                .partition(rows, |t| &t.record.key)
                .into_iter()
                .map(ShardInput::Tagged)
                .collect(),
        };

        let diff_tasks = partitioner
            .ranges()
            .iter()
            .copied()
            .zip(shard_inputs)
            .map(|(range, shard_input)| {
                let store = Arc::clone(store);
                let table = table.clone();
                Task::new(format!("shard_{}", range.index), async move {
                    let open: BTreeMap<RecordKey, Payload> = store
                        .open_records(&table, range)
                        .await
                        .into_pipeline()?
                        .into_iter()
                        .map(|r| (r.key, r.payload))
                        .collect();
                    Ok(diff_shard(range, shard_input, &open))
                })
            })
            .collect();
        let deltas: Vec<ShardDelta> = executor.run_phase("diff", diff_tasks).await?;

        let mut ctx = ValidationContext {
            current_size: rows_before,
            sample_limit: self.config.sample_limit,
            findings: tagged.then(PresenceFindings::default),
            ..ValidationContext::default()
        };
        let mut supplied = ChangeCounts::default();
        let mut valid = ChangeCounts::default();
        let mut duplicate_rows = 0;
        for delta in &deltas {
            ctx.staged += delta.proposed;
            ctx.conflicts.extend(delta.conflicts.iter().cloned());
            ctx.multiple_changes.extend(delta.multiple_changes.iter().cloned());
            if let (Some(all), Some(shard)) = (ctx.findings.as_mut(), delta.findings.clone()) {
                all.extend(shard);
            }
            supplied += delta.supplied;
            valid += ChangeCounts::of(&delta.events);
            duplicate_rows += delta.duplicate_rows;
        }

        let suite = ValidationSuite::standard(self.config.import_size).with_modes(&active.overrides.check_modes());
        let report = suite.run(&ctx);
        for failure in report.failures() {
            self.metrics.increment(&format!("validation_failures.{}", failure.metric_key));
        }
        let report = report.into_result()?;

        let stage_tasks = deltas
            .into_iter()
            .filter(|d| !d.events.is_empty())
            .map(|delta| {
                let store = Arc::clone(store);
                let table = table.clone();
                Task::new(format!("shard_{}", delta.range.index), async move {
                    store
                        .stage_shard(run_id, &table, delta.range, delta.events, at)
                        .await
                        .into_pipeline()
                })
            })
            .collect();
        executor.run_phase("stage", stage_tasks).await?;

        let applied = store.commit_run(run_id).await.into_pipeline()?;
        let rows_after = store.open_count(&table).await.into_pipeline()?;
        tracing::info!(
            run_id = %run_id,
            table = %table,
            rows_before,
            rows_after,
            adds = applied.adds,
            removes = applied.removes,
            updates = applied.updates,
            "Import committed"
        );

        let stats = ImportStats {
            rows_before,
            rows_after,
            raw_records,
            supplied,
            valid,
            invalid: supplied.saturating_sub(&valid),
            duplicate_rows,
        };
        Ok((stats, report, applied))
    }
}

fn diff_shard(range: ShardRange, input: ShardInput, open: &BTreeMap<RecordKey, Payload>) -> ShardDelta {
    match input {
        ShardInput::Snapshot(rows) => {
            let collapsed = collapse_snapshot(rows);
            let events = diff_snapshots(open, &collapsed.rows);
            let counts = ChangeCounts::of(&events);
            ShardDelta {
                range,
                events,
                proposed: counts,
                supplied: counts,
                conflicts: collapsed.conflicts,
                multiple_changes: Vec::new(),
                findings: None,
                duplicate_rows: collapsed.duplicate_rows,
            }
        }
        ShardInput::Tagged(rows) => {
            let collapsed = collapse_tagged(rows);
            let findings = check_presence(&collapsed.events, open);
            let events = effective_events(&collapsed, &findings, open);
            ShardDelta {
                range,
                proposed: ChangeCounts::of(&collapsed.events),
                supplied: collapsed.supplied,
                events,
                conflicts: collapsed.conflicts.clone(),
                multiple_changes: collapsed.multiple_changes.clone(),
                findings: Some(findings),
                duplicate_rows: collapsed.duplicate_rows,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChangeType;

    fn record(key: &str, status: &str) -> Record {
        Record::new(RecordKey::single(key), Payload::new().with("status", status))
    }

    fn open(rows: &[(&str, &str)]) -> BTreeMap<RecordKey, Payload> {
        rows.iter().map(|(k, v)| (RecordKey::single(*k), Payload::new().with("status", *v))).collect()
    }

    #[test]
    fn test_snapshot_shard_counts_computed_changes() {
        let delta = diff_shard(
            ShardRange::all(),
            ShardInput::Snapshot(vec![record("a", "x"), record("b", "y"), record("b", "y")]),
            &open(&[("a", "old"), ("c", "z")]),
        );
        assert_eq!(delta.proposed, ChangeCounts { adds: 1, removes: 1, updates: 1 });
        assert_eq!(delta.supplied, delta.proposed);
        assert_eq!(delta.duplicate_rows, 1);
        assert!(delta.findings.is_none());
    }

    #[test]
    fn test_tagged_shard_skips_ineffective_changes() {
        let delta = diff_shard(
            ShardRange::all(),
            ShardInput::Tagged(vec![
                TaggedRecord::new(record("a", "x"), ChangeType::Add),
                TaggedRecord::new(record("a", "x"), ChangeType::Add),
                TaggedRecord::new(record("b", "x"), ChangeType::Add),
                TaggedRecord::new(record("c", "z"), ChangeType::Update),
                TaggedRecord::new(record("ghost", "z"), ChangeType::Remove),
            ]),
            &open(&[("b", "x"), ("c", "z")]),
        );
        assert_eq!(delta.supplied, ChangeCounts { adds: 3, removes: 1, updates: 1 });
        assert_eq!(delta.proposed, ChangeCounts { adds: 2, removes: 1, updates: 1 });
        assert_eq!(ChangeCounts::of(&delta.events), ChangeCounts { adds: 1, removes: 0, updates: 0 });
        let findings = delta.findings.unwrap();
        assert_eq!(findings.adds_present, vec![RecordKey::single("b")]);
        assert_eq!(findings.noop_updates, vec![RecordKey::single("c")]);
        assert_eq!(findings.removes_absent, vec![RecordKey::single("ghost")]);
    }
}
