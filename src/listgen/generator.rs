//! The list generation pipeline.

use chrono::NaiveDate;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use super::artifacts::{Artifact, ArtifactDescriptor, ListKind};
use super::inputs::{BlacklistEntry, BlockingRule, ComplianceState, ExceptionEntry, NotificationEntry, Party, DATE_FORMAT};
use crate::config::PipelineConfig;
use crate::coordinator::{ActiveRun, BaseRunSelection, ConfigFingerprint, RunCoordinator, RunRequest, SafetyOverrides};
use crate::delta::{collapse_snapshot, diff_snapshots};
use crate::error::PipelineError;
use crate::executor::{ParallelExecutor, Task};
use crate::metrics::{MetricsSink, NoOpMetrics};
use crate::query::IdentifierAllowList;
use crate::reducer::{reduce, ReasonVocabulary};
use crate::shard::{ShardPartitioner, ShardRange};
use crate::store::{LedgerStore, RunStore, StoreResultExt};
use crate::types::{
    ChangeCounts, ChangeEvent, ChangeType, ConflictReport, Marker, Payload, Record, RecordKey, RunId,
    RunMetadata, TableSchema,
};
use crate::validation::{ConflictingPayloadsCheck, ValidationContext, ValidationSuite};

/// Lock and command name of list generation.
pub const LISTGEN_COMMAND: &str = "listgen";

/// One list generation.
#[derive(Debug, Clone)]
pub struct ListgenRequest {
    /// Current membership decisions.
    pub state: ComplianceState,
    /// Party roster.
    pub parties: Vec<Party>,
    /// Active blocking rules.
    pub rules: Vec<BlockingRule>,
    /// Run to compute deltas against.
    pub base: BaseRunSelection,
    /// Safety overrides.
    pub overrides: SafetyOverrides,
    /// Date stamped on file names.
    pub run_date: NaiveDate,
}

impl ListgenRequest {
    /// Request against the most recent successful run.
    pub fn new(state: ComplianceState, parties: Vec<Party>, rules: Vec<BlockingRule>, run_date: NaiveDate) -> Self {
        Self {
            state,
            parties,
            rules,
            base: BaseRunSelection::Latest,
            overrides: SafetyOverrides::default(),
            run_date,
        }
    }

    /// Set the base run selection.
    pub fn with_base(mut self, base: BaseRunSelection) -> Self {
        self.base = base;
        self
    }

    /// Set overrides.
    pub fn with_overrides(mut self, overrides: SafetyOverrides) -> Self {
        self.overrides = overrides;
        self
    }
}

/// Result of a successful list generation.
#[derive(Debug, Clone)]
pub struct ListgenOutcome {
    /// Finished run.
    pub run: RunMetadata,
    /// Run the deltas were computed against.
    pub base_run_id: Option<RunId>,
    /// Every rendered file, sorted by file name.
    pub artifacts: Vec<Artifact>,
    /// Ledger changes per table.
    pub changes: BTreeMap<String, ChangeCounts>,
}

impl ListgenOutcome {
    /// Full list artifact.
    pub fn full(&self, list: &ListKind) -> Option<&Artifact> {
        self.artifacts.iter().find(|a| &a.list == list && a.reason.is_none())
    }

    /// Delta artifact for one reason.
    pub fn delta(&self, list: &ListKind, reason: &str) -> Option<&Artifact> {
        self.artifacts
            .iter()
            .find(|a| &a.list == list && a.reason.as_deref() == Some(reason))
    }

    /// Descriptors of every artifact.
    pub fn descriptors(&self) -> Vec<&ArtifactDescriptor> {
        self.artifacts.iter().map(|a| &a.descriptor).collect()
    }
}

/// How a notification leaves the list.
#[derive(Debug, Clone)]
struct RemovalContext {
    blacklisted: BTreeSet<String>,
    still_notified: BTreeSet<String>,
    pairings: BTreeSet<(String, String)>,
    paired_imeis: BTreeSet<String>,
    notify_imsi_change: bool,
}

impl RemovalContext {
    fn classify(&self, key: &RecordKey) -> &'static str {
        let parts = key.parts();
        let imei = parts[0].as_str();
        let paired = if self.notify_imsi_change {
            parts.get(1).map_or(false, |imsi| self.pairings.contains(&(imei.to_string(), imsi.clone())))
        } else {
            self.paired_imeis.contains(imei)
        };
        if paired {
            "resolved"
        } else if self.blacklisted.contains(imei) {
            "blacklisted"
        } else if self.still_notified.contains(imei) {
            "no_longer_seen"
        } else {
            "resolved"
        }
    }
}

/// Assigns delta reasons to computed changes.
#[derive(Debug, Clone)]
struct ReasonAssigner {
    vocabulary: ReasonVocabulary,
    remove_reason: &'static str,
    removal: Option<RemovalContext>,
}

impl ReasonAssigner {
    fn for_list(list: &ListKind, removal: Option<RemovalContext>) -> Self {
        let remove_reason = match list {
            ListKind::Blacklist => "unblocked",
            ListKind::Notifications(_) => "resolved",
            ListKind::Exceptions(_) => "removed",
        };
        Self { vocabulary: list.vocabulary(), remove_reason, removal }
    }

    fn assign(&self, event: ChangeEvent) -> ChangeEvent {
        let reason = match event.change_type {
            ChangeType::Add => self.vocabulary.add_reason(),
            ChangeType::Update => self.vocabulary.change_reason(),
            ChangeType::Remove => self
                .removal
                .as_ref()
                .map_or(self.remove_reason, |ctx| ctx.classify(&event.key)),
        };
        event.with_reason(reason)
    }
}

/// A list staged for this run.
struct ListInput {
    list: ListKind,
    schema: TableSchema,
    records: Vec<Record>,
    assigner: ReasonAssigner,
}

#[derive(Debug, Default)]
struct StagedList {
    counts: ChangeCounts,
    conflicts: Vec<ConflictReport>,
}

struct ShardLists {
    full: Vec<Record>,
    delta: Vec<(String, Record)>,
}

/// Generates the blacklist and the per-party lists.
///
/// ```text
/// blacklist (per shard) ──▶ party lists (per party, per shard) ──▶ commit ──▶ deltas (per list, per shard)
/// ```
pub struct ListgenPipeline<S: RunStore> {
    coordinator: RunCoordinator<S>,
    config: PipelineConfig,
    metrics: Arc<dyn MetricsSink>,
}

impl<S: RunStore> ListgenPipeline<S> {
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

    /// Fingerprint of the configuration a request would run with.
    pub fn fingerprint(&self, parties: &[Party], rules: &[BlockingRule]) -> Result<ConfigFingerprint, PipelineError> {
        let rules: BTreeSet<&BlockingRule> = rules.iter().collect();
        let parties: BTreeSet<&Party> = parties.iter().collect();
        ConfigFingerprint::compute(&rules, &parties, &self.config.listgen)
    }

    /// Generate all lists.
    pub async fn run(&self, request: ListgenRequest) -> Result<ListgenOutcome, PipelineError> {
        let partitioner = self.config.partitioner()?;
        let inputs = self.prepare(&request, &partitioner)?;
        let fingerprint = self.fingerprint(&request.parties, &request.rules)?;
        let party_ids: Vec<&str> = request.parties.iter().map(|p| p.id.as_str()).collect();

        let run_request = RunRequest::new(LISTGEN_COMMAND, LISTGEN_COMMAND)
            .with_fingerprint(fingerprint)
            .with_base(request.base)
            .with_overrides(request.overrides.clone())
            .with_extra(json!({
                "parties": party_ids,
                "tunables": self.config.listgen,
                "run_date": request.run_date.format(DATE_FORMAT).to_string(),
            }));
        let active = self.coordinator.begin(run_request).await?;

        match self.execute(&active, &partitioner, inputs, request.run_date).await {
            Ok((artifacts, changes)) => {
                for artifact in artifacts.iter().filter(|a| a.reason.is_none()) {
                    self.metrics.gauge(
                        &format!("listgen_records.{}", artifact.list.table()),
                        artifact.descriptor.record_count as f64,
                    );
                }
                let descriptors: Vec<&ArtifactDescriptor> = artifacts.iter().map(|a| &a.descriptor).collect();
                let metadata = json!({ "artifacts": descriptors, "changes": changes });
                if let Err(e) = self.coordinator.annotate(&active, metadata).await {
                    self.coordinator.fail(active, &e).await;
                    return Err(e);
                }
                let base_run_id = active.base_run_id();
                let run = self.coordinator.succeed(active).await?;
                Ok(ListgenOutcome { run, base_run_id, artifacts, changes })
            }
            Err(e) => {
                self.coordinator.fail(active, &e).await;
                Err(e)
            }
        }
    }

    /// Check identifiers and records and turn the state into per-list inputs.
    fn prepare(&self, request: &ListgenRequest, partitioner: &ShardPartitioner) -> Result<Vec<ListInput>, PipelineError> {
        let state = &request.state;
        let include_amnesty = self.config.listgen.amnesty_enabled;
        let known: BTreeSet<&str> = request.parties.iter().map(|p| p.id.as_str()).collect();
        if known.len() != request.parties.len() {
            return Err(PipelineError::Config("duplicate party id in roster".to_string()));
        }
        for party in state.notifications.keys().chain(state.exceptions.keys()) {
            if !known.contains(party.as_str()) {
                return Err(PipelineError::Schema(format!("list entries for unknown party {party}")));
            }
        }

        let mut allow = IdentifierAllowList::new();
        let blacklisted = state.blacklisted_imeis();
        let pairings: BTreeSet<(String, String)> =
            state.pairings.iter().map(|p| (p.imei.clone(), p.imsi.clone())).collect();
        let paired_imeis: BTreeSet<String> = state.pairings.iter().map(|p| p.imei.clone()).collect();

        let mut inputs = vec![ListInput {
            list: ListKind::Blacklist,
            schema: BlacklistEntry::schema(),
            records: state.blacklist.iter().map(BlacklistEntry::to_record).collect(),
            assigner: ReasonAssigner::for_list(&ListKind::Blacklist, None),
        }];
        for party in &request.parties {
            let notifications = ListKind::Notifications(party.id.clone());
            let removal = RemovalContext {
                blacklisted: blacklisted.clone(),
                still_notified: state.notified_imeis(&party.id),
                pairings: pairings.clone(),
                paired_imeis: paired_imeis.clone(),
                notify_imsi_change: self.config.listgen.notify_imsi_change,
            };
            inputs.push(ListInput {
                assigner: ReasonAssigner::for_list(&notifications, Some(removal)),
                schema: NotificationEntry::schema(&party.id, include_amnesty),
                records: state
                    .notifications
                    .get(&party.id)
                    .map(|entries| entries.iter().map(|e| e.to_record(include_amnesty)).collect())
                    .unwrap_or_default(),
                list: notifications,
            });

            let exceptions = ListKind::Exceptions(party.id.clone());
            inputs.push(ListInput {
                assigner: ReasonAssigner::for_list(&exceptions, None),
                schema: ExceptionEntry::schema(&party.id),
                records: state
                    .exceptions
                    .get(&party.id)
                    .map(|entries| entries.iter().map(ExceptionEntry::to_record).collect())
                    .unwrap_or_default(),
                list: exceptions,
            });
        }

        for input in &inputs {
            allow.allow_table(&input.schema.name, partitioner.ranges())?;
            for record in &input.records {
                input.schema.check(record).map_err(PipelineError::Schema)?;
            }
        }
        Ok(inputs)
    }

    async fn execute<L>(
        &self,
        active: &ActiveRun<L>,
        partitioner: &ShardPartitioner,
        inputs: Vec<ListInput>,
        run_date: NaiveDate,
    ) -> Result<(Vec<Artifact>, BTreeMap<String, ChangeCounts>), PipelineError> {
        let store = self.coordinator.store();
        let run_id = active.run_id();
        let marker = Marker::from_run(run_id);
        let base = active.base_run_id();
        let executor = ParallelExecutor::nested(self.config.max_workers);
        tracing::info!(run_id = %run_id, base_run_id = ?base, lists = inputs.len(), "Generating lists");

        let lists: BTreeMap<String, (ListKind, TableSchema)> = inputs
            .iter()
            .map(|i| (i.schema.name.clone(), (i.list.clone(), i.schema.clone())))
            .collect();

        let mut inputs = inputs.into_iter();
        let blacklist = inputs
            .next()
            .ok_or_else(|| PipelineError::Config("blacklist input missing".to_string()))?;
        let mut staged: Vec<(String, StagedList)> = Vec::new();

        // Notification reasons depend on the blacklist, so it goes first.
        let table = blacklist.schema.name.clone();
        let result = stage_list(store, &executor, partitioner, run_id, marker, blacklist).await?;
        staged.push((table, result));

        let party_inputs: Vec<ListInput> = inputs.collect();
        let mut by_party: BTreeMap<String, Vec<ListInput>> = BTreeMap::new();
        for input in party_inputs {
            let party = match &input.list {
                ListKind::Notifications(p) | ListKind::Exceptions(p) => p.clone(),
                ListKind::Blacklist => continue,
            };
            by_party.entry(party).or_default().push(input);
        }
        let party_tasks = by_party
            .into_iter()
            .map(|(party, party_lists)| {
                let store = Arc::clone(store);
                let executor = executor.clone();
                let partitioner = partitioner.clone();
                Task::new(format!("party_{party}"), async move {
                    let mut results = Vec::with_capacity(party_lists.len());
                    for input in party_lists {
                        let table = input.schema.name.clone();
                        let result = stage_list(&store, &executor, &partitioner, run_id, marker, input).await?;
                        results.push((table, result));
                    }
                    Ok::<_, PipelineError>(results)
                })
            })
            .collect();
        for party_results in executor.run_fan_out("party_lists", party_tasks).await? {
            staged.extend(party_results);
        }

        let ctx = ValidationContext {
            conflicts: staged.iter().flat_map(|(_, s)| s.conflicts.iter().cloned()).collect(),
            sample_limit: self.config.sample_limit,
            ..ValidationContext::default()
        };
        ValidationSuite::new().with(ConflictingPayloadsCheck).run(&ctx).into_result()?;

        let applied = store.commit_run(run_id).await.into_pipeline()?;
        tracing::info!(
            run_id = %run_id,
            adds = applied.adds,
            removes = applied.removes,
            updates = applied.updates,
            "Lists committed"
        );
        let changes: BTreeMap<String, ChangeCounts> = staged.into_iter().map(|(t, s)| (t, s.counts)).collect();

        let base_marker = base.map(Marker::from_run);
        let delta_tasks = lists
            .iter()
            .flat_map(|(table, (list, _))| {
                partitioner.ranges().iter().copied().map(move |range| (table.clone(), list.vocabulary(), range))
            })
            .map(|(table, vocabulary, range)| {
                let store = Arc::clone(store);
                Task::new(table.clone(), async move {
                    shard_lists(store.as_ref(), &table, range, &vocabulary, base_marker, marker).await
                })
            })
            .collect();

        let date = run_date.format(DATE_FORMAT).to_string();
        let mut artifacts = Vec::new();
        executor
            .run_phase_counted("deltas", delta_tasks, |table, shards: Vec<ShardLists>| {
                let (list, schema) = lists
                    .get(table)
                    .ok_or_else(|| PipelineError::TaskFailed(format!("unexpected list {table}")))?;
                artifacts.extend(render_list(list, schema, shards, &date, base, run_id));
                Ok(())
            })
            .await?;
        artifacts.sort_by(|a, b| a.descriptor.file_name.cmp(&b.descriptor.file_name));
        Ok((artifacts, changes))
    }
}

/// Diff one list against its open records shard by shard and stage the changes.
async fn stage_list<S: LedgerStore>(
    store: &Arc<S>,
    executor: &ParallelExecutor,
    partitioner: &ShardPartitioner,
    run_id: RunId,
    marker: Marker,
    input: ListInput,
) -> Result<StagedList, PipelineError> {
    let table = input.schema.name.clone();
    let assigner = Arc::new(input.assigner);
    let tasks = partitioner
        .ranges()
        .iter()
        .copied()
        .zip(partitioner.partition(input.records, |r| &r.key))
        .map(|(range, records)| {
            let store = Arc::clone(store);
            let table = table.clone();
            let assigner = Arc::clone(&assigner);
            Task::new(format!("shard_{}", range.index), async move {
                let open: BTreeMap<RecordKey, Payload> = store
                    .open_records(&table, range)
                    .await
                    .into_pipeline()?
                    .into_iter()
                    .map(|r| (r.key, r.payload))
                    .collect();
                let collapsed = collapse_snapshot(records);
                let events: Vec<ChangeEvent> = diff_snapshots(&open, &collapsed.rows)
                    .into_iter()
                    .map(|e| assigner.assign(e))
                    .collect();
                let counts = ChangeCounts::of(&events);
                if !events.is_empty() {
                    store.stage_shard(run_id, &table, range, events, marker).await.into_pipeline()?;
                }
                Ok::<_, PipelineError>(StagedList { counts, conflicts: collapsed.conflicts })
            })
        })
        .collect();

    let shards = executor.run_phase(&format!("stage_{table}"), tasks).await?;
    Ok(shards.into_iter().fold(StagedList::default(), |mut acc, s| {
        acc.counts += s.counts;
        acc.conflicts.extend(s.conflicts);
        acc
    }))
}

/// Full list and reduced delta rows of one list within one shard.
async fn shard_lists<S: LedgerStore>(
    store: &S,
    table: &str,
    range: ShardRange,
    vocabulary: &ReasonVocabulary,
    base: Option<Marker>,
    marker: Marker,
) -> Result<ShardLists, PipelineError> {
    // Runs hold the pipeline lock, so the open records are the list as of `marker`.
    let full = store.open_records(table, range).await.into_pipeline()?;

    let Some(base) = base else {
        let delta = full
            .iter()
            .map(|r| (vocabulary.add_reason().to_string(), r.clone()))
            .collect();
        return Ok(ShardLists { full, delta });
    };

    let mut chains: BTreeMap<RecordKey, (Vec<String>, Payload)> = BTreeMap::new();
    for entry in store.change_log(table, range, Some(base), marker).await.into_pipeline()? {
        let reason = entry.reason.ok_or_else(|| {
            PipelineError::LedgerCorruption(format!("change log entry for {} in {table} has no reason", entry.key))
        })?;
        let chain = chains.entry(entry.key).or_insert_with(|| (Vec::new(), Payload::new()));
        chain.0.push(reason);
        chain.1 = entry.payload;
    }

    let mut delta = Vec::new();
    for (key, (reasons, payload)) in chains {
        if let Some(reason) = reduce(vocabulary, &reasons)? {
            delta.push((reason, Record::new(key, payload)));
        }
    }
    Ok(ShardLists { full, delta })
}

/// Full list plus one delta file per reason, empty ones included.
fn render_list(
    list: &ListKind,
    schema: &TableSchema,
    shards: Vec<ShardLists>,
    date: &str,
    base: Option<RunId>,
    run_id: RunId,
) -> Vec<Artifact> {
    let vocabulary = list.vocabulary();
    let mut full = Vec::new();
    let mut by_reason: BTreeMap<String, Vec<Record>> =
        vocabulary.all().into_iter().map(|r| (r.to_string(), Vec::new())).collect();
    for shard in shards {
        full.extend(shard.full);
        for (reason, record) in shard.delta {
            by_reason.entry(reason).or_default().push(record);
        }
    }
    full.sort_by(|a, b| a.key.cmp(&b.key));

    let mut artifacts = vec![Artifact::render(list.full_file_name(date), list.clone(), None, schema, &full)];
    for (reason, mut records) in by_reason {
        records.sort_by(|a, b| a.key.cmp(&b.key));
        let file_name = list.delta_file_name(date, base, run_id, &reason);
        artifacts.push(Artifact::render(file_name, list.clone(), Some(reason), schema, &records));
    }
    tracing::debug!(list = %list.table(), records = full.len(), files = artifacts.len(), "Rendered list");
    artifacts
}

#[cfg(test)]
mod tests {
    use super::*;

    fn removal(notify_imsi_change: bool) -> RemovalContext {
        RemovalContext {
            blacklisted: ["b".to_string()].into_iter().collect(),
            still_notified: ["n".to_string()].into_iter().collect(),
            pairings: [("p".to_string(), "imsi1".to_string())].into_iter().collect(),
            paired_imeis: ["p".to_string()].into_iter().collect(),
            notify_imsi_change,
        }
    }

    fn key(imei: &str, imsi: &str) -> RecordKey {
        RecordKey::new(vec![imei.to_string(), imsi.to_string(), "msisdn".to_string()])
    }

    #[test]
    fn test_notification_removal_reasons() {
        let ctx = removal(true);
        assert_eq!(ctx.classify(&key("p", "imsi1")), "resolved");
        assert_eq!(ctx.classify(&key("b", "imsi1")), "blacklisted");
        assert_eq!(ctx.classify(&key("n", "imsi1")), "no_longer_seen");
        assert_eq!(ctx.classify(&key("x", "imsi1")), "resolved");
    }

    #[test]
    fn test_pairing_on_imei_alone() {
        let mut ctx = removal(false);
        ctx.blacklisted.insert("p".to_string());
        assert_eq!(ctx.classify(&key("p", "other")), "resolved");
        let strict = RemovalContext { notify_imsi_change: true, ..ctx };
        assert_eq!(strict.classify(&key("p", "other")), "blacklisted");
    }

    #[test]
    fn test_reason_assignment() {
        let blacklist = ReasonAssigner::for_list(&ListKind::Blacklist, None);
        let record = Record::new(RecordKey::single("1"), Payload::new());
        assert_eq!(blacklist.assign(ChangeEvent::add(record.clone())).reason.as_deref(), Some("blocked"));
        assert_eq!(blacklist.assign(ChangeEvent::remove(record.clone())).reason.as_deref(), Some("unblocked"));
        assert_eq!(blacklist.assign(ChangeEvent::update(record.clone())).reason.as_deref(), Some("changed"));

        let exceptions = ReasonAssigner::for_list(&ListKind::Exceptions("op1".to_string()), None);
        assert_eq!(exceptions.assign(ChangeEvent::add(record.clone())).reason.as_deref(), Some("added"));
        assert_eq!(exceptions.assign(ChangeEvent::remove(record)).reason.as_deref(), Some("removed"));
    }
}
