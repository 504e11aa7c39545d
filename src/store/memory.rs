//! In-memory ledger store for testing.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use uuid::Uuid;

use super::{LedgerStore, RunStore};
use crate::coordinator::ConfigFingerprint;
use crate::error::PipelineError;
use crate::ledger::{LedgerError, TemporalLedger};
use crate::shard::ShardRange;
use crate::types::{
    ChangeCounts, ChangeEvent, ChangeLogEntry, Interval, Marker, Record, RecordKey, RunId,
    RunMetadata, RunStatus,
};

/// Error type for in-memory store.
#[derive(Debug, Clone, thiserror::Error)]
pub enum InMemoryError {
    /// Applying staged events hit an impossible interval operation.
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),
    /// Run not found.
    #[error("Run not found: {0}")]
    RunNotFound(RunId),
    /// Run is not in the running state.
    #[error("Run {0} is not running")]
    RunNotRunning(RunId),
    /// Staged event outside the shard range it was staged for.
    #[error("Event for key {key} (virtual shard {shard_id}) staged outside its shard range")]
    ShardMismatch {
        /// Offending key.
        key: RecordKey,
        /// Its virtual shard.
        shard_id: u32,
    },
}

impl From<InMemoryError> for PipelineError {
    fn from(e: InMemoryError) -> Self {
        match e {
            InMemoryError::Ledger(inner) => inner.into(),
            other => PipelineError::from_store(other),
        }
    }
}

#[derive(Debug, Clone)]
struct StagedShard {
    table: String,
    range: ShardRange,
    events: Vec<ChangeEvent>,
    at: Marker,
}

/// Guard for a lock held in an [`InMemoryStore`].
#[derive(Debug)]
pub struct MemoryLock {
    name: String,
    token: Uuid,
    held: Arc<Mutex<BTreeSet<String>>>,
}

impl MemoryLock {
    /// Lock name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Unique token of this acquisition.
    pub fn token(&self) -> Uuid {
        self.token
    }
}

impl Drop for MemoryLock {
    fn drop(&mut self) {
        self.held.lock().remove(&self.name);
        tracing::debug!(lock = %self.name, token = %self.token, "Released lock");
    }
}

/// In-memory ledger and run store.
///
/// Uses BTreeMap/BTreeSet for deterministic iteration order. Commits apply
/// to copies of the affected ledgers and swap them in only if every staged
/// event applied cleanly.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    tables: RwLock<BTreeMap<String, TemporalLedger>>,
    staged: Mutex<BTreeMap<RunId, Vec<StagedShard>>>,
    runs: RwLock<BTreeMap<RunId, RunMetadata>>,
    locks: Arc<Mutex<BTreeSet<String>>>,
}

impl InMemoryStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Names of tables with any history.
    pub fn table_names(&self) -> Vec<String> {
        self.tables.read().keys().cloned().collect()
    }

    /// Number of runs with staged, uncommitted work.
    pub fn pending_runs(&self) -> usize {
        self.staged.lock().len()
    }

    fn ensure_running(&self, run_id: RunId) -> Result<(), InMemoryError> {
        match self.runs.read().get(&run_id) {
            None => Err(InMemoryError::RunNotFound(run_id)),
            Some(run) if run.status != RunStatus::Running => Err(InMemoryError::RunNotRunning(run_id)),
            Some(_) => Ok(()),
        }
    }
}

#[async_trait]
impl LedgerStore for InMemoryStore {
    type Error = InMemoryError;

    async fn open_records(&self, table: &str, range: ShardRange) -> Result<Vec<Record>, Self::Error> {
        Ok(self
            .tables
            .read()
            .get(table)
            .map(|ledger| ledger.open_records(range))
            .unwrap_or_default())
    }

    async fn open_count(&self, table: &str) -> Result<u64, Self::Error> {
        Ok(self.tables.read().get(table).map_or(0, TemporalLedger::open_count))
    }

    async fn as_of(&self, table: &str, marker: Marker) -> Result<Vec<Record>, Self::Error> {
        Ok(self
            .tables
            .read()
            .get(table)
            .map(|ledger| ledger.as_of(marker))
            .unwrap_or_default())
    }

    async fn history(&self, table: &str, key: &RecordKey) -> Result<Vec<Interval>, Self::Error> {
        Ok(self
            .tables
            .read()
            .get(table)
            .map(|ledger| ledger.history(key).to_vec())
            .unwrap_or_default())
    }

    async fn change_log(
        &self,
        table: &str,
        range: ShardRange,
        after: Option<Marker>,
        up_to: Marker,
    ) -> Result<Vec<ChangeLogEntry>, Self::Error> {
        Ok(self
            .tables
            .read()
            .get(table)
            .map(|ledger| ledger.change_log(range, after, up_to))
            .unwrap_or_default())
    }

    async fn stage_shard(
        &self,
        run_id: RunId,
        table: &str,
        range: ShardRange,
        events: Vec<ChangeEvent>,
        at: Marker,
    ) -> Result<(), Self::Error> {
        self.ensure_running(run_id)?;
        if let Some(e) = events.iter().find(|e| !range.contains(e.shard_id)) {
            return Err(InMemoryError::ShardMismatch { key: e.key.clone(), shard_id: e.shard_id });
        }
        tracing::debug!(run_id = %run_id, table, shard = range.index, events = events.len(), "Staged shard");
        self.staged.lock().entry(run_id).or_default().push(StagedShard {
            table: table.to_string(),
            range,
            events,
            at,
        });
        Ok(())
    }

    async fn commit_run(&self, run_id: RunId) -> Result<ChangeCounts, Self::Error> {
        self.ensure_running(run_id)?;
        let mut staged = self.staged.lock().remove(&run_id).unwrap_or_default();
        staged.sort_by(|a, b| a.table.cmp(&b.table).then(a.range.cmp(&b.range)));

        let mut tables = self.tables.write();
        let mut updated: BTreeMap<String, TemporalLedger> = BTreeMap::new();
        let mut counts = ChangeCounts::default();

        for shard in &staged {
            let ledger = updated
                .entry(shard.table.clone())
                .or_insert_with(|| tables.get(&shard.table).cloned().unwrap_or_default());
            ledger.apply_all(&shard.events, shard.at)?;
            counts += ChangeCounts::of(&shard.events);
        }

        tables.extend(updated);
        tracing::info!(run_id = %run_id, adds = counts.adds, removes = counts.removes, updates = counts.updates, "Committed run");
        Ok(counts)
    }

    async fn abort_run(&self, run_id: RunId) -> Result<(), Self::Error> {
        let dropped = self.staged.lock().remove(&run_id).map_or(0, |s| s.len());
        tracing::warn!(run_id = %run_id, staged_shards = dropped, "Aborted run");
        Ok(())
    }
}

#[async_trait]
impl RunStore for InMemoryStore {
    type Lock = MemoryLock;

    async fn try_lock(&self, name: &str) -> Result<Option<Self::Lock>, Self::Error> {
        let mut held = self.locks.lock();
        if !held.insert(name.to_string()) {
            return Ok(None);
        }
        Ok(Some(MemoryLock {
            name: name.to_string(),
            token: Uuid::new_v4(),
            held: Arc::clone(&self.locks),
        }))
    }

    async fn create_run(
        &self,
        command: &str,
        fingerprint: Option<ConfigFingerprint>,
        extra: serde_json::Value,
    ) -> Result<RunMetadata, Self::Error> {
        let mut runs = self.runs.write();
        let run_id = RunId::new(runs.keys().next_back().map_or(1, |last| last.value() + 1));
        let mut run = RunMetadata {
            run_id,
            command: command.to_string(),
            start_time: Utc::now(),
            end_time: None,
            status: RunStatus::Running,
            config_fingerprint: fingerprint,
            extra: serde_json::Map::new(),
        };
        run.merge_extra(extra);
        runs.insert(run_id, run.clone());
        Ok(run)
    }

    async fn add_run_metadata(&self, run_id: RunId, extra: serde_json::Value) -> Result<(), Self::Error> {
        let mut runs = self.runs.write();
        let run = runs.get_mut(&run_id).ok_or(InMemoryError::RunNotFound(run_id))?;
        run.merge_extra(extra);
        Ok(())
    }

    async fn finish_run(
        &self,
        run_id: RunId,
        status: RunStatus,
        error: Option<String>,
    ) -> Result<(), Self::Error> {
        let mut runs = self.runs.write();
        let run = runs.get_mut(&run_id).ok_or(InMemoryError::RunNotFound(run_id))?;
        run.status = status;
        run.end_time = Some(Utc::now());
        if let Some(error) = error {
            run.extra.insert("error".to_string(), serde_json::Value::String(error));
        }
        Ok(())
    }

    async fn runs(&self, command: Option<&str>, successful_only: bool) -> Result<Vec<RunMetadata>, Self::Error> {
        Ok(self
            .runs
            .read()
            .values()
            .rev()
            .filter(|r| command.map_or(true, |c| r.command == c))
            .filter(|r| !successful_only || r.success())
            .cloned()
            .collect())
    }

    async fn run(&self, run_id: RunId) -> Result<Option<RunMetadata>, Self::Error> {
        Ok(self.runs.read().get(&run_id).cloned())
    }
}
