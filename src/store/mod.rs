//! Ledger and run-metadata storage backends.
//!
//! Writes go through a two-step protocol: every shard task stages its
//! events under the run id, then [`LedgerStore::commit_run`] publishes all
//! of a run's staged events together or [`LedgerStore::abort_run`] drops
//! them. Staged events are never visible to readers.

pub mod memory;

#[cfg(feature = "postgres")]
pub mod postgres;

use async_trait::async_trait;

use crate::coordinator::ConfigFingerprint;
use crate::error::PipelineError;
use crate::shard::ShardRange;
use crate::types::{
    ChangeCounts, ChangeEvent, ChangeLogEntry, Interval, Marker, Record, RecordKey, RunId,
    RunMetadata, RunStatus,
};

/// Trait for interval ledger backends.
///
/// Implementations must return records in key order and change log
/// entries in application order.
#[async_trait]
pub trait LedgerStore: Send + Sync + 'static {
    /// Error type for store operations.
    type Error: std::error::Error + Send + Sync + Into<PipelineError> + 'static;

    /// Currently open records of a table within a shard range.
    async fn open_records(&self, table: &str, range: ShardRange) -> Result<Vec<Record>, Self::Error>;

    /// Number of open records of a table.
    async fn open_count(&self, table: &str) -> Result<u64, Self::Error>;

    /// Records of a table that were true at `marker`.
    async fn as_of(&self, table: &str, marker: Marker) -> Result<Vec<Record>, Self::Error>;

    /// Interval history of one key, oldest first.
    async fn history(&self, table: &str, key: &RecordKey) -> Result<Vec<Interval>, Self::Error>;

    /// Change log entries with `after < marker <= up_to` within a shard range.
    async fn change_log(
        &self,
        table: &str,
        range: ShardRange,
        after: Option<Marker>,
        up_to: Marker,
    ) -> Result<Vec<ChangeLogEntry>, Self::Error>;

    /// Stage one shard's events for a run. Events apply in the given order.
    async fn stage_shard(
        &self,
        run_id: RunId,
        table: &str,
        range: ShardRange,
        events: Vec<ChangeEvent>,
        at: Marker,
    ) -> Result<(), Self::Error>;

    /// Publish everything a run staged. Returns the applied counts.
    async fn commit_run(&self, run_id: RunId) -> Result<ChangeCounts, Self::Error>;

    /// Drop everything a run staged.
    async fn abort_run(&self, run_id: RunId) -> Result<(), Self::Error>;

    /// Check if the backend is reachable.
    async fn is_healthy(&self) -> bool {
        true
    }
}

/// Trait for run-metadata backends, including the pipeline lock.
#[async_trait]
pub trait RunStore: LedgerStore {
    /// Guard holding a named lock. Dropping it releases the lock.
    type Lock: Send + Sync + 'static;

    /// Try to take a named lock without waiting.
    async fn try_lock(&self, name: &str) -> Result<Option<Self::Lock>, Self::Error>;

    /// Issue a new run id and record the run as running.
    async fn create_run(
        &self,
        command: &str,
        fingerprint: Option<ConfigFingerprint>,
        extra: serde_json::Value,
    ) -> Result<RunMetadata, Self::Error>;

    /// Merge a JSON object into a run's extra metadata.
    async fn add_run_metadata(&self, run_id: RunId, extra: serde_json::Value) -> Result<(), Self::Error>;

    /// Record the final status of a run.
    async fn finish_run(
        &self,
        run_id: RunId,
        status: RunStatus,
        error: Option<String>,
    ) -> Result<(), Self::Error>;

    /// Runs, most recent first, optionally filtered by command and success.
    async fn runs(&self, command: Option<&str>, successful_only: bool) -> Result<Vec<RunMetadata>, Self::Error>;

    /// One run by id.
    async fn run(&self, run_id: RunId) -> Result<Option<RunMetadata>, Self::Error>;
}

/// Lifts backend errors into [`PipelineError`] at the pipeline boundary.
pub trait StoreResultExt<T> {
    /// Convert the error side.
    fn into_pipeline(self) -> Result<T, PipelineError>;
}

impl<T, E: Into<PipelineError>> StoreResultExt<T> for Result<T, E> {
    fn into_pipeline(self) -> Result<T, PipelineError> {
        self.map_err(Into::into)
    }
}

pub use memory::{InMemoryError, InMemoryStore, MemoryLock};

#[cfg(feature = "postgres")]
pub use postgres::{PostgresConfig, PostgresError, PostgresStore};
