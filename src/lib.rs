//! # delta-ledger
//!
//! Temporal delta engine for sharded, record-oriented datasets.
//!
//! The engine answers one question:
//!
//! > Given the state a table is in and the state it should be in, which
//! > changes get us there, and why did each one happen?
//!
//! ## Core Contract
//!
//! 1. Diff a full snapshot (or a tagged change set) against the open records
//!    of a table, shard by shard
//! 2. Validate the proposed changes before anything is written
//! 3. Commit all shards of a run together into an interval ledger, with a
//!    change log that records each change's reason
//! 4. Reduce the change log between two runs to the net change per key
//!
//! ## Architecture
//!
//! ```text
//! ImportRequest / ListgenRequest
//!          │
//!          ▼
//!   RunCoordinator ── lock, base run, config continuity, run row
//!          │
//!          ▼
//!   ShardPartitioner ─▶ ParallelExecutor ─▶ DeltaComputer (per shard)
//!                                               │
//!                                               ▼
//!                                       ValidationSuite
//!                                               │
//!                                               ▼
//!                    LedgerStore (Postgres or Memory): stage ─▶ commit
//!                                               │
//!                                               ▼
//!                         change log ─▶ ChangeReasonReducer ─▶ delta lists
//! ```
//!
//! ## Determinism Guarantees
//!
//! - Same snapshot + same ledger state → identical change set
//! - A key maps to the same virtual shard for every shard count
//! - Reducing a chain in one step equals reducing its halves and composing

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod types;
pub mod error;
pub mod config;
pub mod metrics;
pub mod canonical;
pub mod query;
pub mod shard;
pub mod delta;
pub mod ledger;
pub mod reducer;
pub mod validation;
pub mod executor;
pub mod store;
pub mod coordinator;
pub mod import;
pub mod listgen;

#[cfg(feature = "service")]
pub mod service;

// Re-exports
pub use types::{
    ChangeCounts, ChangeEvent, ChangeLogEntry, ChangeType, ConflictReport, DeltaBatch, Interval,
    Marker, Payload, Record, RecordKey, RunId, RunMetadata, RunStatus, TableSchema,
};
pub use error::PipelineError;
pub use config::{ListgenTunables, PipelineConfig};
pub use metrics::{MetricsSink, NoOpMetrics, TestMetrics, TracingMetrics};
pub use canonical::{canonical_sha256, sha256_hex, to_canonical_bytes};
pub use query::{Filter, Ident, IdentifierAllowList, IdentifierError, QueryBuilder};
pub use shard::{shard_name, virtual_shard_of, ShardPartitioner, ShardRange, VIRTUAL_SHARD_COUNT};
pub use delta::{
    approximate_post_delta_size, check_presence, collapse_snapshot, collapse_tagged, diff_snapshots,
    effective_events, CollapsedSnapshot, CollapsedTagged, PresenceFindings, TaggedRecord,
};
pub use ledger::{check_marker_order, LedgerError, TemporalLedger};
pub use reducer::{reduce, ChainSummary, Polarity, ReasonVocabulary, ReducerError};
pub use validation::{
    CheckKind, CheckMode, CheckResult, ValidationCheck, ValidationContext, ValidationReport,
    ValidationSuite,
};
pub use executor::{CategoryCounter, ParallelExecutor, Task};
pub use store::{InMemoryStore, LedgerStore, RunStore, StoreResultExt};
#[cfg(feature = "postgres")]
pub use store::{PostgresConfig, PostgresStore};
pub use coordinator::{
    ActiveRun, BaseRunSelection, ConfigFingerprint, RunCoordinator, RunRequest, SafetyOverrides,
};
pub use import::{ImportInput, ImportOutcome, ImportPipeline, ImportRequest, ImportStats};
pub use listgen::{
    Artifact, ArtifactDescriptor, ComplianceState, ListKind, ListgenOutcome, ListgenPipeline,
    ListgenRequest,
};

// Service re-exports (when service feature is enabled)
#[cfg(feature = "service")]
pub use service::{create_router, ServiceState};

/// Schema version of run metadata and artifact descriptors.
/// Increment on breaking changes to any persisted type.
pub const DELTA_LEDGER_SCHEMA_VERSION: &str = "1.0.0";
