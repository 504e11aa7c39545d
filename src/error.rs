//! Pipeline error taxonomy.

use crate::ledger::LedgerError;
use crate::query::IdentifierError;
use crate::reducer::ReducerError;
use crate::types::RunId;
use crate::validation::ValidationReport;

/// Errors surfaced by the import and list-generation pipelines.
///
/// None of these are retried: a half-applied delta is not safe to replay blindly.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// One or more enforced checks failed.
    #[error("Validation failed: {}", .0.summary())]
    ValidationFailure(ValidationReport),

    /// Tagged delta references keys that should or should not exist.
    #[error("Referential integrity check failed: {}", .0.summary())]
    ReferentialIntegrity(ValidationReport),

    /// Same key carried contradictory changes or payloads within one batch.
    #[error("Conflicting changes in batch ({conflict_count} conflicting keys): {}", .report.summary())]
    Conflict {
        /// Number of conflicting keys.
        conflict_count: usize,
        /// Full validation report.
        report: ValidationReport,
    },

    /// Base run was produced with a different configuration.
    #[error("Configuration differs from base run {base_run}: {}", .differing.join(", "))]
    ConfigContinuity {
        /// Base run compared against.
        base_run: RunId,
        /// Fingerprint components that differ.
        differing: Vec<String>,
    },

    /// Another pipeline holds the lock.
    #[error("Pipeline busy: lock '{lock}' is held by another run")]
    LockContention {
        /// Lock name.
        lock: String,
    },

    /// The ledger or its change log describes an impossible sequence.
    #[error("Ledger corruption: {0}")]
    LedgerCorruption(String),

    /// Requested base run cannot be used.
    #[error("Invalid base run {run_id}: {reason}")]
    InvalidBaseRun {
        /// Requested run.
        run_id: RunId,
        /// Why it was rejected.
        reason: String,
    },

    /// Input record does not fit the table schema.
    #[error("Schema violation: {0}")]
    Schema(String),

    /// Identifier rejected by the allow-list.
    #[error("Identifier rejected: {0}")]
    InvalidIdentifier(#[from] IdentifierError),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Backing store failure.
    #[error("Store error: {0}")]
    Store(String),

    /// A worker task panicked or was cancelled.
    #[error("Task failed: {0}")]
    TaskFailed(String),
}

impl PipelineError {
    /// Create from any store error.
    pub fn from_store<E: std::error::Error>(e: E) -> Self {
        Self::Store(e.to_string())
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ValidationFailure(_) => "VALIDATION_FAILURE",
            Self::ReferentialIntegrity(_) => "REFERENTIAL_INTEGRITY",
            Self::Conflict { .. } => "CONFLICT",
            Self::ConfigContinuity { .. } => "CONFIG_CONTINUITY",
            Self::LockContention { .. } => "LOCK_CONTENTION",
            Self::LedgerCorruption(_) => "LEDGER_CORRUPTION",
            Self::InvalidBaseRun { .. } => "INVALID_BASE_RUN",
            Self::Schema(_) => "SCHEMA",
            Self::InvalidIdentifier(_) => "INVALID_IDENTIFIER",
            Self::Config(_) => "CONFIG",
            Self::Store(_) => "STORE",
            Self::TaskFailed(_) => "TASK_FAILED",
        }
    }

    /// Validation report carried by the error, if any.
    pub fn report(&self) -> Option<&ValidationReport> {
        match self {
            Self::ValidationFailure(r) | Self::ReferentialIntegrity(r) => Some(r),
            Self::Conflict { report, .. } => Some(report),
            _ => None,
        }
    }
}

impl From<LedgerError> for PipelineError {
    fn from(e: LedgerError) -> Self {
        Self::LedgerCorruption(e.to_string())
    }
}

impl From<ReducerError> for PipelineError {
    fn from(e: ReducerError) -> Self {
        Self::LedgerCorruption(e.to_string())
    }
}

impl From<tokio::task::JoinError> for PipelineError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::TaskFailed(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RecordKey;

    #[test]
    fn test_ledger_errors_are_corruption() {
        let err: PipelineError = LedgerError::NotOpen { key: RecordKey::single("1") }.into();
        assert_eq!(err.code(), "LEDGER_CORRUPTION");
        assert!(err.to_string().contains("no open interval"));
    }

    #[test]
    fn test_config_continuity_lists_components() {
        let err = PipelineError::ConfigContinuity {
            base_run: RunId::new(7),
            differing: vec!["rules".to_string(), "parties".to_string()],
        };
        assert_eq!(err.to_string(), "Configuration differs from base run 7: rules, parties");
    }
}
