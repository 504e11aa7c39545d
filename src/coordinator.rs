//! Run lifecycle: pipeline lock, base-run selection, configuration
//! continuity and run metadata.
//!
//! ```text
//! try_lock ──▶ resolve base run ──▶ compare fingerprints ──▶ create_run
//!    │               │                      │
//!    ▼               ▼                      ▼
//! LockContention  InvalidBaseRun     ConfigContinuity
//! ```
//!
//! Nothing is written before all three gates passed. The lock guard lives
//! inside [`ActiveRun`], so every exit path releases it.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::canonical::canonical_sha256;
use crate::error::PipelineError;
use crate::store::{RunStore, StoreResultExt};
use crate::types::{Marker, RunId, RunMetadata, RunStatus};
use crate::validation::CheckMode;

/// Name of the configuration continuity gate in overrides.
pub const CONFIG_CONTINUITY: &str = "config_continuity";

/// Caller-requested relaxations of the safety checks.
///
/// Recorded in run metadata so every override is auditable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyOverrides {
    /// Checks that do not run at all.
    pub disabled_checks: BTreeSet<String>,
    /// Checks that run and report but never block.
    pub advisory_checks: BTreeSet<String>,
    /// Proceed even if the configuration differs from the base run.
    pub skip_config_continuity: bool,
}

impl SafetyOverrides {
    /// No overrides.
    pub fn new() -> Self {
        Self::default()
    }

    /// Disable a check.
    pub fn disable(mut self, check: impl Into<String>) -> Self {
        self.disabled_checks.insert(check.into());
        self
    }

    /// Downgrade a check to advisory.
    pub fn advisory(mut self, check: impl Into<String>) -> Self {
        self.advisory_checks.insert(check.into());
        self
    }

    /// Skip the configuration continuity gate.
    pub fn skip_config_continuity(mut self) -> Self {
        self.skip_config_continuity = true;
        self
    }

    /// Whether anything is overridden.
    pub fn is_empty(&self) -> bool {
        self.disabled_checks.is_empty() && self.advisory_checks.is_empty() && !self.skip_config_continuity
    }

    /// Per-check modes for [`ValidationSuite::with_modes`](crate::validation::ValidationSuite::with_modes).
    /// Disabling wins over advisory.
    pub fn check_modes(&self) -> BTreeMap<String, CheckMode> {
        let mut modes: BTreeMap<String, CheckMode> = self
            .advisory_checks
            .iter()
            .map(|c| (c.clone(), CheckMode::Advisory))
            .collect();
        for check in &self.disabled_checks {
            modes.insert(check.clone(), CheckMode::Disabled);
        }
        modes
    }
}

/// Digest of the configuration a run was produced with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigFingerprint {
    /// Digest of the active rule definitions.
    pub rules: String,
    /// Digest of the external party roster.
    pub parties: String,
    /// Digest of the global tunables.
    pub tunables: String,
}

impl ConfigFingerprint {
    /// Fingerprint three serializable configuration components.
    ///
    /// Callers must pass ordered collections so equal configurations hash equally.
    pub fn compute<R, P, T>(rules: &R, parties: &P, tunables: &T) -> Result<Self, PipelineError>
    where
        R: Serialize + ?Sized,
        P: Serialize + ?Sized,
        T: Serialize + ?Sized,
    {
        let digest = |v: Result<String, serde_json::Error>| {
            v.map_err(|e| PipelineError::Config(format!("cannot fingerprint configuration: {e}")))
        };
        Ok(Self {
            rules: digest(canonical_sha256(rules))?,
            parties: digest(canonical_sha256(parties))?,
            tunables: digest(canonical_sha256(tunables))?,
        })
    }

    /// Names of the components that differ.
    pub fn diff(&self, other: &Self) -> Vec<String> {
        [
            ("rules", &self.rules, &other.rules),
            ("parties", &self.parties, &other.parties),
            ("tunables", &self.tunables, &other.tunables),
        ]
        .into_iter()
        .filter(|(_, a, b)| a != b)
        .map(|(name, _, _)| name.to_string())
        .collect()
    }
}

/// Which run to compute deltas against.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BaseRunSelection {
    /// Most recent successful run of the same command, if any.
    #[default]
    Latest,
    /// A specific run. Must exist, match the command and have succeeded.
    Explicit(RunId),
    /// No base run.
    None,
}

/// Parameters for starting a run.
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// Command recorded on the run.
    pub command: String,
    /// Pipeline lock to hold for the whole run.
    pub lock: String,
    /// Configuration in effect, if the pipeline tracks continuity.
    pub fingerprint: Option<ConfigFingerprint>,
    /// Base run selection.
    pub base: BaseRunSelection,
    /// Safety overrides.
    pub overrides: SafetyOverrides,
    /// Additional metadata recorded at run start.
    pub extra: serde_json::Value,
}

impl RunRequest {
    /// Request with no base run, no fingerprint and no overrides.
    pub fn new(command: impl Into<String>, lock: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            lock: lock.into(),
            fingerprint: None,
            base: BaseRunSelection::None,
            overrides: SafetyOverrides::default(),
            extra: json!({}),
        }
    }

    /// Set the fingerprint.
    pub fn with_fingerprint(mut self, fingerprint: ConfigFingerprint) -> Self {
        self.fingerprint = Some(fingerprint);
        self
    }

    /// Set the base run selection.
    pub fn with_base(mut self, base: BaseRunSelection) -> Self {
        self.base = base;
        self
    }

    /// Set the overrides.
    pub fn with_overrides(mut self, overrides: SafetyOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    /// Set extra start metadata.
    pub fn with_extra(mut self, extra: serde_json::Value) -> Self {
        self.extra = extra;
        self
    }
}

/// A started run. Holds the pipeline lock until dropped.
#[derive(Debug)]
pub struct ActiveRun<L> {
    /// The run as created.
    pub run: RunMetadata,
    /// Resolved base run.
    pub base: Option<RunMetadata>,
    /// Overrides in effect.
    pub overrides: SafetyOverrides,
    _lock: L,
}

impl<L> ActiveRun<L> {
    /// Run id.
    pub fn run_id(&self) -> RunId {
        self.run.run_id
    }

    /// Base run id, if any.
    pub fn base_run_id(&self) -> Option<RunId> {
        self.base.as_ref().map(|b| b.run_id)
    }

    /// Marker of the base run, for run-id keyed ledgers.
    pub fn base_marker(&self) -> Option<Marker> {
        self.base_run_id().map(Marker::from_run)
    }
}

/// Starts and finishes runs against a [`RunStore`].
pub struct RunCoordinator<S: RunStore> {
    store: Arc<S>,
}

impl<S: RunStore> Clone for RunCoordinator<S> {
    fn clone(&self) -> Self {
        Self { store: Arc::clone(&self.store) }
    }
}

impl<S: RunStore> RunCoordinator<S> {
    /// Create a coordinator.
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Take the lock, pass the gates and issue a run id.
    pub async fn begin(&self, request: RunRequest) -> Result<ActiveRun<S::Lock>, PipelineError> {
        let lock = self
            .store
            .try_lock(&request.lock)
            .await
            .into_pipeline()?
            .ok_or_else(|| PipelineError::LockContention { lock: request.lock.clone() })?;
        tracing::info!(lock = %request.lock, command = %request.command, "Acquired pipeline lock");

        let base = self.resolve_base(&request.command, request.base).await?;
        if let Some(base) = &base {
            self.check_continuity(base, request.fingerprint.as_ref(), &request.overrides)?;
        }

        let mut extra = json!({
            "overrides": request.overrides,
            "base_run_id": base.as_ref().map(|b| b.run_id),
        });
        if let (Some(target), serde_json::Value::Object(more)) = (extra.as_object_mut(), request.extra) {
            target.extend(more);
        }
        let run = self
            .store
            .create_run(&request.command, request.fingerprint, extra)
            .await
            .into_pipeline()?;

        tracing::info!(
            run_id = %run.run_id,
            command = %run.command,
            base_run_id = ?base.as_ref().map(|b| b.run_id),
            overrides = !request.overrides.is_empty(),
            "Started run"
        );
        Ok(ActiveRun { run, base, overrides: request.overrides, _lock: lock })
    }

    async fn resolve_base(
        &self,
        command: &str,
        selection: BaseRunSelection,
    ) -> Result<Option<RunMetadata>, PipelineError> {
        match selection {
            BaseRunSelection::None => Ok(None),
            BaseRunSelection::Latest => {
                let runs = self.store.runs(Some(command), true).await.into_pipeline()?;
                Ok(runs.into_iter().next())
            }
            BaseRunSelection::Explicit(run_id) => {
                let invalid = |reason: &str| PipelineError::InvalidBaseRun { run_id, reason: reason.to_string() };
                let run = self
                    .store
                    .run(run_id)
                    .await
                    .into_pipeline()?
                    .ok_or_else(|| invalid("run does not exist"))?;
                if run.command != command {
                    return Err(invalid(&format!("run was produced by '{}', not '{}'", run.command, command)));
                }
                if !run.success() {
                    return Err(invalid(&format!("run status is {}", run.status.as_str())));
                }
                Ok(Some(run))
            }
        }
    }

    fn check_continuity(
        &self,
        base: &RunMetadata,
        current: Option<&ConfigFingerprint>,
        overrides: &SafetyOverrides,
    ) -> Result<(), PipelineError> {
        let Some(current) = current else {
            return Ok(());
        };
        let differing = match &base.config_fingerprint {
            Some(previous) => previous.diff(current),
            None => vec!["rules".to_string(), "parties".to_string(), "tunables".to_string()],
        };
        if differing.is_empty() {
            return Ok(());
        }
        if overrides.skip_config_continuity || overrides.disabled_checks.contains(CONFIG_CONTINUITY) {
            tracing::warn!(base_run_id = %base.run_id, differing = ?differing, "Configuration differs from base run, continuing due to override");
            return Ok(());
        }
        Err(PipelineError::ConfigContinuity { base_run: base.run_id, differing })
    }

    /// Record extra metadata on an active run.
    pub async fn annotate<L>(&self, active: &ActiveRun<L>, extra: serde_json::Value) -> Result<(), PipelineError> {
        self.store.add_run_metadata(active.run_id(), extra).await.into_pipeline()
    }

    /// Mark a run successful and release its lock.
    pub async fn succeed<L>(&self, active: ActiveRun<L>) -> Result<RunMetadata, PipelineError> {
        let run_id = active.run_id();
        self.store
            .finish_run(run_id, RunStatus::Success, None)
            .await
            .into_pipeline()?;
        tracing::info!(run_id = %run_id, "Run succeeded");
        drop(active);
        self.store
            .run(run_id)
            .await
            .into_pipeline()?
            .ok_or_else(|| PipelineError::Store(format!("run {run_id} vanished")))
    }

    /// Drop staged work, mark the run failed and release its lock.
    ///
    /// Cleanup failures are logged and a failed abort is recorded under
    /// `abort_error`; the original error is what callers report.
    pub async fn fail<L>(&self, active: ActiveRun<L>, error: &PipelineError) {
        let run_id = active.run_id();
        tracing::error!(run_id = %run_id, code = error.code(), error = %error, "Run failed");
        if let Err(e) = self.store.abort_run(run_id).await {
            tracing::error!(run_id = %run_id, error = %e, "Failed to abort staged work");
            if let Err(e) = self.store.add_run_metadata(run_id, json!({ "abort_error": e.to_string() })).await {
                tracing::error!(run_id = %run_id, error = %e, "Failed to record abort failure");
            }
        }
        if let Some(report) = error.report() {
            if let Ok(report) = serde_json::to_value(report) {
                if let Err(e) = self.store.add_run_metadata(run_id, json!({ "validation": report })).await {
                    tracing::error!(run_id = %run_id, error = %e, "Failed to record validation report");
                }
            }
        }
        if let Err(e) = self
            .store
            .finish_run(run_id, RunStatus::Error, Some(error.to_string()))
            .await
        {
            tracing::error!(run_id = %run_id, error = %e, "Failed to record run failure");
        }
        drop(active);
    }
}

/// Numeric key for database advisory locks.
///
/// Stable across processes and releases: `h = 7; h = h * 31 + byte` over
/// the UTF-8 bytes, reduced mod `2^63 - 1`.
pub fn lock_key(name: &str) -> i64 {
    const MODULUS: u128 = i64::MAX as u128;
    let mut h: u128 = 7;
    for b in name.bytes() {
        h = (h * 31 + u128::from(b)) % MODULUS;
    }
    h as i64
}
