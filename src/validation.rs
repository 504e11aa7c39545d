//! Validation checks run over a staged batch before commit.
//!
//! Checks are independent and all run to completion, so one report shows
//! every violation. Each check can be enforced, downgraded to advisory or
//! disabled through [`SafetyOverrides`](crate::coordinator::SafetyOverrides),
//! except the payload conflict check, which always enforces.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::delta::{approximate_post_delta_size, PresenceFindings};
use crate::types::{ChangeCounts, ConflictReport, RecordKey};

/// How a check's verdict is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckMode {
    /// Failure aborts the run.
    Enforce,
    /// Failure is reported but does not abort.
    Advisory,
    /// Check is not run.
    Disabled,
}

/// Error class a failing check maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    /// Size or volume sanity.
    Size,
    /// Tagged change disagrees with ledger state.
    Referential,
    /// Contradictory rows within the batch.
    Conflict,
}

/// Verdict of one check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    /// Check name, as used by overrides.
    pub name: String,
    /// Error class.
    pub kind: CheckKind,
    /// Mode the check ran in.
    pub mode: CheckMode,
    /// Whether the check passed.
    pub pass: bool,
    /// Value observed in the batch.
    pub observed: f64,
    /// Value observed in the ledger.
    pub baseline: f64,
    /// Threshold the observed value was held against.
    pub threshold: f64,
    /// Metric key used for failure counters.
    pub metric_key: String,
    /// Bounded sample of offending keys.
    pub sample: Vec<String>,
}

impl CheckResult {
    /// Whether this result aborts the run.
    pub fn is_blocking(&self) -> bool {
        !self.pass && self.mode == CheckMode::Enforce
    }
}

impl fmt::Display for CheckResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} (observed {:.2}, baseline {:.2}, threshold {:.2})",
            if self.pass { "passed" } else { "failed" },
            self.name,
            self.observed,
            self.baseline,
            self.threshold
        )?;
        if !self.sample.is_empty() {
            write!(f, " sample: [{}]", self.sample.join(", "))?;
        }
        Ok(())
    }
}

/// Everything a check may look at.
#[derive(Debug, Clone, Default)]
pub struct ValidationContext {
    /// Open records in the ledger before the run.
    pub current_size: u64,
    /// Changes in the batch, as supplied or computed.
    pub staged: ChangeCounts,
    /// Payload conflicts found while collapsing.
    pub conflicts: Vec<ConflictReport>,
    /// Keys tagged with more than one change type (tagged mode only).
    pub multiple_changes: Vec<RecordKey>,
    /// Presence findings (tagged mode only).
    pub findings: Option<PresenceFindings>,
    /// Maximum number of keys kept per check result.
    pub sample_limit: usize,
}

impl ValidationContext {
    fn sample<'a>(&self, keys: impl IntoIterator<Item = &'a RecordKey>) -> Vec<String> {
        keys.into_iter().take(self.sample_limit).map(ToString::to_string).collect()
    }
}

/// A named check.
pub trait ValidationCheck: Send + Sync {
    /// Name used in reports and overrides.
    fn name(&self) -> &'static str;

    /// Error class on failure.
    fn kind(&self) -> CheckKind;

    /// Whether callers may disable or downgrade the check.
    fn overridable(&self) -> bool {
        true
    }

    /// Run the check. `None` means the check does not apply to this batch.
    fn run(&self, ctx: &ValidationContext) -> Option<CheckResult>;
}

fn result(
    check: &dyn ValidationCheck,
    pass: bool,
    observed: f64,
    baseline: f64,
    threshold: f64,
    metric_key: &str,
    sample: Vec<String>,
) -> CheckResult {
    CheckResult {
        name: check.name().to_string(),
        kind: check.kind(),
        mode: CheckMode::Enforce,
        pass,
        observed,
        baseline,
        threshold,
        metric_key: metric_key.to_string(),
        sample,
    }
}

/// Rejects batches that shrink the ledger too much.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HistoricSizeCheck {
    /// Minimum fraction of the current size the result must keep.
    pub percent: f64,
    /// Maximum absolute shrink, `-1` to disable the absolute bound.
    pub absolute: i64,
}

impl HistoricSizeCheck {
    /// Name of the check.
    pub const NAME: &'static str = "historic_size";

    /// Smallest acceptable post-delta size for a given current size.
    pub fn minimum_size(&self, current: u64) -> f64 {
        let by_absolute = if self.absolute == -1 {
            1.0
        } else {
            (current as f64 - self.absolute as f64).max(1.0)
        };
        by_absolute.max(self.percent * current as f64)
    }
}

impl Default for HistoricSizeCheck {
    fn default() -> Self {
        Self { percent: 0.95, absolute: 1000 }
    }
}

impl ValidationCheck for HistoricSizeCheck {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn kind(&self) -> CheckKind {
        CheckKind::Size
    }

    fn run(&self, ctx: &ValidationContext) -> Option<CheckResult> {
        let current = ctx.current_size;
        let staged = approximate_post_delta_size(current, &ctx.staged) as f64;
        if current == 0 {
            // Bootstrap: an empty ledger accepts anything.
            return Some(result(self, true, staged, 0.0, 0.0, "historic_import_size", Vec::new()));
        }
        let minimum = self.minimum_size(current);
        Some(result(
            self,
            staged >= minimum,
            staged,
            current as f64,
            minimum,
            "historic_import_size",
            Vec::new(),
        ))
    }
}

/// Fails when a key carries more than one distinct payload.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConflictingPayloadsCheck;

impl ConflictingPayloadsCheck {
    /// Name of the check.
    pub const NAME: &'static str = "conflicting_payloads";
}

impl ValidationCheck for ConflictingPayloadsCheck {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn kind(&self) -> CheckKind {
        CheckKind::Conflict
    }

    fn overridable(&self) -> bool {
        false
    }

    fn run(&self, ctx: &ValidationContext) -> Option<CheckResult> {
        let rows: usize = ctx.conflicts.iter().map(ConflictReport::conflicting_rows).sum();
        Some(result(
            self,
            ctx.conflicts.is_empty(),
            rows as f64,
            0.0,
            0.0,
            "conflicting_payloads",
            ctx.sample(ctx.conflicts.iter().map(|c| &c.key)),
        ))
    }
}

/// Fails when a key is tagged with more than one change type.
#[derive(Debug, Clone, Copy, Default)]
pub struct MultipleChangesCheck;

impl MultipleChangesCheck {
    /// Name of the check.
    pub const NAME: &'static str = "multiple_changes";
}

impl ValidationCheck for MultipleChangesCheck {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn kind(&self) -> CheckKind {
        CheckKind::Conflict
    }

    fn run(&self, ctx: &ValidationContext) -> Option<CheckResult> {
        ctx.findings.as_ref()?;
        Some(result(
            self,
            ctx.multiple_changes.is_empty(),
            ctx.multiple_changes.len() as f64,
            0.0,
            0.0,
            "delta_multiple_changes",
            ctx.sample(&ctx.multiple_changes),
        ))
    }
}

/// Fails when a tagged add targets a key already in the ledger.
#[derive(Debug, Clone, Copy, Default)]
pub struct AddsAbsentCheck;

impl AddsAbsentCheck {
    /// Name of the check.
    pub const NAME: &'static str = "adds_absent";
}

impl ValidationCheck for AddsAbsentCheck {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn kind(&self) -> CheckKind {
        CheckKind::Referential
    }

    fn run(&self, ctx: &ValidationContext) -> Option<CheckResult> {
        let offending = &ctx.findings.as_ref()?.adds_present;
        Some(result(
            self,
            offending.is_empty(),
            offending.len() as f64,
            ctx.current_size as f64,
            0.0,
            "delta_adds_not_in_ledger",
            ctx.sample(offending),
        ))
    }
}

/// Fails when a tagged remove targets a key not in the ledger.
#[derive(Debug, Clone, Copy, Default)]
pub struct RemovesPresentCheck;

impl RemovesPresentCheck {
    /// Name of the check.
    pub const NAME: &'static str = "removes_present";
}

impl ValidationCheck for RemovesPresentCheck {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn kind(&self) -> CheckKind {
        CheckKind::Referential
    }

    fn run(&self, ctx: &ValidationContext) -> Option<CheckResult> {
        let offending = &ctx.findings.as_ref()?.removes_absent;
        Some(result(
            self,
            offending.is_empty(),
            offending.len() as f64,
            ctx.current_size as f64,
            0.0,
            "delta_removes_in_ledger",
            ctx.sample(offending),
        ))
    }
}

/// Fails when a tagged update targets a key not in the ledger.
#[derive(Debug, Clone, Copy, Default)]
pub struct UpdatesPresentCheck;

impl UpdatesPresentCheck {
    /// Name of the check.
    pub const NAME: &'static str = "updates_present";
}

impl ValidationCheck for UpdatesPresentCheck {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn kind(&self) -> CheckKind {
        CheckKind::Referential
    }

    fn run(&self, ctx: &ValidationContext) -> Option<CheckResult> {
        let offending = &ctx.findings.as_ref()?.updates_absent;
        Some(result(
            self,
            offending.is_empty(),
            offending.len() as f64,
            ctx.current_size as f64,
            0.0,
            "delta_updates_in_ledger",
            ctx.sample(offending),
        ))
    }
}

/// Outcome of running a suite.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    /// Results of every check that ran.
    pub results: Vec<CheckResult>,
    /// Checks skipped because they were disabled.
    pub skipped: Vec<String>,
}

impl ValidationReport {
    /// Results that failed, whatever their mode.
    pub fn failures(&self) -> impl Iterator<Item = &CheckResult> {
        self.results.iter().filter(|r| !r.pass)
    }

    /// Whether any enforced check failed.
    pub fn is_blocking(&self) -> bool {
        self.results.iter().any(CheckResult::is_blocking)
    }

    /// Result of a named check.
    pub fn get(&self, name: &str) -> Option<&CheckResult> {
        self.results.iter().find(|r| r.name == name)
    }

    /// One-line description of every failure.
    pub fn summary(&self) -> String {
        let failures: Vec<String> = self.failures().map(ToString::to_string).collect();
        if failures.is_empty() {
            "all checks passed".to_string()
        } else {
            failures.join("; ")
        }
    }

    /// Turn blocking failures into the matching pipeline error.
    ///
    /// Conflicts take precedence over referential failures, which take
    /// precedence over plain validation failures.
    pub fn into_result(self) -> Result<Self, crate::error::PipelineError> {
        use crate::error::PipelineError;

        let blocking: Vec<&CheckResult> = self.results.iter().filter(|r| r.is_blocking()).collect();
        if blocking.is_empty() {
            return Ok(self);
        }
        if blocking.iter().any(|r| r.kind == CheckKind::Conflict) {
            let conflict_count = blocking
                .iter()
                .filter(|r| r.kind == CheckKind::Conflict)
                .map(|r| r.observed as usize)
                .sum();
            return Err(PipelineError::Conflict { conflict_count, report: self });
        }
        if blocking.iter().all(|r| r.kind == CheckKind::Referential) {
            return Err(PipelineError::ReferentialIntegrity(self));
        }
        Err(PipelineError::ValidationFailure(self))
    }
}

/// An ordered set of checks, each with its mode.
pub struct ValidationSuite {
    checks: Vec<(Box<dyn ValidationCheck>, CheckMode)>,
}

impl ValidationSuite {
    /// Create an empty suite.
    pub fn new() -> Self {
        Self { checks: Vec::new() }
    }

    /// Standard suite: conflicts, historic size and the tagged-delta checks.
    pub fn standard(size: HistoricSizeCheck) -> Self {
        Self::new()
            .with(ConflictingPayloadsCheck)
            .with(size)
            .with(MultipleChangesCheck)
            .with(AddsAbsentCheck)
            .with(RemovesPresentCheck)
            .with(UpdatesPresentCheck)
    }

    /// Add an enforced check.
    pub fn with(mut self, check: impl ValidationCheck + 'static) -> Self {
        self.checks.push((Box::new(check), CheckMode::Enforce));
        self
    }

    /// Apply per-check modes. Non-overridable checks keep enforcing.
    pub fn with_modes(mut self, modes: &BTreeMap<String, CheckMode>) -> Self {
        for (check, mode) in &mut self.checks {
            if let Some(m) = modes.get(check.name()) {
                if check.overridable() {
                    *mode = *m;
                } else {
                    tracing::warn!(check = check.name(), "Ignoring override for non-overridable check");
                }
            }
        }
        self
    }

    /// Names of the checks in the suite.
    pub fn names(&self) -> Vec<&'static str> {
        self.checks.iter().map(|(c, _)| c.name()).collect()
    }

    /// Run every check. No check short-circuits another.
    pub fn run(&self, ctx: &ValidationContext) -> ValidationReport {
        let mut report = ValidationReport::default();
        for (check, mode) in &self.checks {
            if *mode == CheckMode::Disabled {
                tracing::warn!(check = check.name(), "Skipped check due to override");
                report.skipped.push(check.name().to_string());
                continue;
            }
            if let Some(mut r) = check.run(ctx) {
                r.mode = *mode;
                if r.pass {
                    tracing::info!(check = %r.name, observed = r.observed, threshold = r.threshold, "Check passed");
                } else {
                    tracing::warn!(
                        check = %r.name,
                        mode = ?r.mode,
                        observed = r.observed,
                        baseline = r.baseline,
                        threshold = r.threshold,
                        sample = ?r.sample,
                        "Check failed"
                    );
                }
                report.results.push(r);
            }
        }
        report
    }
}

impl Default for ValidationSuite {
    fn default() -> Self {
        Self::standard(HistoricSizeCheck::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;

    fn snapshot_ctx(current: u64, adds: u64, removes: u64) -> ValidationContext {
        ValidationContext {
            current_size: current,
            staged: ChangeCounts { adds, removes, updates: 0 },
            sample_limit: 5,
            ..Default::default()
        }
    }

    #[test]
    fn test_size_check_bootstrap_always_passes() {
        let check = HistoricSizeCheck { percent: 1.0, absolute: 0 };
        let r = check.run(&snapshot_ctx(0, 0, 0)).unwrap();
        assert!(r.pass);
        assert_eq!(r.threshold, 0.0);
    }

    #[test]
    fn test_size_check_percent_bound() {
        let ok = HistoricSizeCheck { percent: 0.95, absolute: 1000 };
        assert!(ok.run(&snapshot_ctx(100, 0, 5)).unwrap().pass);

        let strict = HistoricSizeCheck { percent: 0.96, absolute: 1000 };
        let r = strict.run(&snapshot_ctx(100, 0, 5)).unwrap();
        assert!(!r.pass);
        assert_eq!(r.observed, 95.0);
        assert_eq!(r.baseline, 100.0);
        assert_eq!(r.threshold, 96.0);
        assert_eq!(r.metric_key, "historic_import_size");
    }

    #[test]
    fn test_size_check_absolute_bound() {
        let check = HistoricSizeCheck { percent: 0.0, absolute: 3 };
        assert!(!check.run(&snapshot_ctx(100, 0, 5)).unwrap().pass);
        assert!(check.run(&snapshot_ctx(100, 0, 3)).unwrap().pass);
    }

    #[test]
    fn test_size_check_absolute_sentinel_disables_bound() {
        let check = HistoricSizeCheck { percent: 0.0, absolute: -1 };
        assert!(check.run(&snapshot_ctx(100, 0, 99)).unwrap().pass);
        // Still never allows an empty result.
        assert!(!check.run(&snapshot_ctx(100, 0, 100)).unwrap().pass);
    }

    #[test]
    fn test_tagged_checks_skip_snapshot_batches() {
        let ctx = snapshot_ctx(10, 1, 0);
        assert!(AddsAbsentCheck.run(&ctx).is_none());
        assert!(MultipleChangesCheck.run(&ctx).is_none());
    }

    #[test]
    fn test_all_checks_run_without_short_circuit() {
        let ctx = ValidationContext {
            current_size: 100,
            staged: ChangeCounts { adds: 0, removes: 50, updates: 0 },
            findings: Some(PresenceFindings {
                removes_absent: vec![RecordKey::single("ghost")],
                ..Default::default()
            }),
            sample_limit: 5,
            ..Default::default()
        };
        let report = ValidationSuite::default().run(&ctx);
        assert_eq!(report.results.len(), 6);
        assert_eq!(report.failures().count(), 2);
        assert!(report.is_blocking());
        assert!(matches!(report.into_result(), Err(PipelineError::ValidationFailure(_))));
    }

    #[test]
    fn test_advisory_and_disabled_modes() {
        let ctx = ValidationContext {
            current_size: 10,
            findings: Some(PresenceFindings {
                adds_present: vec![RecordKey::single("dup")],
                updates_absent: vec![RecordKey::single("ghost")],
                ..Default::default()
            }),
            sample_limit: 5,
            ..Default::default()
        };
        let modes = BTreeMap::from([
            (AddsAbsentCheck::NAME.to_string(), CheckMode::Advisory),
            (UpdatesPresentCheck::NAME.to_string(), CheckMode::Disabled),
        ]);
        let report = ValidationSuite::default().with_modes(&modes).run(&ctx);
        assert_eq!(report.skipped, vec![UpdatesPresentCheck::NAME.to_string()]);
        assert!(!report.get(AddsAbsentCheck::NAME).unwrap().pass);
        assert!(!report.is_blocking());
        assert!(report.into_result().is_ok());
    }

    #[test]
    fn test_referential_failure_maps_to_integrity_error() {
        let ctx = ValidationContext {
            current_size: 10,
            findings: Some(PresenceFindings {
                adds_present: vec![RecordKey::single("dup")],
                ..Default::default()
            }),
            sample_limit: 5,
            ..Default::default()
        };
        let err = ValidationSuite::default().run(&ctx).into_result().unwrap_err();
        assert!(matches!(err, PipelineError::ReferentialIntegrity(_)));
        assert_eq!(err.report().unwrap().get(AddsAbsentCheck::NAME).unwrap().sample, vec!["dup"]);
    }

    #[test]
    fn test_conflict_check_cannot_be_disabled() {
        let ctx = ValidationContext {
            conflicts: vec![ConflictReport { key: RecordKey::single("k"), distinct_payload_count: 2 }],
            sample_limit: 5,
            ..Default::default()
        };
        let modes = BTreeMap::from([(ConflictingPayloadsCheck::NAME.to_string(), CheckMode::Disabled)]);
        let err = ValidationSuite::default().with_modes(&modes).run(&ctx).into_result().unwrap_err();
        match err {
            PipelineError::Conflict { conflict_count, .. } => assert_eq!(conflict_count, 1),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_sample_is_bounded() {
        let keys: Vec<RecordKey> = (0..20).map(|i| RecordKey::single(i.to_string())).collect();
        let ctx = ValidationContext {
            findings: Some(PresenceFindings { removes_absent: keys, ..Default::default() }),
            sample_limit: 3,
            ..Default::default()
        };
        let r = RemovesPresentCheck.run(&ctx).unwrap();
        assert_eq!(r.observed, 20.0);
        assert_eq!(r.sample.len(), 3);
    }
}
