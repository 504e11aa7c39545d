//! List generation: blacklist plus per-party notification and exception lists.
//!
//! Every list is a ledger table keyed by run id. A run diffs the current
//! compliance state against the open records of each list, commits the
//! changes with their delta reasons, then renders:
//!
//! - the full list as of the run
//! - one delta file per reason, reduced over the change log since the base run
//!
//! ```text
//! ComplianceState ─▶ diff + reasons ─▶ ledger ─▶ change log (base, run] ─▶ reduce ─▶ delta files
//!                                         └──────▶ open records ─────────────────▶ full files
//! ```

pub mod artifacts;
pub mod generator;
pub mod inputs;

pub use artifacts::{render_csv, Artifact, ArtifactDescriptor, ListKind};
pub use generator::{ListgenOutcome, ListgenPipeline, ListgenRequest, LISTGEN_COMMAND};
pub use inputs::{
    BlacklistEntry, BlockingRule, ComplianceState, ExceptionEntry, NotificationEntry, Pairing, Party,
    DATE_FORMAT,
};
