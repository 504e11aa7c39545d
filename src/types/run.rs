//! Run identity and metadata.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::coordinator::ConfigFingerprint;

/// Monotonic run identifier issued by the run store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RunId(i64);

impl RunId {
    /// Wrap a raw run id.
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    /// Raw value.
    pub fn value(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Final state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Lock held, work in progress.
    Running,
    /// Committed.
    Success,
    /// Aborted; nothing was committed.
    Error,
}

impl RunStatus {
    /// Stable lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Success => "success",
            Self::Error => "error",
        }
    }

    /// Parse from the lowercase name.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "success" => Some(Self::Success),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// Audit row describing one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    /// Run id.
    pub run_id: RunId,
    /// Command that produced the run (e.g. `listgen`, `import_stolen_list`).
    pub command: String,
    /// When the run was issued.
    pub start_time: DateTime<Utc>,
    /// When the run finished.
    pub end_time: Option<DateTime<Utc>>,
    /// Current status.
    pub status: RunStatus,
    /// Configuration in effect for the run.
    pub config_fingerprint: Option<ConfigFingerprint>,
    /// Free-form metadata: stats, check verdicts, overrides, artifacts.
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl RunMetadata {
    /// Whether the run committed.
    pub fn success(&self) -> bool {
        self.status == RunStatus::Success
    }

    /// Shallow-merge a JSON object into `extra`. Non-object values are stored under `value`.
    pub fn merge_extra(&mut self, extra: serde_json::Value) {
        match extra {
            serde_json::Value::Object(map) => self.extra.extend(map),
            other => {
                self.extra.insert("value".to_string(), other);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_merge_extra_overwrites_keys() {
        let mut run = RunMetadata {
            run_id: RunId::new(1),
            command: "listgen".to_string(),
            start_time: Utc::now(),
            end_time: None,
            status: RunStatus::Running,
            config_fingerprint: None,
            extra: serde_json::Map::new(),
        };
        run.merge_extra(json!({"a": 1, "b": 2}));
        run.merge_extra(json!({"b": 3}));
        assert_eq!(run.extra["a"], json!(1));
        assert_eq!(run.extra["b"], json!(3));
    }

    #[test]
    fn test_status_names() {
        assert_eq!(RunStatus::from_str("success"), Some(RunStatus::Success));
        assert_eq!(RunStatus::Error.as_str(), "error");
        assert_eq!(RunStatus::from_str("done"), None);
    }
}
