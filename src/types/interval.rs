//! Validity markers, intervals and change log entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::change::ChangeType;
use super::record::{Payload, Record, RecordKey};
use super::run::RunId;

/// Position on a ledger's timeline.
///
/// List-generation ledgers use run ids, import ledgers use timestamps in
/// microseconds since the epoch. Both are plain ordered integers here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Marker(i64);

impl Marker {
    /// Wrap a raw marker value.
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    /// Marker for a list-generation run.
    pub fn from_run(run_id: RunId) -> Self {
        Self(run_id.value())
    }

    /// Marker for an import run.
    pub fn from_timestamp(at: DateTime<Utc>) -> Self {
        Self(at.timestamp_micros())
    }

    /// Raw value.
    pub fn value(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for Marker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Validity period `[start, end)` of one payload for one key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interval {
    /// Entity key.
    pub key: RecordKey,
    /// Payload valid during the interval.
    pub payload: Payload,
    /// Inclusive start.
    pub start: Marker,
    /// Exclusive end, `None` while the interval is current.
    pub end: Option<Marker>,
}

impl Interval {
    /// Whether the interval is currently true.
    pub fn is_open(&self) -> bool {
        self.end.is_none()
    }

    /// Whether the interval covers `marker`.
    pub fn contains(&self, marker: Marker) -> bool {
        self.start <= marker && self.end.map_or(true, |end| marker < end)
    }

    /// The record this interval describes.
    pub fn to_record(&self) -> Record {
        Record::new(self.key.clone(), self.payload.clone())
    }
}

/// One applied change, as recorded alongside the intervals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeLogEntry {
    /// Entity key.
    pub key: RecordKey,
    /// Virtual shard of the key.
    pub shard_id: u32,
    /// Marker the change was applied at.
    pub marker: Marker,
    /// Kind of change.
    pub change_type: ChangeType,
    /// Reason attached by the producer, if any.
    pub reason: Option<String>,
    /// Payload after the change (before it, for removes).
    pub payload: Payload,
}
