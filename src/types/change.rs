//! Change events, batches and conflict reports.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::{Add, AddAssign};

use super::record::{Payload, Record, RecordKey};
use crate::shard::virtual_shard_of;

/// Classification of a single difference between snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    /// Key appears in the new snapshot only.
    Add,
    /// Key appears in the old snapshot only.
    Remove,
    /// Key appears in both with a different payload.
    Update,
}

impl ChangeType {
    /// Stable lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Remove => "remove",
            Self::Update => "update",
        }
    }

    /// Parse from the lowercase name.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "add" => Some(Self::Add),
            "remove" => Some(Self::Remove),
            "update" => Some(Self::Update),
            _ => None,
        }
    }
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One classified change, ready to be applied to the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Entity key.
    pub key: RecordKey,
    /// Virtual shard of the key.
    pub shard_id: u32,
    /// Kind of change.
    pub change_type: ChangeType,
    /// New payload for adds and updates, last known payload for removes.
    pub payload: Payload,
    /// Human-facing reason recorded in the change log.
    pub reason: Option<String>,
}

impl ChangeEvent {
    /// Create an event, deriving the shard from the key.
    pub fn new(key: RecordKey, change_type: ChangeType, payload: Payload) -> Self {
        Self {
            shard_id: virtual_shard_of(&key),
            key,
            change_type,
            payload,
            reason: None,
        }
    }

    /// Add event for a record.
    pub fn add(record: Record) -> Self {
        Self::new(record.key, ChangeType::Add, record.payload)
    }

    /// Remove event for a record.
    pub fn remove(record: Record) -> Self {
        Self::new(record.key, ChangeType::Remove, record.payload)
    }

    /// Update event for a record.
    pub fn update(record: Record) -> Self {
        Self::new(record.key, ChangeType::Update, record.payload)
    }

    /// Attach a change reason.
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// Per-category change counters, summed across shards at fan-in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeCounts {
    /// Number of adds.
    pub adds: u64,
    /// Number of removes.
    pub removes: u64,
    /// Number of updates.
    pub updates: u64,
}

impl ChangeCounts {
    /// Count the events in a slice.
    pub fn of(events: &[ChangeEvent]) -> Self {
        let mut counts = Self::default();
        for event in events {
            counts.record(event.change_type);
        }
        counts
    }

    /// Increment the counter for one change type.
    pub fn record(&mut self, change_type: ChangeType) {
        match change_type {
            ChangeType::Add => self.adds += 1,
            ChangeType::Remove => self.removes += 1,
            ChangeType::Update => self.updates += 1,
        }
    }

    /// Counter for one change type.
    pub fn get(&self, change_type: ChangeType) -> u64 {
        match change_type {
            ChangeType::Add => self.adds,
            ChangeType::Remove => self.removes,
            ChangeType::Update => self.updates,
        }
    }

    /// Total events.
    pub fn total(&self) -> u64 {
        self.adds + self.removes + self.updates
    }

    /// Per-type difference, floored at zero.
    pub fn saturating_sub(&self, other: &Self) -> Self {
        Self {
            adds: self.adds.saturating_sub(other.adds),
            removes: self.removes.saturating_sub(other.removes),
            updates: self.updates.saturating_sub(other.updates),
        }
    }
}

impl Add for ChangeCounts {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            adds: self.adds + rhs.adds,
            removes: self.removes + rhs.removes,
            updates: self.updates + rhs.updates,
        }
    }
}

impl AddAssign for ChangeCounts {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl std::iter::Sum for ChangeCounts {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::default(), Add::add)
    }
}

/// All events of one run, partitioned by physical shard index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeltaBatch {
    shards: BTreeMap<u32, Vec<ChangeEvent>>,
}

impl DeltaBatch {
    /// Create an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the events of one physical shard.
    pub fn insert_shard(&mut self, shard: u32, events: Vec<ChangeEvent>) {
        self.shards.insert(shard, events);
    }

    /// Events of one physical shard.
    pub fn shard(&self, shard: u32) -> &[ChangeEvent] {
        self.shards.get(&shard).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Iterate shards in index order.
    pub fn shards(&self) -> impl Iterator<Item = (u32, &[ChangeEvent])> {
        self.shards.iter().map(|(k, v)| (*k, v.as_slice()))
    }

    /// Consume into per-shard event lists.
    pub fn into_shards(self) -> BTreeMap<u32, Vec<ChangeEvent>> {
        self.shards
    }

    /// Counts across every shard.
    pub fn counts(&self) -> ChangeCounts {
        self.shards.values().map(|events| ChangeCounts::of(events)).sum()
    }

    /// Check if the batch has no events.
    pub fn is_empty(&self) -> bool {
        self.shards.values().all(Vec::is_empty)
    }
}

/// A key that carried more than one distinct payload within one snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictReport {
    /// Conflicting key.
    pub key: RecordKey,
    /// Number of distinct payloads seen for the key.
    pub distinct_payload_count: usize,
}

impl ConflictReport {
    /// Rows that conflict with the first observed payload.
    pub fn conflicting_rows(&self) -> usize {
        self.distinct_payload_count.saturating_sub(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(key: &str, change_type: ChangeType) -> ChangeEvent {
        ChangeEvent::new(RecordKey::single(key), change_type, Payload::new())
    }

    #[test]
    fn test_counts_sum_across_shards() {
        let mut batch = DeltaBatch::new();
        batch.insert_shard(0, vec![event("a", ChangeType::Add), event("b", ChangeType::Remove)]);
        batch.insert_shard(1, vec![event("c", ChangeType::Add), event("d", ChangeType::Update)]);

        let counts = batch.counts();
        assert_eq!(counts.adds, 2);
        assert_eq!(counts.removes, 1);
        assert_eq!(counts.updates, 1);
        assert_eq!(counts.total(), 4);
    }

    #[test]
    fn test_event_shard_follows_key() {
        let a = event("35000000000001", ChangeType::Add);
        let b = event("35000000000001", ChangeType::Remove);
        assert_eq!(a.shard_id, b.shard_id);
    }

    #[test]
    fn test_change_type_round_trips_name() {
        for ct in [ChangeType::Add, ChangeType::Remove, ChangeType::Update] {
            assert_eq!(ChangeType::from_str(ct.as_str()), Some(ct));
        }
        assert_eq!(ChangeType::from_str("delete"), None);
    }

    #[test]
    fn test_conflicting_rows() {
        let report = ConflictReport { key: RecordKey::single("x"), distinct_payload_count: 3 };
        assert_eq!(report.conflicting_rows(), 2);
    }
}
