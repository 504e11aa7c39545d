//! Delta computation.
//!
//! Two modes:
//!
//! - **Snapshot diff**: a full list replaces the current one and the
//!   add/remove/update sets are computed.
//! - **Tagged delta**: the caller supplies classified changes, which are
//!   collapsed and checked against the ledger instead of computed.
//!
//! Everything here works on one shard's worth of data at a time. Keys never
//! cross shards, so per-shard results can simply be concatenated.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use crate::types::{ChangeCounts, ChangeEvent, ChangeType, ConflictReport, Payload, Record, RecordKey};

/// One side of a diff with duplicates collapsed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollapsedSnapshot {
    /// First observed payload per key.
    pub rows: BTreeMap<RecordKey, Payload>,
    /// Keys seen with more than one distinct payload.
    pub conflicts: Vec<ConflictReport>,
    /// Rows dropped because their key was already seen.
    pub duplicate_rows: u64,
}

/// Collapse duplicate keys, first observed wins.
pub fn collapse_snapshot(rows: impl IntoIterator<Item = Record>) -> CollapsedSnapshot {
    let mut collapsed = CollapsedSnapshot::default();
    let mut distinct: BTreeMap<RecordKey, Vec<Payload>> = BTreeMap::new();

    for record in rows {
        match collapsed.rows.get(&record.key) {
            None => {
                collapsed.rows.insert(record.key, record.payload);
            }
            Some(first) => {
                collapsed.duplicate_rows += 1;
                if *first != record.payload {
                    let seen = distinct
                        .entry(record.key)
                        .or_insert_with(|| vec![first.clone()]);
                    if !seen.contains(&record.payload) {
                        seen.push(record.payload);
                    }
                }
            }
        }
    }

    collapsed.conflicts = distinct
        .into_iter()
        .map(|(key, payloads)| ConflictReport { key, distinct_payload_count: payloads.len() })
        .collect();
    collapsed
}

/// Compute the changes turning `old` into `new`, in key order.
pub fn diff_snapshots(
    old: &BTreeMap<RecordKey, Payload>,
    new: &BTreeMap<RecordKey, Payload>,
) -> Vec<ChangeEvent> {
    let mut events = Vec::new();
    let mut old_iter = old.iter().peekable();
    let mut new_iter = new.iter().peekable();

    loop {
        let order = match (old_iter.peek(), new_iter.peek()) {
            (None, None) => break,
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (Some((ok, _)), Some((nk, _))) => ok.cmp(nk),
        };
        match order {
            Ordering::Less => {
                if let Some((key, payload)) = old_iter.next() {
                    events.push(ChangeEvent::new(key.clone(), ChangeType::Remove, payload.clone()));
                }
            }
            Ordering::Greater => {
                if let Some((key, payload)) = new_iter.next() {
                    events.push(ChangeEvent::new(key.clone(), ChangeType::Add, payload.clone()));
                }
            }
            Ordering::Equal => {
                if let (Some((key, before)), Some((_, after))) = (old_iter.next(), new_iter.next()) {
                    if before != after {
                        events.push(ChangeEvent::new(key.clone(), ChangeType::Update, after.clone()));
                    }
                }
            }
        }
    }
    events
}

/// A caller-classified change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaggedRecord {
    /// The record.
    pub record: Record,
    /// Declared change type.
    pub change_type: ChangeType,
}

impl TaggedRecord {
    /// Create a tagged record.
    pub fn new(record: Record, change_type: ChangeType) -> Self {
        Self { record, change_type }
    }
}

/// Tagged rows collapsed to one event per (key, change type).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollapsedTagged {
    /// One event per (key, change type), first observed payload wins.
    pub events: Vec<ChangeEvent>,
    /// Keys tagged with more than one change type.
    pub multiple_changes: Vec<RecordKey>,
    /// (key, change type) pairs carrying more than one distinct payload.
    pub conflicts: Vec<ConflictReport>,
    /// Raw row counts by declared type.
    pub supplied: ChangeCounts,
    /// Rows dropped as exact or conflicting duplicates.
    pub duplicate_rows: u64,
}

/// Collapse a tagged batch.
pub fn collapse_tagged(rows: impl IntoIterator<Item = TaggedRecord>) -> CollapsedTagged {
    let mut supplied = ChangeCounts::default();
    let mut by_type: BTreeMap<ChangeType, Vec<Record>> = BTreeMap::new();
    for row in rows {
        supplied.record(row.change_type);
        by_type.entry(row.change_type).or_default().push(row.record);
    }

    let mut types_per_key: BTreeMap<RecordKey, BTreeSet<ChangeType>> = BTreeMap::new();
    let mut events = Vec::new();
    let mut conflicts = Vec::new();
    let mut duplicate_rows = 0;

    for (change_type, records) in by_type {
        let collapsed = collapse_snapshot(records);
        duplicate_rows += collapsed.duplicate_rows;
        conflicts.extend(collapsed.conflicts);
        for (key, payload) in collapsed.rows {
            types_per_key.entry(key.clone()).or_default().insert(change_type);
            events.push(ChangeEvent::new(key, change_type, payload));
        }
    }
    events.sort_by(|a, b| a.key.cmp(&b.key).then(a.change_type.cmp(&b.change_type)));

    let multiple_changes = types_per_key
        .into_iter()
        .filter(|(_, types)| types.len() > 1)
        .map(|(key, _)| key)
        .collect();

    CollapsedTagged { events, multiple_changes, conflicts, supplied, duplicate_rows }
}

/// Tagged changes that disagree with the current ledger state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresenceFindings {
    /// Adds whose key is already open.
    pub adds_present: Vec<RecordKey>,
    /// Removes whose key is not open.
    pub removes_absent: Vec<RecordKey>,
    /// Updates whose key is not open.
    pub updates_absent: Vec<RecordKey>,
    /// Updates whose payload equals the open payload.
    pub noop_updates: Vec<RecordKey>,
}

impl PresenceFindings {
    /// Merge another shard's findings.
    pub fn extend(&mut self, other: PresenceFindings) {
        self.adds_present.extend(other.adds_present);
        self.removes_absent.extend(other.removes_absent);
        self.updates_absent.extend(other.updates_absent);
        self.noop_updates.extend(other.noop_updates);
    }
}

/// Compare tagged events with the open records of their shard.
pub fn check_presence(events: &[ChangeEvent], open: &BTreeMap<RecordKey, Payload>) -> PresenceFindings {
    let mut findings = PresenceFindings::default();
    for event in events {
        let current = open.get(&event.key);
        match (event.change_type, current) {
            (ChangeType::Add, Some(_)) => findings.adds_present.push(event.key.clone()),
            (ChangeType::Remove, None) => findings.removes_absent.push(event.key.clone()),
            (ChangeType::Update, None) => findings.updates_absent.push(event.key.clone()),
            (ChangeType::Update, Some(payload)) if *payload == event.payload => {
                findings.noop_updates.push(event.key.clone())
            }
            _ => {}
        }
    }
    findings
}

/// Events that can actually be applied.
///
/// Drops keys tagged with several change types and every change the ledger
/// state contradicts. Removes pick up the open payload so the change log
/// records what was removed.
pub fn effective_events(
    collapsed: &CollapsedTagged,
    findings: &PresenceFindings,
    open: &BTreeMap<RecordKey, Payload>,
) -> Vec<ChangeEvent> {
    let multiple: BTreeSet<&RecordKey> = collapsed.multiple_changes.iter().collect();
    let rejected: BTreeSet<(&RecordKey, ChangeType)> = findings
        .adds_present
        .iter()
        .map(|k| (k, ChangeType::Add))
        .chain(findings.removes_absent.iter().map(|k| (k, ChangeType::Remove)))
        .chain(findings.updates_absent.iter().map(|k| (k, ChangeType::Update)))
        .chain(findings.noop_updates.iter().map(|k| (k, ChangeType::Update)))
        .collect();

    collapsed
        .events
        .iter()
        .filter(|e| !multiple.contains(&e.key))
        .filter(|e| !rejected.contains(&(&e.key, e.change_type)))
        .map(|e| match (e.change_type, open.get(&e.key)) {
            (ChangeType::Remove, Some(payload)) => {
                ChangeEvent::new(e.key.clone(), ChangeType::Remove, payload.clone())
            }
            _ => e.clone(),
        })
        .collect()
}

/// Estimated ledger size after applying a delta.
///
/// Deliberately ignores the edge cases the tagged checks exist to catch
/// (an add for a key that is already present still counts as growth). Only
/// the size-variation check consumes this.
pub fn approximate_post_delta_size(current: u64, counts: &ChangeCounts) -> u64 {
    (current + counts.adds).saturating_sub(counts.removes)
}
