//! Append-only interval ledger for one table.
//!
//! Every key owns a chronologically ordered list of intervals. At most the
//! last one is open. Intervals are only ever appended or closed, which is
//! what makes [`TemporalLedger::as_of`] possible without replay.

use std::collections::BTreeMap;

use crate::shard::ShardRange;
use crate::types::{ChangeEvent, ChangeLogEntry, ChangeType, Interval, Marker, Payload, Record, RecordKey};

/// Impossible operation on the ledger.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    /// Add for a key that already has an open interval.
    #[error("Key {key} already has an open interval")]
    AlreadyOpen {
        /// Offending key.
        key: RecordKey,
    },
    /// Remove or update for a key without an open interval.
    #[error("Key {key} has no open interval")]
    NotOpen {
        /// Offending key.
        key: RecordKey,
    },
    /// Change at a marker earlier than the key's latest interval boundary.
    #[error("Marker {at} for key {key} precedes its latest marker {latest}")]
    NonMonotonic {
        /// Offending key.
        key: RecordKey,
        /// Marker of the rejected change.
        at: Marker,
        /// Latest start or end marker recorded for the key.
        latest: Marker,
    },
}

/// Reject a change at `at` when the key's latest marker (end of its last
/// interval, or start if that interval is open) lies after it.
pub fn check_marker_order(key: &RecordKey, latest: Option<Marker>, at: Marker) -> Result<(), LedgerError> {
    match latest {
        Some(latest) if at < latest => Err(LedgerError::NonMonotonic { key: key.clone(), at, latest }),
        _ => Ok(()),
    }
}

/// Interval history and change log of one table.
#[derive(Debug, Clone, Default)]
pub struct TemporalLedger {
    intervals: BTreeMap<RecordKey, Vec<Interval>>,
    open_count: u64,
    log: Vec<ChangeLogEntry>,
}

impl TemporalLedger {
    /// Create an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    fn check_monotonic(&self, key: &RecordKey, at: Marker) -> Result<(), LedgerError> {
        let latest = self
            .intervals
            .get(key)
            .and_then(|v| v.last())
            .map(|i| i.end.unwrap_or(i.start));
        check_marker_order(key, latest, at)
    }

    fn open_interval_mut(&mut self, key: &RecordKey) -> Option<&mut Interval> {
        self.intervals
            .get_mut(key)
            .and_then(|v| v.last_mut())
            .filter(|i| i.is_open())
    }

    /// Insert a new open interval `[at, ∞)`.
    pub fn apply_add(&mut self, key: &RecordKey, payload: Payload, at: Marker) -> Result<(), LedgerError> {
        if self.contains_open(key) {
            return Err(LedgerError::AlreadyOpen { key: key.clone() });
        }
        self.check_monotonic(key, at)?;
        self.intervals.entry(key.clone()).or_default().push(Interval {
            key: key.clone(),
            payload,
            start: at,
            end: None,
        });
        self.open_count += 1;
        Ok(())
    }

    /// Close the open interval at `at`. Returns the payload it held.
    pub fn apply_remove(&mut self, key: &RecordKey, at: Marker) -> Result<Payload, LedgerError> {
        self.check_monotonic(key, at)?;
        let interval = self
            .open_interval_mut(key)
            .ok_or_else(|| LedgerError::NotOpen { key: key.clone() })?;
        interval.end = Some(at);
        let payload = interval.payload.clone();
        self.open_count -= 1;
        Ok(payload)
    }

    /// Close the open interval and open a new one at the same marker.
    pub fn apply_update(&mut self, key: &RecordKey, payload: Payload, at: Marker) -> Result<(), LedgerError> {
        if !self.contains_open(key) {
            return Err(LedgerError::NotOpen { key: key.clone() });
        }
        self.apply_remove(key, at)?;
        self.apply_add(key, payload, at)
    }

    /// Apply one event and append it to the change log.
    pub fn apply(&mut self, event: &ChangeEvent, at: Marker) -> Result<(), LedgerError> {
        let payload = match event.change_type {
            ChangeType::Add => {
                self.apply_add(&event.key, event.payload.clone(), at)?;
                event.payload.clone()
            }
            ChangeType::Remove => self.apply_remove(&event.key, at)?,
            ChangeType::Update => {
                self.apply_update(&event.key, event.payload.clone(), at)?;
                event.payload.clone()
            }
        };
        self.log.push(ChangeLogEntry {
            key: event.key.clone(),
            shard_id: event.shard_id,
            marker: at,
            change_type: event.change_type,
            reason: event.reason.clone(),
            payload,
        });
        Ok(())
    }

    /// Apply events in order, stopping at the first failure.
    pub fn apply_all(&mut self, events: &[ChangeEvent], at: Marker) -> Result<(), LedgerError> {
        events.iter().try_for_each(|e| self.apply(e, at))
    }

    /// Whether a key currently has an open interval.
    pub fn contains_open(&self, key: &RecordKey) -> bool {
        self.intervals
            .get(key)
            .and_then(|v| v.last())
            .map_or(false, Interval::is_open)
    }

    /// Payload of a key's open interval.
    pub fn open_payload(&self, key: &RecordKey) -> Option<&Payload> {
        self.intervals
            .get(key)
            .and_then(|v| v.last())
            .filter(|i| i.is_open())
            .map(|i| &i.payload)
    }

    /// Number of open intervals.
    pub fn open_count(&self) -> u64 {
        self.open_count
    }

    /// Currently true records within a shard range, in key order.
    pub fn open_records(&self, range: ShardRange) -> Vec<Record> {
        self.intervals
            .iter()
            .filter(|(key, _)| range.contains_key(key))
            .filter_map(|(_, v)| v.last().filter(|i| i.is_open()).map(Interval::to_record))
            .collect()
    }

    /// Records that were true at `marker`, in key order.
    pub fn as_of(&self, marker: Marker) -> Vec<Record> {
        self.intervals
            .values()
            .filter_map(|v| v.iter().find(|i| i.contains(marker)).map(Interval::to_record))
            .collect()
    }

    /// Full interval history of a key, oldest first.
    pub fn history(&self, key: &RecordKey) -> &[Interval] {
        self.intervals.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Change log entries with `after < marker <= up_to` within a shard range, oldest first.
    pub fn change_log(&self, range: ShardRange, after: Option<Marker>, up_to: Marker) -> Vec<ChangeLogEntry> {
        self.log
            .iter()
            .filter(|e| after.map_or(true, |a| e.marker > a) && e.marker <= up_to)
            .filter(|e| range.contains(e.shard_id))
            .cloned()
            .collect()
    }

    /// Number of keys with any history.
    pub fn key_count(&self) -> usize {
        self.intervals.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(k: &str) -> RecordKey {
        RecordKey::single(k)
    }

    fn payload(v: &str) -> Payload {
        Payload::new().with("status", v)
    }

    #[test]
    fn test_add_remove_add_round_trip() {
        let mut ledger = TemporalLedger::new();
        let k = key("35000000000001");

        ledger.apply_add(&k, payload("a"), Marker::new(1)).unwrap();
        ledger.apply_remove(&k, Marker::new(2)).unwrap();
        ledger.apply_add(&k, payload("b"), Marker::new(3)).unwrap();

        let history = ledger.history(&k);
        assert_eq!(history.len(), 2);
        assert_eq!(history.iter().filter(|i| i.is_open()).count(), 1);
        assert_eq!(history[0].end, Some(Marker::new(2)));
        assert_eq!(ledger.open_payload(&k), Some(&payload("b")));
        assert_eq!(ledger.open_count(), 1);
    }

    #[test]
    fn test_double_add_is_rejected() {
        let mut ledger = TemporalLedger::new();
        let k = key("1");
        ledger.apply_add(&k, payload("a"), Marker::new(1)).unwrap();
        let err = ledger.apply_add(&k, payload("a"), Marker::new(2)).unwrap_err();
        assert!(matches!(err, LedgerError::AlreadyOpen { .. }));
    }

    #[test]
    fn test_remove_without_open_is_rejected() {
        let mut ledger = TemporalLedger::new();
        let err = ledger.apply_remove(&key("1"), Marker::new(1)).unwrap_err();
        assert!(matches!(err, LedgerError::NotOpen { .. }));
    }

    #[test]
    fn test_update_shares_boundary_marker() {
        let mut ledger = TemporalLedger::new();
        let k = key("1");
        ledger.apply_add(&k, payload("a"), Marker::new(10)).unwrap();
        ledger.apply_update(&k, payload("b"), Marker::new(20)).unwrap();

        let history = ledger.history(&k);
        assert_eq!(history[0].end, Some(Marker::new(20)));
        assert_eq!(history[1].start, Marker::new(20));
        assert_eq!(ledger.open_count(), 1);
    }

    #[test]
    fn test_update_without_open_leaves_ledger_untouched() {
        let mut ledger = TemporalLedger::new();
        let k = key("1");
        assert!(ledger.apply_update(&k, payload("b"), Marker::new(1)).is_err());
        assert!(ledger.history(&k).is_empty());
    }

    #[test]
    fn test_backdated_change_is_rejected() {
        let mut ledger = TemporalLedger::new();
        let k = key("1");
        ledger.apply_add(&k, payload("a"), Marker::new(10)).unwrap();
        let err = ledger.apply_remove(&k, Marker::new(5)).unwrap_err();
        assert!(matches!(err, LedgerError::NonMonotonic { .. }));
    }

    #[test]
    fn test_readd_before_close_marker_is_rejected() {
        let mut ledger = TemporalLedger::new();
        let k = key("1");
        ledger.apply_add(&k, payload("a"), Marker::new(10)).unwrap();
        ledger.apply_remove(&k, Marker::new(20)).unwrap();
        let err = ledger.apply_add(&k, payload("b"), Marker::new(15)).unwrap_err();
        assert_eq!(
            err,
            LedgerError::NonMonotonic { key: k.clone(), at: Marker::new(15), latest: Marker::new(20) }
        );
        assert!(!ledger.contains_open(&k));
    }

    #[test]
    fn test_marker_order_allows_equal_and_fresh_keys() {
        let k = key("1");
        assert!(check_marker_order(&k, None, Marker::new(1)).is_ok());
        assert!(check_marker_order(&k, Some(Marker::new(7)), Marker::new(7)).is_ok());
        assert!(check_marker_order(&k, Some(Marker::new(7)), Marker::new(6)).is_err());
    }

    #[test]
    fn test_as_of_reconstructs_past_state() {
        let mut ledger = TemporalLedger::new();
        ledger.apply_add(&key("a"), payload("1"), Marker::new(1)).unwrap();
        ledger.apply_add(&key("b"), payload("1"), Marker::new(1)).unwrap();
        ledger.apply_update(&key("a"), payload("2"), Marker::new(2)).unwrap();
        ledger.apply_remove(&key("b"), Marker::new(3)).unwrap();

        let at1 = ledger.as_of(Marker::new(1));
        assert_eq!(at1.len(), 2);
        assert_eq!(at1[0].payload, payload("1"));

        let at2 = ledger.as_of(Marker::new(2));
        assert_eq!(at2.len(), 2);
        assert_eq!(at2[0].payload, payload("2"));

        let at3 = ledger.as_of(Marker::new(3));
        assert_eq!(at3.len(), 1);
        assert_eq!(at3[0].key, key("a"));

        assert!(ledger.as_of(Marker::new(0)).is_empty());
    }

    #[test]
    fn test_change_log_window_and_payloads() {
        let mut ledger = TemporalLedger::new();
        let k = key("1");
        let add = ChangeEvent::add(Record::new(k.clone(), payload("a"))).with_reason("blocked");
        let remove = ChangeEvent::remove(Record::new(k.clone(), Payload::new())).with_reason("unblocked");

        ledger.apply(&add, Marker::new(1)).unwrap();
        ledger.apply(&remove, Marker::new(2)).unwrap();

        let all = ledger.change_log(ShardRange::all(), None, Marker::new(2));
        assert_eq!(all.len(), 2);
        // Removes carry the payload of the interval they closed.
        assert_eq!(all[1].payload, payload("a"));

        let window = ledger.change_log(ShardRange::all(), Some(Marker::new(1)), Marker::new(2));
        assert_eq!(window.len(), 1);
        assert_eq!(window[0].reason.as_deref(), Some("unblocked"));
    }
}
