//! Inputs to list generation: compliance state, parties and rules.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::types::{Payload, Record, RecordKey, TableSchema};

/// Date format used in list payloads and file names.
pub const DATE_FORMAT: &str = "%Y%m%d";

fn format_date(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

/// An external party receiving per-party lists.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Party {
    /// Identifier used in table and file names.
    pub id: String,
    /// Display name.
    pub name: String,
}

impl Party {
    /// Create a party.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self { id: id.into(), name: name.into() }
    }
}

/// A blocking rule definition. Only its identity matters here; the
/// classification itself happens upstream.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockingRule {
    /// Rule name, as it appears in `reasons`.
    pub name: String,
    /// Grace period before a matching device is blocked.
    pub grace_period_days: u32,
    /// Whether the rule blocks at all or only informs.
    pub blocking: bool,
}

impl BlockingRule {
    /// Create a blocking rule.
    pub fn new(name: impl Into<String>, grace_period_days: u32) -> Self {
        Self { name: name.into(), grace_period_days, blocking: true }
    }
}

/// A device that must be blocked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlacklistEntry {
    /// Device identifier.
    pub imei: String,
    /// Date the block took effect.
    pub block_date: NaiveDate,
    /// Rules that matched.
    pub reasons: Vec<String>,
}

impl BlacklistEntry {
    /// Schema of the blacklist table.
    pub fn schema() -> TableSchema {
        TableSchema::new("blacklist", ["imei"], ["block_date", "reasons"])
    }

    /// Ledger record.
    pub fn to_record(&self) -> Record {
        Record::new(
            RecordKey::single(self.imei.clone()),
            Payload::new()
                .with("block_date", format_date(self.block_date))
                .with("reasons", join_reasons(&self.reasons)),
        )
    }
}

/// A subscriber to notify about an upcoming block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationEntry {
    /// Device identifier.
    pub imei: String,
    /// Subscriber identity.
    pub imsi: String,
    /// Subscriber number.
    pub msisdn: String,
    /// Date the block will take effect.
    pub block_date: NaiveDate,
    /// Rules that matched.
    pub reasons: Vec<String>,
    /// Whether the device falls under amnesty.
    pub amnesty_granted: bool,
}

impl NotificationEntry {
    /// Schema of a party's notifications table.
    pub fn schema(party: &str, include_amnesty: bool) -> TableSchema {
        let mut payload = vec!["block_date", "reasons"];
        if include_amnesty {
            payload.push("amnesty_granted");
        }
        TableSchema::new(format!("notifications_{party}"), ["imei", "imsi", "msisdn"], payload)
    }

    /// Ledger record. The amnesty flag only enters the payload when amnesty is in effect.
    pub fn to_record(&self, include_amnesty: bool) -> Record {
        let mut payload = Payload::new()
            .with("block_date", format_date(self.block_date))
            .with("reasons", join_reasons(&self.reasons));
        if include_amnesty {
            payload = payload.with("amnesty_granted", self.amnesty_granted.to_string());
        }
        Record::new(
            RecordKey::new(vec![self.imei.clone(), self.imsi.clone(), self.msisdn.clone()]),
            payload,
        )
    }
}

/// A subscriber whose device is exempt from blocking.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExceptionEntry {
    /// Device identifier.
    pub imei: String,
    /// Subscriber identity.
    pub imsi: String,
    /// Subscriber number.
    pub msisdn: String,
}

impl ExceptionEntry {
    /// Schema of a party's exceptions table.
    pub fn schema(party: &str) -> TableSchema {
        TableSchema::new(format!("exceptions_{party}"), ["imei", "imsi", "msisdn"], Vec::<String>::new())
    }

    /// Ledger record.
    pub fn to_record(&self) -> Record {
        Record::new(
            RecordKey::new(vec![self.imei.clone(), self.imsi.clone(), self.msisdn.clone()]),
            Payload::new(),
        )
    }
}

/// A registered device/subscriber pairing.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Pairing {
    /// Device identifier.
    pub imei: String,
    /// Subscriber identity.
    pub imsi: String,
}

/// Membership decisions for one list generation run.
///
/// Produced by classification logic outside this crate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplianceState {
    /// Devices to block.
    pub blacklist: Vec<BlacklistEntry>,
    /// Notifications per party id.
    pub notifications: BTreeMap<String, Vec<NotificationEntry>>,
    /// Exceptions per party id.
    pub exceptions: BTreeMap<String, Vec<ExceptionEntry>>,
    /// Registered pairings.
    pub pairings: Vec<Pairing>,
}

impl ComplianceState {
    /// Blocked device identifiers.
    pub fn blacklisted_imeis(&self) -> BTreeSet<String> {
        self.blacklist.iter().map(|e| e.imei.clone()).collect()
    }

    /// Device identifiers still notified for a party.
    pub fn notified_imeis(&self, party: &str) -> BTreeSet<String> {
        self.notifications
            .get(party)
            .map(|entries| entries.iter().map(|e| e.imei.clone()).collect())
            .unwrap_or_default()
    }
}

fn join_reasons(reasons: &[String]) -> String {
    let mut sorted: Vec<&str> = reasons.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    sorted.dedup();
    sorted.join("|")
}
