//! Output lists: naming, CSV rendering and descriptors.

use serde::{Deserialize, Serialize};

use crate::canonical::sha256_hex;
use crate::reducer::ReasonVocabulary;
use crate::types::{Record, RunId, TableSchema};

/// One generated list.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ListKind {
    /// The global blacklist.
    Blacklist,
    /// A party's notification list.
    Notifications(String),
    /// A party's exception list.
    Exceptions(String),
}

impl ListKind {
    /// Ledger table holding the list.
    pub fn table(&self) -> String {
        match self {
            Self::Blacklist => "blacklist".to_string(),
            Self::Notifications(party) => format!("notifications_{party}"),
            Self::Exceptions(party) => format!("exceptions_{party}"),
        }
    }

    /// Reasons the list's deltas can carry.
    pub fn vocabulary(&self) -> ReasonVocabulary {
        match self {
            Self::Blacklist => ReasonVocabulary::BLACKLIST,
            Self::Notifications(_) => ReasonVocabulary::NOTIFICATIONS,
            Self::Exceptions(_) => ReasonVocabulary::EXCEPTIONS,
        }
    }

    /// File name of the full list.
    pub fn full_file_name(&self, date: &str) -> String {
        format!("{date}_{}.csv", self.table())
    }

    /// File name of one delta stream. A missing base run is written as `-1`.
    pub fn delta_file_name(&self, date: &str, base: Option<RunId>, run: RunId, reason: &str) -> String {
        let base = base.map_or(-1, |b| b.value());
        format!("{date}_{}_delta_{base}_{run}_{reason}.csv", self.table())
    }
}

/// What the packaging step needs to know about a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactDescriptor {
    /// File name.
    pub file_name: String,
    /// Data rows, excluding the header.
    pub record_count: u64,
    /// Hex SHA-256 of the contents.
    pub sha256: String,
}

/// A rendered list file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    /// Descriptor recorded in run metadata.
    pub descriptor: ArtifactDescriptor,
    /// List the file belongs to.
    pub list: ListKind,
    /// Delta reason, `None` for the full list.
    pub reason: Option<String>,
    /// CSV contents.
    pub content: String,
}

impl Artifact {
    /// Render records as a CSV artifact.
    pub fn render(file_name: String, list: ListKind, reason: Option<String>, schema: &TableSchema, records: &[Record]) -> Self {
        let content = render_csv(schema, records);
        Self {
            descriptor: ArtifactDescriptor {
                file_name,
                record_count: records.len() as u64,
                sha256: sha256_hex(content.as_bytes()),
            },
            list,
            reason,
            content,
        }
    }
}

fn escape(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

/// Render key fields then payload fields, one line per record, header first.
pub fn render_csv(schema: &TableSchema, records: &[Record]) -> String {
    let mut out = String::new();
    let header: Vec<String> = schema
        .key_fields
        .iter()
        .chain(&schema.payload_fields)
        .map(|f| escape(f))
        .collect();
    out.push_str(&header.join(","));
    out.push('\n');

    for record in records {
        let line: Vec<String> = record
            .key
            .parts()
            .iter()
            .map(|p| escape(p))
            .chain(
                schema
                    .payload_fields
                    .iter()
                    .map(|f| escape(record.payload.get(f).unwrap_or_default())),
            )
            .collect();
        out.push_str(&line.join(","));
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Payload, RecordKey};

    #[test]
    fn test_file_names() {
        let date = "20260301";
        let run = RunId::new(7);
        assert_eq!(ListKind::Blacklist.full_file_name(date), "20260301_blacklist.csv");
        assert_eq!(
            ListKind::Blacklist.delta_file_name(date, Some(RunId::new(5)), run, "blocked"),
            "20260301_blacklist_delta_5_7_blocked.csv"
        );
        assert_eq!(
            ListKind::Notifications("op1".to_string()).delta_file_name(date, None, run, "new"),
            "20260301_notifications_op1_delta_-1_7_new.csv"
        );
        assert_eq!(ListKind::Exceptions("op1".to_string()).full_file_name(date), "20260301_exceptions_op1.csv");
    }

    #[test]
    fn test_render_csv_escapes_and_fills_missing() {
        let schema = TableSchema::new("blacklist", ["imei"], ["block_date", "reasons"]);
        let records = vec![
            Record::new(RecordKey::single("1"), Payload::new().with("block_date", "20260301").with("reasons", "a,b")),
            Record::new(RecordKey::single("2"), Payload::new().with("reasons", "say \"hi\"")),
        ];
        let csv = render_csv(&schema, &records);
        assert_eq!(csv, "imei,block_date,reasons\n1,20260301,\"a,b\"\n2,,\"say \"\"hi\"\"\"\n");
    }

    #[test]
    fn test_descriptor_counts_rows_and_hashes_content() {
        let schema = TableSchema::new("blacklist", ["imei"], ["block_date", "reasons"]);
        let empty = Artifact::render("x.csv".to_string(), ListKind::Blacklist, None, &schema, &[]);
        assert_eq!(empty.descriptor.record_count, 0);
        assert_eq!(empty.content, "imei,block_date,reasons\n");
        assert_eq!(empty.descriptor.sha256, sha256_hex(b"imei,block_date,reasons\n"));
    }
}
