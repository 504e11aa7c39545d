//! Keyed records and table schemas.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Primary key of a record, one value per key field.
///
/// The first component is the shard field: every key that shares it lands
/// in the same virtual shard.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordKey(Vec<String>);

impl RecordKey {
    /// Create a key from its components.
    pub fn new(parts: Vec<String>) -> Self {
        Self(parts)
    }

    /// Create a single-field key.
    pub fn single(value: impl Into<String>) -> Self {
        Self(vec![value.into()])
    }

    /// Key components in field order.
    pub fn parts(&self) -> &[String] {
        &self.0
    }

    /// Value used for shard assignment.
    pub fn shard_field(&self) -> &str {
        self.0.first().map(String::as_str).unwrap_or("")
    }

    /// Number of key components.
    pub fn arity(&self) -> usize {
        self.0.len()
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("|"))
    }
}

impl<S: Into<String>> From<Vec<S>> for RecordKey {
    fn from(parts: Vec<S>) -> Self {
        Self(parts.into_iter().map(Into::into).collect())
    }
}

/// Non-key attributes of a record.
///
/// A BTreeMap so that equality and serialization are order independent.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Payload(BTreeMap<String, String>);

impl Payload {
    /// Create an empty payload.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style attribute setter.
    pub fn with(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(field.into(), value.into());
        self
    }

    /// Look up an attribute.
    pub fn get(&self, field: &str) -> Option<&str> {
        self.0.get(field).map(String::as_str)
    }

    /// Iterate attributes in field order.
    pub fn fields(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }

    /// Check if the payload has no attributes.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, String)> for Payload {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// A keyed business entity as observed in one snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Primary key.
    pub key: RecordKey,
    /// Non-key attributes.
    pub payload: Payload,
}

impl Record {
    /// Create a record.
    pub fn new(key: RecordKey, payload: Payload) -> Self {
        Self { key, payload }
    }
}

/// Shape of a ledger table: key fields plus a fixed set of payload fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    /// Table name (must be an allow-listed identifier).
    pub name: String,
    /// Key field names, shard field first.
    pub key_fields: Vec<String>,
    /// Permitted payload field names.
    pub payload_fields: Vec<String>,
}

impl TableSchema {
    /// Create a schema.
    pub fn new(
        name: impl Into<String>,
        key_fields: impl IntoIterator<Item = impl Into<String>>,
        payload_fields: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            name: name.into(),
            key_fields: key_fields.into_iter().map(Into::into).collect(),
            payload_fields: payload_fields.into_iter().map(Into::into).collect(),
        }
    }

    /// Check a record against this schema.
    pub fn check(&self, record: &Record) -> Result<(), String> {
        if record.key.arity() != self.key_fields.len() {
            return Err(format!(
                "table {}: key {} has {} fields, expected {}",
                self.name,
                record.key,
                record.key.arity(),
                self.key_fields.len()
            ));
        }
        if record.key.parts().iter().any(|p| p.is_empty()) {
            return Err(format!("table {}: key {} has an empty field", self.name, record.key));
        }
        for (field, _) in record.payload.fields() {
            if !self.payload_fields.iter().any(|f| f == field) {
                return Err(format!(
                    "table {}: unknown payload field {} on key {}",
                    self.name, field, record.key
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> TableSchema {
        TableSchema::new("stolen_list", ["imei"], ["reporting_date", "status"])
    }

    #[test]
    fn test_payload_equality_ignores_insertion_order() {
        let a = Payload::new().with("a", "1").with("b", "2");
        let b = Payload::new().with("b", "2").with("a", "1");
        assert_eq!(a, b);
    }

    #[test]
    fn test_shard_field_is_first_component() {
        let key = RecordKey::from(vec!["35000000000001", "310150123456789", "15551234"]);
        assert_eq!(key.shard_field(), "35000000000001");
        assert_eq!(key.to_string(), "35000000000001|310150123456789|15551234");
    }

    #[test]
    fn test_schema_accepts_valid_record() {
        let record = Record::new(RecordKey::single("1"), Payload::new().with("status", "x"));
        assert!(schema().check(&record).is_ok());
    }

    #[test]
    fn test_schema_rejects_wrong_arity() {
        let record = Record::new(RecordKey::from(vec!["1", "2"]), Payload::new());
        assert!(schema().check(&record).is_err());
    }

    #[test]
    fn test_schema_rejects_unknown_field() {
        let record = Record::new(RecordKey::single("1"), Payload::new().with("colour", "red"));
        let err = schema().check(&record).unwrap_err();
        assert!(err.contains("colour"));
    }
}
