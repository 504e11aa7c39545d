//! Allow-listed identifiers and SQL composition.
//!
//! Table, partition and column names cannot be bound as query parameters,
//! so they are composed into SQL text. Every such name goes through an
//! [`IdentifierAllowList`] built from configuration, and the
//! [`QueryBuilder`] only accepts [`Ident`] values. Values always travel as
//! `$N` placeholders.

use regex_lite::Regex;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::OnceLock;

use crate::shard::{shard_name, ShardRange};

/// Rejected identifier.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentifierError {
    /// Not a plain lowercase SQL identifier.
    #[error("'{0}' is not a valid identifier")]
    Malformed(String),
    /// Well-formed but not on the allow-list.
    #[error("'{0}' is not an allowed identifier")]
    NotAllowed(String),
}

fn identifier_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[a-z_][a-z0-9_]{0,62}$").unwrap_or_else(|e| panic!("identifier pattern: {e}"))
    })
}

/// Whether a string is a plain lowercase SQL identifier.
pub fn is_valid_identifier(s: &str) -> bool {
    identifier_pattern().is_match(s)
}

/// An identifier that passed the allow-list.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ident(String);

impl Ident {
    /// The identifier text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Ident {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The set of identifiers SQL may reference.
#[derive(Debug, Clone, Default)]
pub struct IdentifierAllowList {
    allowed: BTreeSet<String>,
}

impl IdentifierAllowList {
    /// Create an empty allow-list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allow a name.
    pub fn allow(&mut self, name: impl Into<String>) -> Result<(), IdentifierError> {
        let name = name.into();
        if !is_valid_identifier(&name) {
            return Err(IdentifierError::Malformed(name));
        }
        self.allowed.insert(name);
        Ok(())
    }

    /// Allow a ledger table together with its change log and every shard partition of both.
    pub fn allow_table(&mut self, table: &str, ranges: &[ShardRange]) -> Result<(), IdentifierError> {
        let log = change_log_table(table);
        self.allow(table)?;
        self.allow(log.clone())?;
        for range in ranges {
            self.allow(shard_name(table, range))?;
            self.allow(shard_name(&log, range))?;
        }
        Ok(())
    }

    /// Look up an allowed identifier.
    pub fn ident(&self, name: &str) -> Result<Ident, IdentifierError> {
        if !is_valid_identifier(name) {
            return Err(IdentifierError::Malformed(name.to_string()));
        }
        if !self.allowed.contains(name) {
            return Err(IdentifierError::NotAllowed(name.to_string()));
        }
        Ok(Ident(name.to_string()))
    }

    /// Partition identifier of a table for one shard range.
    pub fn shard_table(&self, table: &Ident, range: &ShardRange) -> Result<Ident, IdentifierError> {
        self.ident(&shard_name(table.as_str(), range))
    }

    /// Change log identifier of a table.
    pub fn change_log(&self, table: &Ident) -> Result<Ident, IdentifierError> {
        self.ident(&change_log_table(table.as_str()))
    }

    /// Whether a name is allowed.
    pub fn contains(&self, name: &str) -> bool {
        self.allowed.contains(name)
    }
}

/// Name of a table's change log.
pub fn change_log_table(table: &str) -> String {
    format!("{}_change_log", table)
}

/// Filter clauses accepted by [`QueryBuilder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    /// `column = $n`
    Eq(Ident, usize),
    /// `column > $n`
    Gt(Ident, usize),
    /// `column <= $n`
    Le(Ident, usize),
    /// `column IS NULL`
    IsNull(Ident),
    /// `(column IS NULL OR column > $n)`
    NullOrGt(Ident, usize),
    /// `column >= $n AND column < $m`
    Range(Ident, usize, usize),
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Eq(c, n) => write!(f, "{} = ${}", c, n),
            Self::Gt(c, n) => write!(f, "{} > ${}", c, n),
            Self::Le(c, n) => write!(f, "{} <= ${}", c, n),
            Self::IsNull(c) => write!(f, "{} IS NULL", c),
            Self::NullOrGt(c, n) => write!(f, "({} IS NULL OR {} > ${})", c, c, n),
            Self::Range(c, lo, hi) => write!(f, "{} >= ${} AND {} < ${}", c, lo, c, hi),
        }
    }
}

/// SELECT builder over allow-listed identifiers.
#[derive(Debug, Clone)]
pub struct QueryBuilder {
    table: Ident,
    columns: Vec<Ident>,
    filters: Vec<Filter>,
    order_by: Vec<Ident>,
    count: bool,
}

impl QueryBuilder {
    /// Start a query against a table.
    pub fn select(table: Ident) -> Self {
        Self {
            table,
            columns: Vec::new(),
            filters: Vec::new(),
            order_by: Vec::new(),
            count: false,
        }
    }

    /// Start a `SELECT COUNT(*)` query.
    pub fn count(table: Ident) -> Self {
        Self { count: true, ..Self::select(table) }
    }

    /// Set the selected columns (defaults to `*`).
    pub fn columns(mut self, columns: impl IntoIterator<Item = Ident>) -> Self {
        self.columns = columns.into_iter().collect();
        self
    }

    /// Add a filter; filters are AND-ed.
    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    /// Add an ORDER BY column.
    pub fn order_by(mut self, column: Ident) -> Self {
        self.order_by.push(column);
        self
    }

    /// Render the SQL text.
    pub fn build(&self) -> String {
        let projection = if self.count {
            "COUNT(*)".to_string()
        } else if self.columns.is_empty() {
            "*".to_string()
        } else {
            join(&self.columns)
        };
        let mut sql = format!("SELECT {} FROM {}", projection, self.table);
        if !self.filters.is_empty() {
            let filters: Vec<String> = self.filters.iter().map(ToString::to_string).collect();
            sql.push_str(" WHERE ");
            sql.push_str(&filters.join(" AND "));
        }
        if !self.order_by.is_empty() {
            sql.push_str(" ORDER BY ");
            sql.push_str(&join(&self.order_by));
        }
        sql
    }
}

fn join(idents: &[Ident]) -> String {
    idents.iter().map(Ident::as_str).collect::<Vec<_>>().join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shard::ShardPartitioner;

    fn allow_list() -> IdentifierAllowList {
        let partitioner = ShardPartitioner::new(4).unwrap();
        let mut list = IdentifierAllowList::new();
        list.allow_table("blacklist", partitioner.ranges()).unwrap();
        for column in ["key_parts", "payload", "start_marker", "end_marker", "virt_shard"] {
            list.allow(column).unwrap();
        }
        list
    }

    #[test]
    fn test_rejects_malformed_identifiers() {
        let mut list = IdentifierAllowList::new();
        assert!(matches!(list.allow("users; DROP TABLE x"), Err(IdentifierError::Malformed(_))));
        assert!(matches!(list.allow("Upper"), Err(IdentifierError::Malformed(_))));
        assert!(matches!(list.allow("1abc"), Err(IdentifierError::Malformed(_))));
    }

    #[test]
    fn test_rejects_unlisted_identifiers() {
        let list = allow_list();
        assert!(matches!(list.ident("notifications"), Err(IdentifierError::NotAllowed(_))));
        assert!(list.ident("blacklist").is_ok());
    }

    #[test]
    fn test_shard_partitions_are_allowed() {
        let list = allow_list();
        let table = list.ident("blacklist").unwrap();
        let partitioner = ShardPartitioner::new(4).unwrap();
        let part = list.shard_table(&table, &partitioner.ranges()[1]).unwrap();
        assert_eq!(part.as_str(), "blacklist_25_49");
        assert!(list.contains("blacklist_change_log_75_99"));

        let other = ShardPartitioner::new(3).unwrap();
        assert!(list.shard_table(&table, &other.ranges()[0]).is_err());
    }

    #[test]
    fn test_builder_renders_filters_in_order() {
        let list = allow_list();
        let sql = QueryBuilder::select(list.ident("blacklist").unwrap())
            .columns([list.ident("key_parts").unwrap(), list.ident("payload").unwrap()])
            .filter(Filter::IsNull(list.ident("end_marker").unwrap()))
            .filter(Filter::Range(list.ident("virt_shard").unwrap(), 1, 2))
            .order_by(list.ident("key_parts").unwrap())
            .build();
        assert_eq!(
            sql,
            "SELECT key_parts, payload FROM blacklist WHERE end_marker IS NULL \
             AND virt_shard >= $1 AND virt_shard < $2 ORDER BY key_parts"
        );
    }

    #[test]
    fn test_count_query() {
        let list = allow_list();
        let sql = QueryBuilder::count(list.ident("blacklist").unwrap())
            .filter(Filter::IsNull(list.ident("end_marker").unwrap()))
            .build();
        assert_eq!(sql, "SELECT COUNT(*) FROM blacklist WHERE end_marker IS NULL");
    }
}
