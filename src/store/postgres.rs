//! PostgreSQL ledger store for production use.
//!
//! ## Configuration
//!
//! All settings can be configured via environment variables:
//! - `DATABASE_URL`: PostgreSQL connection string (required)
//! - `DB_MAX_CONNECTIONS`: Maximum pool size (default: 10)
//! - `DB_MIN_CONNECTIONS`: Minimum idle connections (default: 2)
//! - `DB_CONNECT_TIMEOUT_SECS`: Connection timeout (default: 10)
//! - `DB_IDLE_TIMEOUT_SECS`: Idle connection timeout (default: 300)
//! - `DB_MAX_LIFETIME_SECS`: Max connection lifetime (default: 1800)
//!
//! ## Layout
//!
//! Each ledger table is range-partitioned on its virtual shard, one
//! partition per physical shard, with a change log partitioned the same
//! way. Shard staging runs in its own transaction on its own connection and
//! ends in `PREPARE TRANSACTION`; committing a run commits every prepared
//! transaction of the run. The server needs `max_prepared_transactions` at
//! least as large as the number of shards a run stages; [`PostgresStore::new`]
//! refuses to start below the physical shard count.
//!
//! A run's prepared transactions stay tracked until each one is finished.
//! Once a commit has started, the run can only be rolled forward: an abort
//! after a partial commit commits the remaining shards instead of rolling
//! them back. Prepared transactions left by a crashed process are resolved
//! on startup the same way, from the `committing` flag in the run row.

use async_trait::async_trait;
use parking_lot::Mutex;
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{Connection, Row};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use super::{LedgerStore, RunStore};
use crate::coordinator::{lock_key, ConfigFingerprint};
use crate::error::PipelineError;
use crate::ledger::{check_marker_order, LedgerError};
use crate::query::{Filter, Ident, IdentifierAllowList, IdentifierError, QueryBuilder};
use crate::shard::{shard_name, virtual_shard_of, ShardPartitioner, ShardRange};
use crate::types::{
    ChangeCounts, ChangeEvent, ChangeLogEntry, ChangeType, Interval, Marker, Payload, Record, RecordKey,
    RunId, RunMetadata, RunStatus,
};

const COLUMNS: [&str; 9] = [
    "virt_shard",
    "key_parts",
    "payload",
    "start_marker",
    "end_marker",
    "marker",
    "change_type",
    "reason",
    "seq",
];

/// Configuration for PostgreSQL connection pool.
#[derive(Debug, Clone)]
pub struct PostgresConfig {
    /// Database connection URL.
    pub database_url: String,
    /// Maximum connections in pool (default: 10).
    pub max_connections: u32,
    /// Minimum idle connections to keep warm (default: 2).
    pub min_connections: u32,
    /// Connection acquire timeout in seconds (default: 10).
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds (default: 300 = 5 min).
    pub idle_timeout_secs: u64,
    /// Maximum connection lifetime in seconds (default: 1800 = 30 min).
    pub max_lifetime_secs: u64,
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl PostgresConfig {
    /// Load configuration from environment variables with production defaults.
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgresql://localhost/delta_ledger".to_string()),
            max_connections: env_or("DB_MAX_CONNECTIONS", 10),
            min_connections: env_or("DB_MIN_CONNECTIONS", 2),
            connect_timeout_secs: env_or("DB_CONNECT_TIMEOUT_SECS", 10),
            idle_timeout_secs: env_or("DB_IDLE_TIMEOUT_SECS", 300),
            max_lifetime_secs: env_or("DB_MAX_LIFETIME_SECS", 1800),
        }
    }
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

/// Pool statistics for monitoring.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PoolStats {
    /// Current pool size.
    pub size: u32,
    /// Number of idle connections.
    pub idle: usize,
    /// Maximum pool size.
    pub max: u32,
}

/// Error type for PostgreSQL store.
#[derive(Debug, thiserror::Error)]
pub enum PostgresError {
    /// Database error.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    /// Staged events contradict the stored intervals.
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),
    /// Identifier rejected.
    #[error("Identifier error: {0}")]
    Identifier(#[from] IdentifierError),
    /// Stored JSON does not decode.
    #[error("Malformed stored value: {0}")]
    Decode(#[from] serde_json::Error),
    /// Stored row holds a value no change type or status decodes from.
    #[error("Corrupt row: {0}")]
    Corrupt(String),
    /// Run not found.
    #[error("Run not found: {0}")]
    RunNotFound(RunId),
    /// Server settings cannot support the store.
    #[error("Configuration error: {0}")]
    Config(String),
    /// Some prepared shards of a run could not be finished and are still pending.
    #[error("{verb} PREPARED failed for run {run_id}, pending shards {pending:?}: {source}")]
    Unfinished {
        /// Run whose shards are pending.
        run_id: RunId,
        /// Statement that failed.
        verb: &'static str,
        /// Global ids of the prepared transactions still open.
        pending: Vec<String>,
        /// Server error.
        source: sqlx::Error,
    },
}

impl From<PostgresError> for PipelineError {
    fn from(e: PostgresError) -> Self {
        match e {
            PostgresError::Ledger(inner) => inner.into(),
            PostgresError::Identifier(inner) => inner.into(),
            PostgresError::Corrupt(detail) => PipelineError::LedgerCorruption(detail),
            PostgresError::Config(detail) => PipelineError::Config(detail),
            other => PipelineError::from_store(other),
        }
    }
}

/// Session-level advisory lock. Held by a connection outside the pool;
/// dropping the guard closes the connection, which releases the lock.
#[derive(Debug)]
pub struct PgAdvisoryLock {
    name: String,
    key: i64,
    _conn: PgConnection,
}

impl PgAdvisoryLock {
    /// Lock name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Numeric advisory lock key.
    pub fn key(&self) -> i64 {
        self.key
    }
}

impl Drop for PgAdvisoryLock {
    fn drop(&mut self) {
        tracing::debug!(lock = %self.name, key = self.key, "Releasing advisory lock");
    }
}

const GID_PREFIX: &str = "delta_ledger_";

#[derive(Debug, Clone)]
struct PreparedShard {
    gid: String,
    counts: ChangeCounts,
}

/// How a run's prepared transactions end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resolution {
    Commit,
    Rollback,
}

impl Resolution {
    fn verb(self) -> &'static str {
        match self {
            Resolution::Commit => "COMMIT",
            Resolution::Rollback => "ROLLBACK",
        }
    }
}

#[derive(Debug, Default)]
struct PreparedRun {
    shards: Vec<PreparedShard>,
    committing: bool,
}

/// Prepared shard transactions per run. A shard leaves only once its
/// `COMMIT PREPARED` or `ROLLBACK PREPARED` went through.
#[derive(Debug, Default)]
struct PreparedRuns {
    runs: BTreeMap<RunId, PreparedRun>,
}

impl PreparedRuns {
    fn record(&mut self, run_id: RunId, shard: PreparedShard) {
        self.runs.entry(run_id).or_default().shards.push(shard);
    }

    /// Settle the resolution for a run and list the shards still to finish.
    /// A run that started committing resolves to commit whatever is requested.
    fn resolve(&mut self, run_id: RunId, requested: Resolution) -> (Resolution, Vec<PreparedShard>) {
        let Some(run) = self.runs.get_mut(&run_id) else {
            return (requested, Vec::new());
        };
        if requested == Resolution::Commit {
            run.committing = true;
        }
        let resolution = if run.committing { Resolution::Commit } else { requested };
        (resolution, run.shards.clone())
    }

    fn finished(&mut self, run_id: RunId, gid: &str) {
        if let Some(run) = self.runs.get_mut(&run_id) {
            run.shards.retain(|s| s.gid != gid);
            if run.shards.is_empty() {
                self.runs.remove(&run_id);
            }
        }
    }

    fn pending(&self, run_id: RunId) -> Vec<String> {
        self.runs
            .get(&run_id)
            .map(|run| run.shards.iter().map(|s| s.gid.clone()).collect())
            .unwrap_or_default()
    }
}

/// PostgreSQL ledger and run store.
pub struct PostgresStore {
    pool: PgPool,
    partitioner: ShardPartitioner,
    allow: Mutex<IdentifierAllowList>,
    ensured: tokio::sync::Mutex<BTreeSet<String>>,
    prepared: Mutex<PreparedRuns>,
}

impl PostgresStore {
    /// Create a new store with the given configuration.
    pub async fn new(config: PostgresConfig, partitioner: ShardPartitioner) -> Result<Self, PostgresError> {
        tracing::info!(
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            connect_timeout_secs = config.connect_timeout_secs,
            idle_timeout_secs = config.idle_timeout_secs,
            max_lifetime_secs = config.max_lifetime_secs,
            physical_shards = partitioner.num_shards(),
            "Initializing PostgreSQL connection pool"
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Duration::from_secs(config.idle_timeout_secs))
            .max_lifetime(Duration::from_secs(config.max_lifetime_secs))
            .test_before_acquire(true)
            .connect(&config.database_url)
            .await?;

        let setting: String = sqlx::query("SHOW max_prepared_transactions")
            .fetch_one(&pool)
            .await?
            .try_get(0)?;
        check_prepared_capacity(&setting, partitioner.num_shards())?;

        let mut allow = IdentifierAllowList::new();
        for column in COLUMNS {
            allow.allow(column)?;
        }
        allow.allow("ledger_runs")?;

        let store = Self {
            pool,
            partitioner,
            allow: Mutex::new(allow),
            ensured: tokio::sync::Mutex::new(BTreeSet::new()),
            prepared: Mutex::new(PreparedRuns::default()),
        };
        store.ensure_runs_table().await?;
        store.recover_prepared().await?;
        Ok(store)
    }

    /// Get the connection pool for health checks.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Get pool statistics for monitoring.
    pub fn pool_stats(&self) -> PoolStats {
        PoolStats {
            size: self.pool.size(),
            idle: self.pool.num_idle(),
            max: self.pool.options().get_max_connections(),
        }
    }

    fn ident(&self, name: &str) -> Result<Ident, PostgresError> {
        Ok(self.allow.lock().ident(name)?)
    }

    async fn ensure_runs_table(&self) -> Result<(), PostgresError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ledger_runs (
                run_id BIGSERIAL PRIMARY KEY,
                command TEXT NOT NULL,
                start_time TIMESTAMPTZ NOT NULL DEFAULT now(),
                end_time TIMESTAMPTZ,
                status TEXT NOT NULL,
                config_fingerprint JSONB,
                extra JSONB NOT NULL DEFAULT '{}'::jsonb
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Create a ledger table, its change log and their partitions if missing.
    async fn ensure_table(&self, table: &str) -> Result<Ident, PostgresError> {
        let mut ensured = self.ensured.lock().await;
        if ensured.contains(table) {
            return self.ident(table);
        }
        {
            let mut allow = self.allow.lock();
            allow.allow_table(table, self.partitioner.ranges())?;
            allow.allow(format!("{table}_open_idx"))?;
        }
        for statement in table_ddl(table, self.partitioner.ranges()) {
            sqlx::query(&statement).execute(&self.pool).await?;
        }
        tracing::info!(table, "Ensured ledger table");
        ensured.insert(table.to_string());
        self.ident(table)
    }

    fn parse_record(row: &PgRow) -> Result<Record, PostgresError> {
        let key: Vec<String> = row.try_get("key_parts")?;
        let payload: Json<Payload> = row.try_get("payload")?;
        Ok(Record::new(RecordKey::new(key), payload.0))
    }

    fn parse_run(row: &PgRow) -> Result<RunMetadata, PostgresError> {
        let status: String = row.try_get("status")?;
        let fingerprint: Option<Json<ConfigFingerprint>> = row.try_get("config_fingerprint")?;
        let extra: serde_json::Value = row.try_get("extra")?;
        Ok(RunMetadata {
            run_id: RunId::new(row.try_get("run_id")?),
            command: row.try_get("command")?,
            start_time: row.try_get("start_time")?,
            end_time: row.try_get("end_time")?,
            status: RunStatus::from_str(&status)
                .ok_or_else(|| PostgresError::Corrupt(format!("unknown run status {status}")))?,
            config_fingerprint: fingerprint.map(|f| f.0),
            extra: match extra {
                serde_json::Value::Object(map) => map,
                _ => serde_json::Map::new(),
            },
        })
    }

    async fn apply_event(
        conn: &mut PgConnection,
        part: &Ident,
        log: &Ident,
        event: &ChangeEvent,
        at: Marker,
    ) -> Result<(), PostgresError> {
        let shard = event.shard_id as i16;
        let latest = Self::latest_marker(conn, part, &event.key).await?;
        check_marker_order(&event.key, latest, at)?;
        let payload = match event.change_type {
            ChangeType::Add => {
                Self::open_interval(conn, part, shard, &event.key, &event.payload, at).await?;
                event.payload.clone()
            }
            ChangeType::Remove => Self::close_interval(conn, part, &event.key, at).await?,
            ChangeType::Update => {
                Self::close_interval(conn, part, &event.key, at).await?;
                Self::open_interval(conn, part, shard, &event.key, &event.payload, at).await?;
                event.payload.clone()
            }
        };
        sqlx::query(&format!(
            "INSERT INTO {log} (virt_shard, key_parts, marker, change_type, reason, payload) VALUES ($1, $2, $3, $4, $5, $6)"
        ))
        .bind(shard)
        .bind(event.key.parts())
        .bind(at.value())
        .bind(event.change_type.as_str())
        .bind(event.reason.as_deref())
        .bind(Json(&payload))
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    /// Latest start or end marker of any interval of `key`.
    async fn latest_marker(
        conn: &mut PgConnection,
        part: &Ident,
        key: &RecordKey,
    ) -> Result<Option<Marker>, PostgresError> {
        let latest: Option<i64> = sqlx::query(&format!(
            "SELECT GREATEST(MAX(start_marker), MAX(end_marker)) FROM {part} WHERE key_parts = $1"
        ))
        .bind(key.parts())
        .fetch_one(&mut *conn)
        .await?
        .try_get(0)?;
        Ok(latest.map(Marker::new))
    }

    async fn open_interval(
        conn: &mut PgConnection,
        part: &Ident,
        shard: i16,
        key: &RecordKey,
        payload: &Payload,
        at: Marker,
    ) -> Result<(), PostgresError> {
        let result = sqlx::query(&format!(
            "INSERT INTO {part} (virt_shard, key_parts, payload, start_marker) VALUES ($1, $2, $3, $4) ON CONFLICT DO NOTHING"
        ))
        .bind(shard)
        .bind(key.parts())
        .bind(Json(payload))
        .bind(at.value())
        .execute(&mut *conn)
        .await?;
        if result.rows_affected() == 0 {
            return Err(LedgerError::AlreadyOpen { key: key.clone() }.into());
        }
        Ok(())
    }

    async fn close_interval(
        conn: &mut PgConnection,
        part: &Ident,
        key: &RecordKey,
        at: Marker,
    ) -> Result<Payload, PostgresError> {
        let row = sqlx::query(&format!(
            "UPDATE {part} SET end_marker = $1 WHERE key_parts = $2 AND end_marker IS NULL AND start_marker <= $1 \
             RETURNING payload"
        ))
        .bind(at.value())
        .bind(key.parts())
        .fetch_optional(&mut *conn)
        .await?;
        if let Some(row) = row {
            return Ok(row.try_get::<Json<Payload>, _>("payload")?.0);
        }
        let open_start: Option<i64> = sqlx::query(&format!(
            "SELECT start_marker FROM {part} WHERE key_parts = $1 AND end_marker IS NULL"
        ))
        .bind(key.parts())
        .fetch_optional(&mut *conn)
        .await?
        .map(|row| row.try_get(0))
        .transpose()?;
        match open_start {
            Some(start) => {
                check_marker_order(key, Some(Marker::new(start)), at)?;
                Err(PostgresError::Corrupt(format!("open interval of {key} did not close at {at}")))
            }
            None => Err(LedgerError::NotOpen { key: key.clone() }.into()),
        }
    }

    /// Finish every tracked shard of a run. Returns the resolution applied
    /// and the counts of the shards finished.
    async fn finish_prepared(
        &self,
        run_id: RunId,
        requested: Resolution,
    ) -> Result<(Resolution, usize, ChangeCounts), PostgresError> {
        let (resolution, shards) = self.prepared.lock().resolve(run_id, requested);
        if resolution == Resolution::Commit && !shards.is_empty() {
            self.mark_committing(run_id).await?;
        }
        let mut counts = ChangeCounts::default();
        for shard in &shards {
            let verb = resolution.verb();
            if let Err(source) = sqlx::query(&format!("{verb} PREPARED '{}'", shard.gid))
                .execute(&self.pool)
                .await
            {
                let pending = self.prepared.lock().pending(run_id);
                tracing::error!(run_id = %run_id, verb, pending = ?pending, error = %source, "Prepared shards left unfinished");
                return Err(PostgresError::Unfinished { run_id, verb, pending, source });
            }
            self.prepared.lock().finished(run_id, &shard.gid);
            counts += shard.counts;
        }
        Ok((resolution, shards.len(), counts))
    }

    /// Record the commit decision before the first `COMMIT PREPARED`.
    async fn mark_committing(&self, run_id: RunId) -> Result<(), PostgresError> {
        sqlx::query(r#"UPDATE ledger_runs SET extra = extra || '{"committing": true}'::jsonb WHERE run_id = $1"#)
            .bind(run_id.value())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Resolve prepared transactions left behind by finished runs. Runs still
    /// marked running may belong to a live process and are left alone.
    async fn recover_prepared(&self) -> Result<(), PostgresError> {
        let rows = sqlx::query(
            r#"
            SELECT x.gid, r.status, COALESCE((r.extra->>'committing')::boolean, false) AS committing
              FROM pg_prepared_xacts x
              LEFT JOIN ledger_runs r ON r.run_id = (substring(x.gid from '^delta_ledger_([0-9]+)_'))::bigint
             WHERE x.database = current_database()
               AND x.gid LIKE 'delta\_ledger\_%'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        for row in &rows {
            let gid: String = row.try_get("gid")?;
            let status: Option<String> = row.try_get("status")?;
            let committing: bool = row.try_get("committing")?;
            let Some(resolution) = recovery_resolution(status.as_deref(), committing) else {
                tracing::warn!(gid = %gid, "Prepared shard belongs to a running run, leaving it");
                continue;
            };
            sqlx::query(&format!("{} PREPARED '{gid}'", resolution.verb()))
                .execute(&self.pool)
                .await?;
            tracing::warn!(gid = %gid, verb = resolution.verb(), "Recovered prepared shard");
        }
        Ok(())
    }
}

/// Parse `max_prepared_transactions` and require room for one table's shards.
fn check_prepared_capacity(setting: &str, shards: u32) -> Result<(), PostgresError> {
    let capacity: u32 = setting
        .trim()
        .parse()
        .map_err(|_| PostgresError::Config(format!("unreadable max_prepared_transactions '{setting}'")))?;
    if capacity < shards {
        return Err(PostgresError::Config(format!(
            "max_prepared_transactions is {capacity}, staging needs at least {shards} (one per physical shard)"
        )));
    }
    Ok(())
}

/// How to end an orphaned prepared shard, given its run's status. `None`
/// while the run is still running.
fn recovery_resolution(status: Option<&str>, committing: bool) -> Option<Resolution> {
    match (status, committing) {
        (_, true) => Some(Resolution::Commit),
        (Some("running"), false) => None,
        _ => Some(Resolution::Rollback),
    }
}

/// DDL for a ledger table, its change log and one partition of each per shard range.
fn table_ddl(table: &str, ranges: &[ShardRange]) -> Vec<String> {
    let log = crate::query::change_log_table(table);
    let mut statements = vec![
        format!(
            "CREATE TABLE IF NOT EXISTS {table} (virt_shard SMALLINT NOT NULL, key_parts TEXT[] NOT NULL, \
             payload JSONB NOT NULL, start_marker BIGINT NOT NULL, end_marker BIGINT) PARTITION BY RANGE (virt_shard)"
        ),
        format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS {table}_open_idx ON {table} (virt_shard, key_parts) WHERE end_marker IS NULL"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {log} (seq BIGSERIAL, virt_shard SMALLINT NOT NULL, key_parts TEXT[] NOT NULL, \
             marker BIGINT NOT NULL, change_type TEXT NOT NULL, reason TEXT, payload JSONB NOT NULL) \
             PARTITION BY RANGE (virt_shard)"
        ),
    ];
    for range in ranges {
        for base in [table, log.as_str()] {
            statements.push(format!(
                "CREATE TABLE IF NOT EXISTS {} PARTITION OF {base} FOR VALUES FROM ({}) TO ({})",
                shard_name(base, range),
                range.start,
                range.end
            ));
        }
    }
    statements
}

/// Global id of one prepared shard transaction.
fn prepared_gid(run_id: RunId, table: &str, range: &ShardRange) -> String {
    format!("{GID_PREFIX}{}_{}_{}", run_id, table, range.index)
}

#[async_trait]
impl LedgerStore for PostgresStore {
    type Error = PostgresError;

    async fn open_records(&self, table: &str, range: ShardRange) -> Result<Vec<Record>, Self::Error> {
        let table = self.ensure_table(table).await?;
        let sql = {
            let allow = self.allow.lock();
            QueryBuilder::select(allow.shard_table(&table, &range)?)
                .columns([allow.ident("key_parts")?, allow.ident("payload")?])
                .filter(Filter::IsNull(allow.ident("end_marker")?))
                .order_by(allow.ident("key_parts")?)
                .build()
        };
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(Self::parse_record).collect()
    }

    async fn open_count(&self, table: &str) -> Result<u64, Self::Error> {
        let table = self.ensure_table(table).await?;
        let sql = QueryBuilder::count(table)
            .filter(Filter::IsNull(self.ident("end_marker")?))
            .build();
        let count: i64 = sqlx::query(&sql).fetch_one(&self.pool).await?.try_get(0)?;
        Ok(count as u64)
    }

    async fn as_of(&self, table: &str, marker: Marker) -> Result<Vec<Record>, Self::Error> {
        let table = self.ensure_table(table).await?;
        let sql = QueryBuilder::select(table)
            .columns([self.ident("key_parts")?, self.ident("payload")?])
            .filter(Filter::Le(self.ident("start_marker")?, 1))
            .filter(Filter::NullOrGt(self.ident("end_marker")?, 1))
            .order_by(self.ident("key_parts")?)
            .build();
        let rows = sqlx::query(&sql).bind(marker.value()).fetch_all(&self.pool).await?;
        rows.iter().map(Self::parse_record).collect()
    }

    async fn history(&self, table: &str, key: &RecordKey) -> Result<Vec<Interval>, Self::Error> {
        let table = self.ensure_table(table).await?;
        let range = self.partitioner.range_of_virtual(virtual_shard_of(key));
        let sql = {
            let allow = self.allow.lock();
            QueryBuilder::select(allow.shard_table(&table, &range)?)
                .columns([
                    allow.ident("payload")?,
                    allow.ident("start_marker")?,
                    allow.ident("end_marker")?,
                ])
                .filter(Filter::Eq(allow.ident("key_parts")?, 1))
                .order_by(allow.ident("start_marker")?)
                .build()
        };
        let rows = sqlx::query(&sql).bind(key.parts()).fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| {
                let payload: Json<Payload> = row.try_get("payload")?;
                let end: Option<i64> = row.try_get("end_marker")?;
                Ok(Interval {
                    key: key.clone(),
                    payload: payload.0,
                    start: Marker::new(row.try_get("start_marker")?),
                    end: end.map(Marker::new),
                })
            })
            .collect()
    }

    async fn change_log(
        &self,
        table: &str,
        range: ShardRange,
        after: Option<Marker>,
        up_to: Marker,
    ) -> Result<Vec<ChangeLogEntry>, Self::Error> {
        let table = self.ensure_table(table).await?;
        let sql = {
            let allow = self.allow.lock();
            let log = allow.change_log(&table)?;
            QueryBuilder::select(allow.shard_table(&log, &range)?)
                .columns(
                    ["virt_shard", "key_parts", "marker", "change_type", "reason", "payload"]
                        .iter()
                        .map(|c| allow.ident(c))
                        .collect::<Result<Vec<_>, _>>()?,
                )
                .filter(Filter::Gt(allow.ident("marker")?, 1))
                .filter(Filter::Le(allow.ident("marker")?, 2))
                .order_by(allow.ident("seq")?)
                .build()
        };
        let rows = sqlx::query(&sql)
            .bind(after.map_or(i64::MIN, |m| m.value()))
            .bind(up_to.value())
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                let change_type: String = row.try_get("change_type")?;
                let shard: i16 = row.try_get("virt_shard")?;
                let key: Vec<String> = row.try_get("key_parts")?;
                let payload: Json<Payload> = row.try_get("payload")?;
                Ok(ChangeLogEntry {
                    key: RecordKey::new(key),
                    shard_id: shard as u32,
                    marker: Marker::new(row.try_get("marker")?),
                    change_type: ChangeType::from_str(&change_type)
                        .ok_or_else(|| PostgresError::Corrupt(format!("unknown change type {change_type}")))?,
                    reason: row.try_get("reason")?,
                    payload: payload.0,
                })
            })
            .collect()
    }

    async fn stage_shard(
        &self,
        run_id: RunId,
        table: &str,
        range: ShardRange,
        events: Vec<ChangeEvent>,
        at: Marker,
    ) -> Result<(), Self::Error> {
        let table_ident = self.ensure_table(table).await?;
        let (part, log) = {
            let allow = self.allow.lock();
            let log = allow.change_log(&table_ident)?;
            (allow.shard_table(&table_ident, &range)?, allow.shard_table(&log, &range)?)
        };
        let gid = prepared_gid(run_id, table, &range);

        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN").execute(&mut *conn).await?;
        for event in &events {
            if let Err(e) = Self::apply_event(&mut *conn, &part, &log, event, at).await {
                if let Err(rollback) = sqlx::query("ROLLBACK").execute(&mut *conn).await {
                    tracing::error!(error = %rollback, "Rollback after failed staging failed");
                }
                return Err(e);
            }
        }
        sqlx::query(&format!("PREPARE TRANSACTION '{gid}'"))
            .execute(&mut *conn)
            .await?;

        tracing::debug!(run_id = %run_id, table, shard = range.index, events = events.len(), "Prepared shard");
        self.prepared
            .lock()
            .record(run_id, PreparedShard { gid, counts: ChangeCounts::of(&events) });
        Ok(())
    }

    async fn commit_run(&self, run_id: RunId) -> Result<ChangeCounts, Self::Error> {
        let (_, shards, counts) = self.finish_prepared(run_id, Resolution::Commit).await?;
        tracing::info!(run_id = %run_id, shards, adds = counts.adds, removes = counts.removes, updates = counts.updates, "Committed run");
        Ok(counts)
    }

    async fn abort_run(&self, run_id: RunId) -> Result<(), Self::Error> {
        let (resolution, shards, _) = self.finish_prepared(run_id, Resolution::Rollback).await?;
        if resolution == Resolution::Commit {
            tracing::warn!(run_id = %run_id, shards, "Rolled forward partially committed run");
        } else {
            tracing::warn!(run_id = %run_id, shards, "Aborted run");
        }
        Ok(())
    }

    async fn is_healthy(&self) -> bool {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await.is_ok()
    }
}

#[async_trait]
impl RunStore for PostgresStore {
    type Lock = PgAdvisoryLock;

    async fn try_lock(&self, name: &str) -> Result<Option<Self::Lock>, Self::Error> {
        let key = lock_key(name);
        let mut conn = self.pool.acquire().await?.detach();
        let acquired: bool = sqlx::query("SELECT pg_try_advisory_lock($1)")
            .bind(key)
            .fetch_one(&mut conn)
            .await?
            .try_get(0)?;
        if !acquired {
            conn.close().await?;
            return Ok(None);
        }
        Ok(Some(PgAdvisoryLock { name: name.to_string(), key, _conn: conn }))
    }

    async fn create_run(
        &self,
        command: &str,
        fingerprint: Option<ConfigFingerprint>,
        extra: serde_json::Value,
    ) -> Result<RunMetadata, Self::Error> {
        let row = sqlx::query(
            r#"
            INSERT INTO ledger_runs (command, status, config_fingerprint, extra)
            VALUES ($1, 'running', $2, $3)
            RETURNING run_id, command, start_time, end_time, status, config_fingerprint, extra
            "#,
        )
        .bind(command)
        .bind(fingerprint.map(Json))
        .bind(extra)
        .fetch_one(&self.pool)
        .await?;
        Self::parse_run(&row)
    }

    async fn add_run_metadata(&self, run_id: RunId, extra: serde_json::Value) -> Result<(), Self::Error> {
        let result = sqlx::query("UPDATE ledger_runs SET extra = extra || $2 WHERE run_id = $1")
            .bind(run_id.value())
            .bind(extra)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(PostgresError::RunNotFound(run_id));
        }
        Ok(())
    }

    async fn finish_run(
        &self,
        run_id: RunId,
        status: RunStatus,
        error: Option<String>,
    ) -> Result<(), Self::Error> {
        let result = sqlx::query(
            r#"
            UPDATE ledger_runs
               SET status = $2,
                   end_time = now(),
                   extra = CASE WHEN $3::text IS NULL THEN extra
                                ELSE extra || jsonb_build_object('error', $3::text) END
             WHERE run_id = $1
            "#,
        )
        .bind(run_id.value())
        .bind(status.as_str())
        .bind(error)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(PostgresError::RunNotFound(run_id));
        }
        Ok(())
    }

    async fn runs(&self, command: Option<&str>, successful_only: bool) -> Result<Vec<RunMetadata>, Self::Error> {
        let rows = sqlx::query(
            r#"
            SELECT run_id, command, start_time, end_time, status, config_fingerprint, extra
              FROM ledger_runs
             WHERE ($1::text IS NULL OR command = $1)
               AND (NOT $2 OR status = 'success')
             ORDER BY run_id DESC
            "#,
        )
        .bind(command)
        .bind(successful_only)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::parse_run).collect()
    }

    async fn run(&self, run_id: RunId) -> Result<Option<RunMetadata>, Self::Error> {
        let row = sqlx::query(
            r#"
            SELECT run_id, command, start_time, end_time, status, config_fingerprint, extra
              FROM ledger_runs
             WHERE run_id = $1
            "#,
        )
        .bind(run_id.value())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::parse_run).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ddl_covers_every_partition() {
        let partitioner = ShardPartitioner::new(3).unwrap();
        let ddl = table_ddl("blacklist", partitioner.ranges());
        assert_eq!(ddl.len(), 3 + 2 * 3);
        assert!(ddl[0].starts_with("CREATE TABLE IF NOT EXISTS blacklist "));
        assert!(ddl.iter().any(|s| s.contains("blacklist_0_33 PARTITION OF blacklist FOR VALUES FROM (0) TO (34)")));
        assert!(ddl
            .iter()
            .any(|s| s.contains("blacklist_change_log_67_99 PARTITION OF blacklist_change_log FOR VALUES FROM (67) TO (100)")));
    }

    #[test]
    fn test_prepared_gid_is_unique_per_shard() {
        let partitioner = ShardPartitioner::new(2).unwrap();
        let ranges = partitioner.ranges();
        let a = prepared_gid(RunId::new(5), "blacklist", &ranges[0]);
        let b = prepared_gid(RunId::new(5), "blacklist", &ranges[1]);
        assert_eq!(a, "delta_ledger_5_blacklist_0");
        assert_ne!(a, b);
    }

    fn shard(gid: &str) -> PreparedShard {
        PreparedShard { gid: gid.to_string(), counts: ChangeCounts::default() }
    }

    #[test]
    fn test_prepared_shards_leave_one_at_a_time() {
        let run = RunId::new(3);
        let mut prepared = PreparedRuns::default();
        for gid in ["g0", "g1", "g2"] {
            prepared.record(run, shard(gid));
        }

        let (resolution, shards) = prepared.resolve(run, Resolution::Commit);
        assert_eq!(resolution, Resolution::Commit);
        assert_eq!(shards.len(), 3);

        // g0 committed, g1 failed: g1 and g2 stay tracked
        prepared.finished(run, "g0");
        assert_eq!(prepared.pending(run), vec!["g1".to_string(), "g2".to_string()]);

        prepared.finished(run, "g1");
        prepared.finished(run, "g2");
        assert!(prepared.pending(run).is_empty());
        assert!(prepared.runs.is_empty());
    }

    #[test]
    fn test_abort_after_partial_commit_rolls_forward() {
        let run = RunId::new(4);
        let mut prepared = PreparedRuns::default();
        for gid in ["g0", "g1", "g2"] {
            prepared.record(run, shard(gid));
        }
        prepared.resolve(run, Resolution::Commit);
        prepared.finished(run, "g0");

        let (resolution, shards) = prepared.resolve(run, Resolution::Rollback);
        assert_eq!(resolution, Resolution::Commit);
        let gids: Vec<_> = shards.iter().map(|s| s.gid.as_str()).collect();
        assert_eq!(gids, ["g1", "g2"]);
    }

    #[test]
    fn test_abort_before_commit_rolls_back() {
        let run = RunId::new(5);
        let mut prepared = PreparedRuns::default();
        prepared.record(run, shard("g0"));
        let (resolution, shards) = prepared.resolve(run, Resolution::Rollback);
        assert_eq!(resolution, Resolution::Rollback);
        assert_eq!(shards.len(), 1);
        assert_eq!(prepared.resolve(RunId::new(99), Resolution::Rollback).1.len(), 0);
    }

    #[test]
    fn test_recovery_resolution() {
        assert_eq!(recovery_resolution(Some("error"), true), Some(Resolution::Commit));
        assert_eq!(recovery_resolution(Some("running"), true), Some(Resolution::Commit));
        assert_eq!(recovery_resolution(Some("error"), false), Some(Resolution::Rollback));
        assert_eq!(recovery_resolution(None, false), Some(Resolution::Rollback));
        assert_eq!(recovery_resolution(Some("running"), false), None);
    }

    #[test]
    fn test_prepared_capacity_check() {
        assert!(check_prepared_capacity("8", 4).is_ok());
        assert!(check_prepared_capacity(" 4 ", 4).is_ok());
        assert!(matches!(check_prepared_capacity("0", 4), Err(PostgresError::Config(_))));
        assert!(matches!(check_prepared_capacity("lots", 4), Err(PostgresError::Config(_))));
        let err: PipelineError = PostgresError::Config("x".into()).into();
        assert!(matches!(err, PipelineError::Config(_)));
    }

    #[test]
    fn test_unfinished_error_names_pending_shards() {
        let err = PostgresError::Unfinished {
            run_id: RunId::new(7),
            verb: "COMMIT",
            pending: vec!["delta_ledger_7_blacklist_1".into()],
            source: sqlx::Error::PoolClosed,
        };
        assert!(err.to_string().contains("delta_ledger_7_blacklist_1"));
    }

    #[test]
    fn test_errors_map_to_pipeline_taxonomy() {
        let err: PipelineError = PostgresError::Ledger(LedgerError::NotOpen { key: RecordKey::single("1") }).into();
        assert!(matches!(err, PipelineError::LedgerCorruption(_)));
        let err: PipelineError = PostgresError::RunNotFound(RunId::new(1)).into();
        assert!(matches!(err, PipelineError::Store(_)));
    }
}
