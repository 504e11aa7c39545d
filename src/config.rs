//! Pipeline configuration.
//!
//! ## Environment
//!
//! - `LEDGER_MAX_WORKERS`: worker pool size (default: 8)
//! - `LEDGER_PHYSICAL_SHARDS`: physical shards per ledger table (default: 4)
//! - `LEDGER_SAMPLE_LIMIT`: offending keys kept per check result (default: 10)
//! - `IMPORT_SIZE_VARIATION_PERCENT`: minimum kept fraction on import (default: 0.95)
//! - `IMPORT_SIZE_VARIATION_ABSOLUTE`: maximum absolute shrink, -1 disables (default: 1000)
//! - `LISTGEN_LOOKBACK_DAYS`: notification lookback window (default: 60)
//! - `LISTGEN_NOTIFY_IMSI_CHANGE`: pair on IMEI+IMSI rather than IMEI alone (default: true)
//! - `LISTGEN_AMNESTY_ENABLED`: amnesty period active (default: false)

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::shard::{ShardPartitioner, VIRTUAL_SHARD_COUNT};
use crate::validation::HistoricSizeCheck;

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// Tunables that change list-generation output and therefore take part in the run fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListgenTunables {
    /// Days of network activity considered for notifications.
    pub lookback_days: u32,
    /// Whether a new IMSI on a notified IMEI counts as a different pairing.
    pub notify_imsi_change: bool,
    /// Whether amnesty is in effect.
    pub amnesty_enabled: bool,
}

impl Default for ListgenTunables {
    fn default() -> Self {
        Self {
            lookback_days: 60,
            notify_imsi_change: true,
            amnesty_enabled: false,
        }
    }
}

/// Runtime configuration shared by both pipelines.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Worker pool size.
    pub max_workers: usize,
    /// Physical shards per ledger table.
    pub num_physical_shards: u32,
    /// Offending keys kept per check result.
    pub sample_limit: usize,
    /// Import size-variation thresholds.
    pub import_size: HistoricSizeCheck,
    /// List-generation tunables.
    pub listgen: ListgenTunables,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_workers: 8,
            num_physical_shards: 4,
            sample_limit: 10,
            import_size: HistoricSizeCheck::default(),
            listgen: ListgenTunables::default(),
        }
    }
}

impl PipelineConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            max_workers: env_or("LEDGER_MAX_WORKERS", d.max_workers),
            num_physical_shards: env_or("LEDGER_PHYSICAL_SHARDS", d.num_physical_shards),
            sample_limit: env_or("LEDGER_SAMPLE_LIMIT", d.sample_limit),
            import_size: HistoricSizeCheck {
                percent: env_or("IMPORT_SIZE_VARIATION_PERCENT", d.import_size.percent),
                absolute: env_or("IMPORT_SIZE_VARIATION_ABSOLUTE", d.import_size.absolute),
            },
            listgen: ListgenTunables {
                lookback_days: env_or("LISTGEN_LOOKBACK_DAYS", d.listgen.lookback_days),
                notify_imsi_change: env_or("LISTGEN_NOTIFY_IMSI_CHANGE", d.listgen.notify_imsi_change),
                amnesty_enabled: env_or("LISTGEN_AMNESTY_ENABLED", d.listgen.amnesty_enabled),
            },
        }
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.max_workers == 0 {
            return Err(PipelineError::Config("max_workers must be at least 1".to_string()));
        }
        if self.num_physical_shards == 0 || self.num_physical_shards > VIRTUAL_SHARD_COUNT {
            return Err(PipelineError::Config(format!(
                "num_physical_shards must be between 1 and {}",
                VIRTUAL_SHARD_COUNT
            )));
        }
        if !(0.0..=1.0).contains(&self.import_size.percent) {
            return Err(PipelineError::Config(
                "import size variation percent must be between 0 and 1".to_string(),
            ));
        }
        if self.import_size.absolute < -1 {
            return Err(PipelineError::Config(
                "import size variation absolute must be -1 or non-negative".to_string(),
            ));
        }
        Ok(())
    }

    /// Partitioner for the configured shard count.
    pub fn partitioner(&self) -> Result<ShardPartitioner, PipelineError> {
        ShardPartitioner::new(self.num_physical_shards)
    }

    /// Builder-style worker count.
    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }

    /// Builder-style shard count.
    pub fn with_physical_shards(mut self, shards: u32) -> Self {
        self.num_physical_shards = shards;
        self
    }

    /// Builder-style size thresholds.
    pub fn with_import_size(mut self, percent: f64, absolute: i64) -> Self {
        self.import_size = HistoricSizeCheck { percent, absolute };
        self
    }
}
