//! Metrics sink interface.
//!
//! The pipelines report gauges through [`MetricsSink`]; wiring them to a
//! real backend is left to the embedding application.

use parking_lot::Mutex;
use std::collections::BTreeMap;

/// Receives pipeline gauges.
pub trait MetricsSink: Send + Sync {
    /// Set a gauge.
    fn gauge(&self, key: &str, value: f64);

    /// Increment a counter by 1.
    fn increment(&self, key: &str);
}

/// Sink that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpMetrics;

impl MetricsSink for NoOpMetrics {
    fn gauge(&self, _key: &str, _value: f64) {}

    fn increment(&self, _key: &str) {}
}

/// Sink that emits every value as a tracing event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetrics;

impl MetricsSink for TracingMetrics {
    fn gauge(&self, key: &str, value: f64) {
        tracing::info!(target: "delta_ledger::metrics", metric_type = "gauge", key, value, "gauge");
    }

    fn increment(&self, key: &str) {
        tracing::info!(target: "delta_ledger::metrics", metric_type = "counter", key, "increment");
    }
}

/// In-memory metrics for testing.
#[derive(Debug, Default)]
pub struct TestMetrics {
    gauges: Mutex<BTreeMap<String, f64>>,
    counters: Mutex<BTreeMap<String, u64>>,
}

impl MetricsSink for TestMetrics {
    fn gauge(&self, key: &str, value: f64) {
        self.gauges.lock().insert(key.to_string(), value);
    }

    fn increment(&self, key: &str) {
        *self.counters.lock().entry(key.to_string()).or_insert(0) += 1;
    }
}

impl TestMetrics {
    /// Last value of a gauge.
    pub fn gauge_value(&self, key: &str) -> Option<f64> {
        self.gauges.lock().get(key).copied()
    }

    /// Value of a counter.
    pub fn count(&self, key: &str) -> u64 {
        self.counters.lock().get(key).copied().unwrap_or(0)
    }
}
