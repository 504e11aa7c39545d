//! Service middleware for metrics and request tracking.
//!
//! ## Metrics Exposed
//!
//! - `delta_ledger_requests_total` - Counter of total requests by path, method, status
//! - `delta_ledger_request_duration_seconds` - Histogram of request latency
//! - `delta_ledger_store_queries_total` - Counter of store reads by query type and outcome

use axum::{
    extract::Request,
    middleware::Next,
    response::Response,
};
use std::time::Instant;
use tracing::info;

/// Metrics middleware that records request counts and latency.
///
/// Uses tracing; counters are aggregated from logs.
pub async fn metrics_middleware(request: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = request.method().clone();
    let path = normalize_path(request.uri().path());

    let response = next.run(request).await;

    let latency = start.elapsed();
    let status = response.status().as_u16();

    info!(
        target: "delta_ledger::metrics",
        metric_type = "request",
        path = %path,
        method = %method,
        status = status,
        latency_ms = latency.as_millis() as u64,
        "request_metric"
    );

    response
}

/// Normalize path for metrics to avoid high cardinality.
///
/// Run ids and markers become `:id`.
fn normalize_path(path: &str) -> String {
    path.split('/')
        .map(|segment| {
            let digits = segment.strip_prefix('-').unwrap_or(segment);
            if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
                ":id"
            } else {
                segment
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Record store query metrics.
pub fn record_store_query(query_type: &str, latency_ms: u64, success: bool) {
    let status = if success { "success" } else { "error" };
    info!(
        target: "delta_ledger::metrics",
        metric_type = "store_query",
        query_type = query_type,
        status = status,
        latency_ms = latency_ms,
        "store_query_metric"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path_replaces_ids() {
        assert_eq!(normalize_path("/api/runs/42"), "/api/runs/:id");
        assert_eq!(
            normalize_path("/api/ledger/blacklist/as_of/-17"),
            "/api/ledger/blacklist/as_of/:id"
        );
    }

    #[test]
    fn test_normalize_path_preserves_regular_path() {
        assert_eq!(normalize_path("/health/ready"), "/health/ready");
        assert_eq!(normalize_path("/api/ledger/notifications_op1/history"), "/api/ledger/notifications_op1/history");
    }
}
