//! Axum routes for the delta ledger service.

use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

use crate::error::PipelineError;
use crate::query::is_valid_identifier;
use crate::store::{RunStore, StoreResultExt};
use crate::types::{Interval, Marker, Record, RecordKey, RunId, RunMetadata};
use crate::DELTA_LEDGER_SCHEMA_VERSION;

use super::middleware::record_store_query;
use super::state::ServiceState;

// ============================================================================
// Request/Response Types
// ============================================================================

/// Filters for the run listing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunsQuery {
    /// Only runs of this command.
    pub command: Option<String>,
    /// Only successful runs.
    #[serde(default)]
    pub successful_only: bool,
}

/// Run listing, most recent first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunListResponse {
    /// Matching runs.
    pub runs: Vec<RunMetadata>,
}

/// Records of a table as of a marker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsOfResponse {
    /// Table queried.
    pub table: String,
    /// Marker queried.
    pub marker: Marker,
    /// Records true at the marker, in key order.
    pub records: Vec<Record>,
}

/// Request for one key's interval history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRequest {
    /// Key fields in schema order.
    pub key: Vec<String>,
}

/// Interval history of one key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryResponse {
    /// Table queried.
    pub table: String,
    /// Intervals, oldest first.
    pub intervals: Vec<Interval>,
}

/// Service health response (detailed).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub schema_version: String,
    pub physical_shards: u32,
    pub store_connected: bool,
}

/// Simple liveness response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LivenessResponse {
    pub status: String,
}

/// Readiness response with dependency status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    pub store: bool,
    pub details: Option<String>,
}

/// Structured error response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Human-readable error message.
    pub error: String,
    /// Machine-readable error code.
    pub code: String,
    /// Additional error details (optional).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorResponse {
    /// Create a new error response with code and message.
    pub fn new(code: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code: code.into(),
            details: None,
        }
    }

    /// Add details to the error.
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

/// Error half of every handler result.
#[derive(Debug)]
pub struct ApiError(StatusCode, ErrorResponse);

impl From<PipelineError> for ApiError {
    fn from(e: PipelineError) -> Self {
        let status = match &e {
            PipelineError::InvalidIdentifier(_)
            | PipelineError::Schema(_)
            | PipelineError::Config(_)
            | PipelineError::InvalidBaseRun { .. } => StatusCode::BAD_REQUEST,
            PipelineError::LockContention { .. } => StatusCode::CONFLICT,
            PipelineError::ValidationFailure(_)
            | PipelineError::ReferentialIntegrity(_)
            | PipelineError::Conflict { .. }
            | PipelineError::ConfigContinuity { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            PipelineError::LedgerCorruption(_) | PipelineError::Store(_) | PipelineError::TaskFailed(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self(status, ErrorResponse::new(e.code(), e.to_string()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        tracing::warn!(
            code = %self.1.code,
            error = %self.1.error,
            status = self.0.as_u16(),
            "Request error"
        );
        (self.0, Json(self.1)).into_response()
    }
}

fn check_table(table: &str) -> Result<(), ApiError> {
    if is_valid_identifier(table) {
        Ok(())
    } else {
        Err(ApiError(
            StatusCode::BAD_REQUEST,
            ErrorResponse::new("INVALID_IDENTIFIER", "Invalid table name").with_details(table),
        ))
    }
}

// ============================================================================
// Route Handlers
// ============================================================================

/// List runs, most recent first.
async fn list_runs_handler<S: RunStore>(
    State(state): State<Arc<ServiceState<S>>>,
    Query(query): Query<RunsQuery>,
) -> Result<Json<RunListResponse>, ApiError> {
    let start = Instant::now();
    let result = state
        .store
        .runs(query.command.as_deref(), query.successful_only)
        .await
        .into_pipeline();
    record_store_query("runs", start.elapsed().as_millis() as u64, result.is_ok());
    Ok(Json(RunListResponse { runs: result? }))
}

/// Fetch one run.
async fn get_run_handler<S: RunStore>(
    State(state): State<Arc<ServiceState<S>>>,
    Path(run_id): Path<i64>,
) -> Result<Json<RunMetadata>, ApiError> {
    let start = Instant::now();
    let result = state.store.run(RunId::new(run_id)).await.into_pipeline();
    record_store_query("run", start.elapsed().as_millis() as u64, result.is_ok());
    result?.map(Json).ok_or_else(|| {
        ApiError(
            StatusCode::NOT_FOUND,
            ErrorResponse::new("RUN_NOT_FOUND", format!("Run not found: {run_id}")),
        )
    })
}

/// Records of a table as of a marker.
async fn as_of_handler<S: RunStore>(
    State(state): State<Arc<ServiceState<S>>>,
    Path((table, marker)): Path<(String, i64)>,
) -> Result<Json<AsOfResponse>, ApiError> {
    check_table(&table)?;
    let marker = Marker::new(marker);
    let start = Instant::now();
    let result = state.store.as_of(&table, marker).await.into_pipeline();
    record_store_query("as_of", start.elapsed().as_millis() as u64, result.is_ok());
    Ok(Json(AsOfResponse {
        records: result?,
        table,
        marker,
    }))
}

/// Interval history of one key.
async fn history_handler<S: RunStore>(
    State(state): State<Arc<ServiceState<S>>>,
    Path(table): Path<String>,
    Json(request): Json<HistoryRequest>,
) -> Result<Json<HistoryResponse>, ApiError> {
    check_table(&table)?;
    if request.key.is_empty() {
        return Err(ApiError(
            StatusCode::BAD_REQUEST,
            ErrorResponse::new("INVALID_KEY", "Key must have at least one field"),
        ));
    }
    let key = RecordKey::new(request.key);
    let start = Instant::now();
    let result = state.store.history(&table, &key).await.into_pipeline();
    record_store_query("history", start.elapsed().as_millis() as u64, result.is_ok());
    Ok(Json(HistoryResponse {
        intervals: result?,
        table,
    }))
}

/// Health check endpoint (detailed).
async fn health_handler<S: RunStore>(State(state): State<Arc<ServiceState<S>>>) -> Json<HealthResponse> {
    let connected = state.store.is_healthy().await;
    Json(HealthResponse {
        status: if connected { "healthy" } else { "degraded" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        schema_version: DELTA_LEDGER_SCHEMA_VERSION.to_string(),
        physical_shards: state.config.num_physical_shards,
        store_connected: connected,
    })
}

/// Liveness probe endpoint. Does NOT check dependencies.
async fn liveness_handler() -> Json<LivenessResponse> {
    Json(LivenessResponse {
        status: "alive".to_string(),
    })
}

/// Readiness probe endpoint. 503 while the store is unreachable.
async fn readiness_handler<S: RunStore>(
    State(state): State<Arc<ServiceState<S>>>,
) -> Result<Json<ReadinessResponse>, (StatusCode, Json<ReadinessResponse>)> {
    if state.store.is_healthy().await {
        Ok(Json(ReadinessResponse {
            ready: true,
            store: true,
            details: None,
        }))
    } else {
        Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReadinessResponse {
                ready: false,
                store: false,
                details: Some("Store connection failed".to_string()),
            }),
        ))
    }
}

// ============================================================================
// Router Construction
// ============================================================================

/// Create the Axum router for the delta ledger service.
pub fn create_router<S: RunStore>(state: ServiceState<S>) -> Router {
    let state = Arc::new(state);

    Router::new()
        // Run metadata
        .route("/api/runs", get(list_runs_handler::<S>))
        .route("/api/runs/:run_id", get(get_run_handler::<S>))
        // Ledger reads
        .route("/api/ledger/:table/as_of/:marker", get(as_of_handler::<S>))
        .route("/api/ledger/:table/history", post(history_handler::<S>))
        // Health checks
        .route("/health", get(health_handler::<S>))
        .route("/health/live", get(liveness_handler))
        .route("/health/ready", get(readiness_handler::<S>))
        .with_state(state)
}
