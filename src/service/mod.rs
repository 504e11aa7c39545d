//! Delta Ledger REST Service
//!
//! Exposes run metadata and temporal ledger reads over HTTP.
//!
//! ## Endpoints
//!
//! - `GET /api/runs` - List runs, optionally by command and success
//! - `GET /api/runs/:run_id` - Fetch one run
//! - `GET /api/ledger/:table/as_of/:marker` - Records true at a marker
//! - `POST /api/ledger/:table/history` - Interval history of one key
//! - `GET /health` - Detailed service health check
//! - `GET /health/live` - Liveness probe
//! - `GET /health/ready` - Readiness probe

pub mod middleware;
pub mod routes;
pub mod state;

pub use middleware::{metrics_middleware, record_store_query};
pub use routes::create_router;
pub use state::ServiceState;
