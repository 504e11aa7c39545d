//! Delta ledger service: run metadata and ledger reads over REST.
//!
//! Environment: `DATABASE_URL` and the `DB_*` pool settings,
//! `LEDGER_PHYSICAL_SHARDS`, `HOST` (default 0.0.0.0), `PORT` (default 8002),
//! `RUST_LOG`, and `LOG_FORMAT` (`json` or `pretty`, default json).

use std::net::SocketAddr;
use std::time::Duration;

use axum::middleware;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use delta_ledger::service::{create_router, metrics_middleware, ServiceState};
use delta_ledger::{PipelineConfig, PostgresConfig, PostgresStore};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "delta_ledger=info,tower_http=info,sqlx=warn".into());
    let registry = tracing_subscriber::registry().with(filter);
    if std::env::var("LOG_FORMAT").as_deref() == Ok("pretty") {
        registry.with(tracing_subscriber::fmt::layer()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer().json().flatten_event(true)).init();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = PipelineConfig::from_env();
    config.validate()?;

    let store = tokio::time::timeout(
        CONNECT_TIMEOUT,
        PostgresStore::new(PostgresConfig::from_env(), config.partitioner()?),
    )
    .await
    .map_err(|_| "PostgreSQL connection timed out")??;
    let pool = store.pool_stats();
    info!(pool_size = pool.size, pool_max = pool.max, "Connected to PostgreSQL");

    let app = create_router(ServiceState::new(store, config))
        .layer(middleware::from_fn(metrics_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
    let port: u16 = std::env::var("PORT").ok().and_then(|p| p.parse().ok()).unwrap_or(8002);
    let addr: SocketAddr = format!("{host}:{port}").parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!(address = %addr, version = env!("CARGO_PKG_VERSION"), "Delta ledger service listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Shutting down"),
                Err(_) => std::future::pending().await,
            }
        })
        .await?;
    Ok(())
}
