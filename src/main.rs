//! Application entry point for the `sensorflow-aggregates` service.
//!
//! This binary wires the read-through aggregation layer together:
//! - Loading configuration from environment variables or `.env`
//! - Initializing structured logging/tracing
//! - Establishing a PostgreSQL connection pool and a Redis connection manager
//! - Creating the database schema if it does not exist
//! - Building the aggregation engine and ingestion path over the same adapters
//! - Mounting all API routes via the `routes` gateway (EMBP pattern)
//! - Binding the Axum HTTP server and serving requests
//!
//! # Environment Variables
//! - `DATABASE_URL` (**required**) – PostgreSQL connection string
//! - `REDIS_URL` (**required**) – Redis connection string
//! - `DB_POOL_MAX` (optional) – maximum number of DB connections (default: 5)
//! - `CACHE_TTL_SECS` (optional) – cached aggregate lifetime (default: 550)
//! - `BATCH_INVALIDATE` (optional) – invalidate after batch inserts (default: false)
//! - `HTTP_PORT` (optional) – listen port (default: 8080)
//! - `AXUM_LOG_LEVEL` (optional) – log verbosity (default: `debug`)
//! - `AXUM_SPAN_EVENTS` (optional) – span event mode for tracing
use std::{env, net::SocketAddr, sync::Arc};

use axum::Router;
use dotenvy::dotenv;
use is_terminal::IsTerminal;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

use anyhow::Result;

mod aggregate;
mod cache;
mod clock;
mod config;
mod error;
mod ingest;
mod models;
mod routes;
mod schema;
mod store;

#[cfg(test)]
mod testing;

// Re-exported for routes/*.rs so they only know their parent module, not the
// layout of the core modules.
pub use aggregate::{Aggregator, Scope};
pub use error::SensorError;
pub use ingest::Ingestor;
pub use models::{NewDevice, NewReading};

// ---

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    init_tracing();
    dotenv().ok();

    let cfg = config::load_from_env()?;
    cfg.log_config();

    tracing::info!("Connecting to database");

    let pool = PgPoolOptions::new()
        .max_connections(cfg.db_pool_max)
        .connect(&cfg.db_url)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to connect to database: {}", e))?;

    tracing::info!("Successfully connected to database");

    schema::create_schema(&pool).await?;

    // The cache is advisory, but the connection manager needs one successful
    // handshake to start; after that it reconnects on its own.
    let redis_cache = cache::RedisCache::connect(&cfg.redis_url)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to connect to redis: {}", e))?;

    tracing::info!("Successfully connected to redis");

    let store: Arc<dyn store::ReadingStore> = Arc::new(store::PgStore::new(pool));
    let cache: Arc<dyn cache::CacheStore> = Arc::new(redis_cache);

    let aggregator = Arc::new(Aggregator::new(store.clone(), cache).with_ttl(cfg.cache_ttl));
    let ingestor = Arc::new(
        Ingestor::new(store, aggregator.clone()).with_batch_invalidation(cfg.batch_invalidate),
    );

    // Build app from routes gateway (EMBP)
    let app: Router = routes::router(routes::AppState {
        aggregator,
        ingestor,
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.http_port));
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// ---

/// Initialize the global tracing subscriber for structured logging.
///
/// This function configures the [`tracing_subscriber`] with:
/// - Log target, file, and line number output enabled
/// - Color output controlled by TTY detection and `FORCE_COLOR` env var:
///   - `FORCE_COLOR=1|true|yes`: force colors on
///   - `FORCE_COLOR=0|false|no`: force colors off
///   - unset or other values: auto-detect TTY
/// - Span event emission mode controlled by the `AXUM_SPAN_EVENTS` env var:
///   - `"full"`       : emit ENTER, EXIT, and CLOSE events with timing
///   - `"enter_exit"` : emit ENTER and EXIT only
///   - unset or other values: emit CLOSE events only (default)
/// - Log level controlled by `RUST_LOG`, or `AXUM_LOG_LEVEL` when unset
///
/// Called once at startup before any logging macros run.
fn init_tracing() {
    // ---
    let span_events = match env::var("AXUM_SPAN_EVENTS").as_deref() {
        Ok("full") => FmtSpan::FULL,
        Ok("enter_exit") => FmtSpan::ENTER | FmtSpan::EXIT,
        _ => FmtSpan::CLOSE,
    };

    let use_color = match env::var("FORCE_COLOR").as_deref() {
        Ok("1") | Ok("true") | Ok("yes") => true,
        Ok("0") | Ok("false") | Ok("no") => false,
        _ => std::io::stdout().is_terminal(),
    };

    // Use RUST_LOG if available, otherwise fall back to AXUM_LOG_LEVEL
    let env_filter = if env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match env::var("AXUM_LOG_LEVEL").ok().as_deref() {
            Some("trace") => "trace",
            Some("debug") => "debug",
            Some("info") => "info",
            Some("warn") => "warn",
            Some("error") => "error",
            _ => "debug",
        };
        EnvFilter::new(format!("{level},sqlx::query=warn,redis=warn"))
    };

    tracing_subscriber::fmt()
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(span_events)
        .with_env_filter(env_filter)
        .with_ansi(use_color)
        .compact()
        .init();
}
