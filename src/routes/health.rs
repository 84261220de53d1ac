// src/routes/health.rs
//! Liveness endpoint for the aggregation service.
//!
//! Container orchestrators and CI poll `/health` to see that the process is up
//! and serving HTTP. It is a sibling module in the `routes` directory and
//! follows the Explicit Module Boundary Pattern (EMBP): the handler stays
//! private and the gateway (`mod.rs`) merges the exported subrouter.

use axum::{routing::get, Json, Router};
use serde::Serialize;

/// JSON response body for the `/health` endpoint.
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
}

/// Handle `GET /health`.
///
/// Never touches the store or the cache, so a cache outage does not make the
/// service look dead.
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: env!("CARGO_PKG_NAME"),
    })
}

/// Create a subrouter containing the `/health` route.
///
/// Generic over the application state so it merges into the gateway router
/// regardless of the state type.
pub fn router<S>() -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    Router::new().route("/health", get(health))
}
