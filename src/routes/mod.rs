//! Route gateway (EMBP): each sibling module exports a subrouter and this
//! module merges them and attaches the shared state.

use std::sync::Arc;

use axum::Router;

use crate::{Aggregator, Ingestor};

mod aggregates;
mod devices;
mod health;
mod readings;

// ---

/// State shared by every handler. Both halves are built once in `main.rs`
/// over the same store and cache.
#[derive(Clone)]
pub struct AppState {
    pub aggregator: Arc<Aggregator>,
    pub ingestor: Arc<Ingestor>,
}

pub fn router(state: AppState) -> Router {
    // ---
    Router::new()
        .merge(readings::router())
        .merge(aggregates::router())
        .merge(devices::router())
        .merge(health::router())
        .with_state(state)
}
