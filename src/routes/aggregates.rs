//! Read endpoints for the dashboard views.

use axum::{
    extract::rejection::QueryRejection, extract::Query, extract::State, response::IntoResponse,
    routing::get, Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::debug;

use super::AppState;
use crate::{Scope, SensorError};

// ---

pub fn router() -> Router<AppState> {
    // ---
    Router::new()
        .route("/api/average-sensor-data", get(average))
        .route("/api/latest-sensor-data", get(latest))
        .route("/api/latest-sensor-data-by-location", get(latest_by_location))
        .route("/api/equipment-data", get(equipment_data))
}

fn default_window() -> u32 {
    24
}

#[derive(Debug, Deserialize)]
struct AverageQuery {
    #[serde(default = "default_window")]
    period: u32,
    device_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LatestQuery {
    #[serde(default = "default_window")]
    hours: u32,
    device_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LocationQuery {
    #[serde(default = "default_window")]
    hours: u32,
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    device_id: String,
    start_date: DateTime<Utc>,
    end_date: DateTime<Utc>,
}

fn bad_query(e: QueryRejection) -> SensorError {
    SensorError::InvalidInput(e.body_text())
}

async fn average(
    State(state): State<AppState>,
    query: Result<Query<AverageQuery>, QueryRejection>,
) -> Result<impl IntoResponse, SensorError> {
    // ---
    let Query(params) = query.map_err(bad_query)?;
    debug!("GET /api/average-sensor-data - {:?}", params);

    let scope = Scope::from(params.device_id);
    let rows = state.aggregator.average(params.period, &scope).await?;
    Ok(Json(rows))
}

async fn latest(
    State(state): State<AppState>,
    query: Result<Query<LatestQuery>, QueryRejection>,
) -> Result<impl IntoResponse, SensorError> {
    // ---
    let Query(params) = query.map_err(bad_query)?;
    debug!("GET /api/latest-sensor-data - {:?}", params);

    let scope = Scope::from(params.device_id);
    let rows = state.aggregator.latest(params.hours, &scope).await?;
    Ok(Json(rows))
}

async fn latest_by_location(
    State(state): State<AppState>,
    query: Result<Query<LocationQuery>, QueryRejection>,
) -> Result<impl IntoResponse, SensorError> {
    // ---
    let Query(params) = query.map_err(bad_query)?;
    debug!("GET /api/latest-sensor-data-by-location - {:?}", params);

    let rows = state.aggregator.latest_by_location(params.hours).await?;
    Ok(Json(rows))
}

async fn equipment_data(
    State(state): State<AppState>,
    query: Result<Query<HistoryQuery>, QueryRejection>,
) -> Result<impl IntoResponse, SensorError> {
    // ---
    let Query(params) = query.map_err(bad_query)?;
    debug!("GET /api/equipment-data - {:?}", params);

    let history = state
        .aggregator
        .device_history(&params.device_id, params.start_date, params.end_date)
        .await?;
    Ok(Json(history))
}
