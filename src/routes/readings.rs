//! Write endpoints: single readings and JSON batches.
//!
//! The batch endpoint takes the rows a CSV upload would have produced;
//! file parsing happens upstream.

use axum::{
    extract::rejection::JsonRejection, extract::State, http::StatusCode, response::IntoResponse,
    routing::post, Json, Router,
};
use serde::Serialize;
use tracing::info;

use super::AppState;
use crate::{NewReading, SensorError};

// ---

pub fn router() -> Router<AppState> {
    // ---
    Router::new()
        .route("/api/sensor-data", post(record))
        .route("/api/sensor-data/batch", post(record_batch))
}

#[derive(Serialize)]
struct BatchResponse {
    message: &'static str,
    row_count: usize,
}

async fn record(
    State(state): State<AppState>,
    payload: Result<Json<NewReading>, JsonRejection>,
) -> Result<impl IntoResponse, SensorError> {
    // ---
    let Json(new) = payload.map_err(|e| SensorError::InvalidInput(e.body_text()))?;
    info!("POST /api/sensor-data - device {}", new.device_id);

    // Dropping the handle leaves the invalidation running detached
    let recorded = state.ingestor.record_reading(new).await?;

    Ok((StatusCode::CREATED, Json(recorded.reading)))
}

async fn record_batch(
    State(state): State<AppState>,
    payload: Result<Json<Vec<NewReading>>, JsonRejection>,
) -> Result<impl IntoResponse, SensorError> {
    // ---
    let Json(batch) = payload.map_err(|e| SensorError::InvalidInput(e.body_text()))?;
    info!("POST /api/sensor-data/batch - {} readings", batch.len());

    let outcome = state.ingestor.record_batch(batch).await?;

    Ok((
        StatusCode::CREATED,
        Json(BatchResponse {
            message: "Batch ingested successfully",
            row_count: outcome.rows,
        }),
    ))
}
