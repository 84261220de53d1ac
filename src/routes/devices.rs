//! Device registry endpoints.

use axum::{
    extract::rejection::JsonRejection, extract::State, http::StatusCode, response::IntoResponse,
    routing::get, Json, Router,
};
use tracing::info;

use super::AppState;
use crate::{NewDevice, SensorError};

// ---

pub fn router() -> Router<AppState> {
    // ---
    Router::new().route("/api/iot-devices", get(list).post(register))
}

async fn register(
    State(state): State<AppState>,
    payload: Result<Json<NewDevice>, JsonRejection>,
) -> Result<impl IntoResponse, SensorError> {
    // ---
    let Json(new) = payload.map_err(|e| SensorError::InvalidInput(e.body_text()))?;
    info!("POST /api/iot-devices - device {}", new.device_id);

    let device = state.ingestor.register_device(new).await?;
    Ok((StatusCode::CREATED, Json(device)))
}

async fn list(State(state): State<AppState>) -> Result<impl IntoResponse, SensorError> {
    // ---
    let devices = state.aggregator.devices().await?;
    Ok(Json(devices))
}
