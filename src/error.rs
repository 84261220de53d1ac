//! Caller-visible error taxonomy.
//!
//! Store failures propagate to callers as `StoreUnavailable` or
//! `BatchInsertFailed`. Cache failures are a separate type
//! ([`crate::cache::CacheError`]) that never converts into `SensorError`;
//! the aggregation engine absorbs them.

use axum::{http::StatusCode, response::IntoResponse, response::Response, Json};
use serde::Serialize;
use thiserror::Error;

use crate::store::StoreError;

// ---

#[derive(Debug, Error)]
pub enum SensorError {
    // ---
    /// The durable store could not complete a read or write.
    #[error("store unavailable while {context}: {source}")]
    StoreUnavailable {
        context: String,
        #[source]
        source: StoreError,
    },

    /// An item of a batch failed; the whole batch was rolled back.
    #[error("batch insert failed at item {index} of {len}: {cause}")]
    BatchInsertFailed {
        index: usize,
        len: usize,
        #[source]
        cause: StoreError,
    },

    /// Rejected before any I/O.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} already exists")]
    Conflict(String),
}

impl SensorError {
    // ---
    pub fn store(context: impl Into<String>, source: StoreError) -> Self {
        SensorError::StoreUnavailable {
            context: context.into(),
            source,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for SensorError {
    fn into_response(self) -> Response {
        // ---
        let status = match &self {
            SensorError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            SensorError::NotFound(_) => StatusCode::NOT_FOUND,
            SensorError::Conflict(_) => StatusCode::CONFLICT,
            SensorError::StoreUnavailable { .. } | SensorError::BatchInsertFailed { .. } => {
                tracing::error!("{}", self);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        // Store internals stay in the log, not the response
        let error = match &self {
            SensorError::StoreUnavailable { .. } => "Internal server error".to_string(),
            SensorError::BatchInsertFailed { index, len, .. } => {
                format!("Batch rejected at item {} of {}; nothing stored", index, len)
            }
            other => other.to_string(),
        };

        (status, Json(ErrorBody { error })).into_response()
    }
}
