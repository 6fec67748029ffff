//! HTTP gateway.
//!
//! Each sibling module exposes a `router()`; this module merges them and
//! attaches the shared [`ForecastService`] as state, so `main.rs` never
//! needs to know individual endpoints.

use std::sync::Arc;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json, Router,
};
use serde::Serialize;

use crate::error::PipelineError;
use crate::service::ForecastService;

mod anomalies;
mod health;
mod predictions;

// ---

pub type AppState = Arc<ForecastService>;

pub fn router(service: AppState) -> Router {
    // ---
    Router::new()
        .merge(predictions::router())
        .merge(anomalies::router())
        .merge(health::router())
        .with_state(service)
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl PipelineError {
    pub fn status_code(&self) -> StatusCode {
        // ---
        match self {
            PipelineError::ModelNotFound(_) => StatusCode::NOT_FOUND,
            PipelineError::InsufficientData { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            PipelineError::TrainingInProgress(_) | PipelineError::FeatureMismatch { .. } => {
                StatusCode::CONFLICT
            }
            PipelineError::UpstreamFetch(_) => StatusCode::BAD_GATEWAY,
            PipelineError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            PipelineError::Artifact(_) | PipelineError::Model(_) | PipelineError::Task(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for PipelineError {
    fn into_response(self) -> Response {
        // ---
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!("Request failed with {}: {}", status, self);
        } else {
            tracing::warn!("Request rejected with {}: {}", status, self);
        }
        (
            status,
            Json(ErrorBody {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}
