//! `/api/v1/predictions/*`: training, PM2.5 forecasts, prediction history and
//! feature importance.

use axum::{
    extract::{Query, State},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::AppState;
use crate::error::PipelineError;
use crate::forest::ForestParams;
use crate::models::{FeatureImportance, PredictionRecord, PredictionResult, TrainOutcome};

// ---

const MAX_TRAIN_DAYS: u32 = 365;
const MAX_ESTIMATORS: usize = 500;
const MAX_DEPTH: usize = 50;
const MAX_TOP_N: usize = 25;

pub fn router() -> Router<AppState> {
    // ---
    Router::new()
        .route("/api/v1/predictions/train", post(train))
        .route("/api/v1/predictions/pm25", get(predict_pm25))
        .route("/api/v1/predictions/history", get(history))
        .route(
            "/api/v1/predictions/model/feature-importance",
            get(feature_importance),
        )
}

fn default_days() -> u32 {
    60
}

fn default_top_n() -> usize {
    10
}

fn default_history_limit() -> u32 {
    10
}

#[derive(Debug, Deserialize)]
struct TrainRequest {
    city: String,
    #[serde(default = "default_days")]
    days: u32,
    n_estimators: Option<usize>,
    max_depth: Option<usize>,
}

impl TrainRequest {
    fn forest_params(&self) -> Result<Option<ForestParams>, PipelineError> {
        // ---
        if self.days == 0 || self.days > MAX_TRAIN_DAYS {
            return Err(PipelineError::InvalidInput(format!(
                "days must be between 1 and {MAX_TRAIN_DAYS}"
            )));
        }
        if self.n_estimators.is_none() && self.max_depth.is_none() {
            return Ok(None);
        }
        if matches!(self.n_estimators, Some(n) if n == 0 || n > MAX_ESTIMATORS) {
            return Err(PipelineError::InvalidInput(format!(
                "n_estimators must be between 1 and {MAX_ESTIMATORS}"
            )));
        }
        if matches!(self.max_depth, Some(d) if d == 0 || d > MAX_DEPTH) {
            return Err(PipelineError::InvalidInput(format!(
                "max_depth must be between 1 and {MAX_DEPTH}"
            )));
        }

        let defaults = ForestParams::default();
        Ok(Some(ForestParams {
            n_estimators: self.n_estimators.unwrap_or(defaults.n_estimators),
            max_depth: self.max_depth.or(defaults.max_depth),
            ..defaults
        }))
    }
}

/// Handle `POST /api/v1/predictions/train`.
async fn train(
    State(service): State<AppState>,
    Json(request): Json<TrainRequest>,
) -> Result<Json<TrainOutcome>, PipelineError> {
    // ---
    info!("POST /api/v1/predictions/train - {:?}", request);
    let params = request.forest_params()?;
    let outcome = service.train(&request.city, request.days, params).await?;
    Ok(Json(outcome))
}

#[derive(Debug, Deserialize)]
struct CityQuery {
    city: String,
}

/// Handle `GET /api/v1/predictions/pm25`.
async fn predict_pm25(
    State(service): State<AppState>,
    Query(query): Query<CityQuery>,
) -> Result<Json<PredictionResult>, PipelineError> {
    // ---
    info!("GET /api/v1/predictions/pm25 - city={}", query.city);
    Ok(Json(service.predict(&query.city).await?))
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    city: String,
    #[serde(default = "default_history_limit")]
    limit: u32,
}

/// Handle `GET /api/v1/predictions/history`.
async fn history(
    State(service): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<PredictionRecord>>, PipelineError> {
    // ---
    info!("GET /api/v1/predictions/history - {:?}", query);
    Ok(Json(
        service.prediction_history(&query.city, query.limit).await?,
    ))
}

#[derive(Debug, Deserialize)]
struct ImportanceQuery {
    city: String,
    #[serde(default = "default_top_n")]
    top_n: usize,
}

#[derive(Serialize)]
struct ImportanceResponse {
    city: String,
    features: Vec<FeatureImportance>,
}

/// Handle `GET /api/v1/predictions/model/feature-importance`.
async fn feature_importance(
    State(service): State<AppState>,
    Query(query): Query<ImportanceQuery>,
) -> Result<Json<ImportanceResponse>, PipelineError> {
    // ---
    info!(
        "GET /api/v1/predictions/model/feature-importance - city={} top_n={}",
        query.city, query.top_n
    );
    if query.top_n > MAX_TOP_N {
        return Err(PipelineError::InvalidInput(format!(
            "top_n must be between 1 and {MAX_TOP_N}"
        )));
    }
    let features = service.feature_importance(&query.city, query.top_n)?;
    Ok(Json(ImportanceResponse {
        city: query.city.trim().to_string(),
        features,
    }))
}
