//! `/api/v1/anomalies/*`: on-demand scans, alert creation, stored alerts and
//! per-city statistics.

use axum::{
    extract::{Query, State},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::AppState;
use crate::anomaly::StrategyKind;
use crate::error::PipelineError;
use crate::models::{AlertRecord, AlertSummary, AnomalyFlag, AnomalyStats};

// ---

pub fn router() -> Router<AppState> {
    // ---
    Router::new()
        .route("/api/v1/anomalies/detect", get(detect))
        .route("/api/v1/anomalies/detect-and-alert", post(detect_and_alert))
        .route("/api/v1/anomalies/recent", get(recent))
        .route("/api/v1/anomalies/stats", get(stats))
}

fn default_lookback_days() -> u32 {
    7
}

fn default_alert_lookback_days() -> u32 {
    1
}

fn default_hours() -> u32 {
    24
}

fn default_limit() -> u32 {
    50
}

#[derive(Debug, Deserialize)]
struct DetectQuery {
    city: String,
    #[serde(default = "default_lookback_days")]
    lookback_days: u32,
    strategy: Option<String>,
}

#[derive(Serialize)]
struct DetectResponse {
    city: String,
    lookback_days: u32,
    strategy: StrategyKind,
    total_anomalies: usize,
    anomalies: Vec<AnomalyFlag>,
}

/// Handle `GET /api/v1/anomalies/detect`.
async fn detect(
    State(service): State<AppState>,
    Query(query): Query<DetectQuery>,
) -> Result<Json<DetectResponse>, PipelineError> {
    // ---
    info!("GET /api/v1/anomalies/detect - {:?}", query);

    let strategy = query
        .strategy
        .as_deref()
        .filter(|s| !s.trim().is_empty())
        .map(str::parse::<StrategyKind>)
        .transpose()
        .map_err(PipelineError::InvalidInput)?;

    let anomalies = service
        .detect_anomalies(&query.city, query.lookback_days, strategy)
        .await?;

    Ok(Json(DetectResponse {
        city: query.city.trim().to_string(),
        lookback_days: query.lookback_days,
        strategy: strategy.unwrap_or(service.settings().anomaly.strategy),
        total_anomalies: anomalies.len(),
        anomalies,
    }))
}

#[derive(Debug, Deserialize)]
struct AlertScanQuery {
    city: String,
    #[serde(default = "default_alert_lookback_days")]
    lookback_days: u32,
}

/// Handle `POST /api/v1/anomalies/detect-and-alert`.
async fn detect_and_alert(
    State(service): State<AppState>,
    Query(query): Query<AlertScanQuery>,
) -> Result<Json<AlertSummary>, PipelineError> {
    // ---
    info!("POST /api/v1/anomalies/detect-and-alert - {:?}", query);
    Ok(Json(
        service
            .detect_and_alert(&query.city, query.lookback_days)
            .await?,
    ))
}

#[derive(Debug, Deserialize)]
struct RecentQuery {
    city: Option<String>,
    #[serde(default = "default_hours")]
    hours: u32,
    #[serde(default = "default_limit")]
    limit: u32,
}

/// Handle `GET /api/v1/anomalies/recent`.
async fn recent(
    State(service): State<AppState>,
    Query(query): Query<RecentQuery>,
) -> Result<Json<Vec<AlertRecord>>, PipelineError> {
    // ---
    info!("GET /api/v1/anomalies/recent - {:?}", query);
    Ok(Json(
        service
            .recent_alerts(query.city.as_deref(), query.hours, query.limit)
            .await?,
    ))
}

#[derive(Debug, Deserialize)]
struct StatsQuery {
    city: String,
    #[serde(default = "default_lookback_days")]
    days: u32,
}

/// Handle `GET /api/v1/anomalies/stats`.
async fn stats(
    State(service): State<AppState>,
    Query(query): Query<StatsQuery>,
) -> Result<Json<AnomalyStats>, PipelineError> {
    // ---
    info!("GET /api/v1/anomalies/stats - {:?}", query);
    Ok(Json(service.anomaly_stats(&query.city, query.days).await?))
}
