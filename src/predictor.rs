//! Next-day PM2.5 inference from the latest committed artifact.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::artifact::ArtifactStore;
use crate::error::{PipelineError, Result};
use crate::features::{extract_features, FORECAST_HORIZON};
use crate::gateway::{fetch_with_timeout, Gateway};
use crate::models::{AqiLevel, Metrics, PredictionRecord, PredictionResult};
use crate::stats;

// ---

pub const POLLUTANT: &str = "pm25";

/// `1 - MAPE/100` clamped to `[0, 1]`; NaN maps to 0.
pub fn confidence_score(metrics: &Metrics) -> f64 {
    // ---
    let score = 1.0 - metrics.mape / 100.0;
    if score.is_nan() {
        return 0.0;
    }
    score.clamp(0.0, 1.0)
}

/// Interquartile range of the per-tree predictions, widened to contain the
/// point estimate. The lower bound never goes below zero.
pub fn prediction_interval(tree_predictions: &[f64], point: f64) -> (f64, f64) {
    // ---
    let mut sorted = tree_predictions.to_vec();
    sorted.sort_by(f64::total_cmp);
    let q25 = stats::quantile_sorted(&sorted, 0.25);
    let q75 = stats::quantile_sorted(&sorted, 0.75);
    (q25.min(point).max(0.0), q75.max(point))
}

pub struct Predictor {
    gateway: Arc<dyn Gateway>,
    store: Arc<ArtifactStore>,
    history_days: u32,
    fetch_timeout: Duration,
}

impl Predictor {
    pub fn new(
        gateway: Arc<dyn Gateway>,
        store: Arc<ArtifactStore>,
        history_days: u32,
        fetch_timeout: Duration,
    ) -> Self {
        Self {
            gateway,
            store,
            history_days,
            fetch_timeout,
        }
    }

    /// Forecast PM2.5 for `city` 24 hours ahead.
    pub async fn predict(&self, city: &str) -> Result<PredictionResult> {
        // ---
        let city = city.trim();
        let artifact = self
            .store
            .get(city)?
            .ok_or_else(|| PipelineError::ModelNotFound(city.to_string()))?;

        let since = Utc::now() - chrono::Duration::days(i64::from(self.history_days));
        let history =
            fetch_with_timeout(self.gateway.as_ref(), city, since, self.fetch_timeout).await?;

        let frame = extract_features(&history);
        frame.ensure_columns(&artifact.feature_columns)?;
        let row = frame
            .latest_row()
            .ok_or_else(|| PipelineError::InsufficientData {
                city: city.to_string(),
                rows: 0,
                required: 1,
            })?;

        let per_tree = artifact.model.tree_predictions(&row.values)?;
        let point = stats::mean(&per_tree);
        let (lower_bound, upper_bound) = prediction_interval(&per_tree, point);

        let now = Utc::now();
        let result = PredictionResult {
            city: artifact.city.clone(),
            pollutant: POLLUTANT.to_string(),
            predicted_value: point,
            lower_bound,
            upper_bound,
            confidence_score: confidence_score(&artifact.metrics),
            aqi_level: AqiLevel::for_pm25(point),
            prediction_for: now + chrono::Duration::hours(FORECAST_HORIZON as i64),
            created_at: now,
            model_metrics: artifact.metrics,
        };
        tracing::info!(
            "Predicted PM2.5 for {} at {}: {:.1} [{:.1}, {:.1}] ({})",
            result.city,
            result.prediction_for,
            result.predicted_value,
            result.lower_bound,
            result.upper_bound,
            result.aqi_level.name
        );

        if let Err(e) = self
            .gateway
            .persist_prediction(&PredictionRecord::from(&result))
            .await
        {
            tracing::warn!("Failed to store prediction for {}: {}", city, e);
        }

        Ok(result)
    }
}
