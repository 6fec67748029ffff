//! Facade the HTTP layer and the scheduler talk to.

use std::sync::Arc;
use std::time::Duration;

use std::collections::BTreeMap;

use chrono::Utc;

use crate::anomaly::{self, AnomalyConfig, StrategyKind};
use crate::artifact::ArtifactStore;
use crate::error::{PipelineError, Result};
use crate::forest::ForestParams;
use crate::gateway::{fetch_with_timeout, within, Gateway};
use crate::models::{
    AlertRecord, AlertSummary, AnomalyFlag, AnomalyStats, FeatureImportance, Measurement,
    PredictionRecord, PredictionResult, SeverityCounts, TrainOutcome,
};
use crate::predictor::Predictor;
use crate::trainer::{Trainer, TrainingConfig};

// ---

/// Longest window the on-demand anomaly scan accepts.
pub const MAX_LOOKBACK_DAYS: u32 = 30;

/// Longest window a scan that stores alerts accepts.
pub const MAX_ALERT_LOOKBACK_DAYS: u32 = 7;

pub const MAX_HISTORY_LIMIT: u32 = 100;
pub const MAX_ALERT_HOURS: u32 = 168;
pub const MAX_ALERT_LIMIT: u32 = 200;

fn check_range(name: &str, value: u32, max: u32) -> Result<()> {
    // ---
    if value == 0 || value > max {
        return Err(PipelineError::InvalidInput(format!(
            "{name} must be between 1 and {max}"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct ServiceSettings {
    // ---
    pub cities: Vec<String>,
    pub training: TrainingConfig,
    pub fetch_timeout: Duration,
    pub prediction_history_days: u32,
    pub anomaly: AnomalyConfig,
    /// History window used by scheduled retrains.
    pub retrain_days: u32,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            cities: vec!["Paris".to_string()],
            training: TrainingConfig::default(),
            fetch_timeout: Duration::from_secs(30),
            prediction_history_days: 9,
            anomaly: AnomalyConfig::default(),
            retrain_days: 60,
        }
    }
}

pub struct ForecastService {
    gateway: Arc<dyn Gateway>,
    store: Arc<ArtifactStore>,
    trainer: Trainer,
    predictor: Predictor,
    settings: ServiceSettings,
}

fn require_city(city: &str) -> Result<&str> {
    // ---
    let city = city.trim();
    if city.is_empty() {
        return Err(PipelineError::InvalidInput("city must not be empty".to_string()));
    }
    Ok(city)
}

impl ForecastService {
    pub fn new(gateway: Arc<dyn Gateway>, store: Arc<ArtifactStore>, settings: ServiceSettings) -> Self {
        // ---
        let trainer = Trainer::new(
            Arc::clone(&gateway),
            Arc::clone(&store),
            settings.training,
            settings.fetch_timeout,
        );
        let predictor = Predictor::new(
            Arc::clone(&gateway),
            Arc::clone(&store),
            settings.prediction_history_days,
            settings.fetch_timeout,
        );
        Self {
            gateway,
            store,
            trainer,
            predictor,
            settings,
        }
    }

    pub fn settings(&self) -> &ServiceSettings {
        &self.settings
    }

    pub fn has_model(&self, city: &str) -> Result<bool> {
        self.store.contains(city)
    }

    pub async fn train(&self, city: &str, days: u32, params: Option<ForestParams>) -> Result<TrainOutcome> {
        self.trainer.train(require_city(city)?, days, params).await
    }

    pub async fn predict(&self, city: &str) -> Result<PredictionResult> {
        self.predictor.predict(require_city(city)?).await
    }

    /// Newest-first predictions stored for `city`.
    pub async fn prediction_history(&self, city: &str, limit: u32) -> Result<Vec<PredictionRecord>> {
        // ---
        let city = require_city(city)?;
        check_range("limit", limit, MAX_HISTORY_LIMIT)?;
        let what = format!("predictions for {city}");
        within(
            self.settings.fetch_timeout,
            &what,
            self.gateway.recent_predictions(city, limit),
        )
        .await
    }

    /// Newest-first anomaly alerts from the last `hours`, for one city or all.
    pub async fn recent_alerts(
        &self,
        city: Option<&str>,
        hours: u32,
        limit: u32,
    ) -> Result<Vec<AlertRecord>> {
        // ---
        let city = city.map(str::trim).filter(|c| !c.is_empty());
        check_range("hours", hours, MAX_ALERT_HOURS)?;
        check_range("limit", limit, MAX_ALERT_LIMIT)?;
        let since = Utc::now() - chrono::Duration::hours(i64::from(hours));
        let what = format!("alerts for {}", city.unwrap_or("all cities"));
        within(
            self.settings.fetch_timeout,
            &what,
            self.gateway.recent_alerts(city, since, limit),
        )
        .await
    }

    async fn fetch_window(&self, city: &str, lookback_days: u32) -> Result<Vec<Measurement>> {
        // ---
        let since = Utc::now() - chrono::Duration::days(i64::from(lookback_days));
        fetch_with_timeout(self.gateway.as_ref(), city, since, self.settings.fetch_timeout).await
    }

    /// Every anomalous reading in the last `lookback_days`, newest first.
    ///
    /// `strategy` falls back to the configured one.
    pub async fn detect_anomalies(
        &self,
        city: &str,
        lookback_days: u32,
        strategy: Option<StrategyKind>,
    ) -> Result<Vec<AnomalyFlag>> {
        // ---
        let city = require_city(city)?;
        check_range("lookback_days", lookback_days, MAX_LOOKBACK_DAYS)?;
        let kind = strategy.unwrap_or(self.settings.anomaly.strategy);
        let readings = self.fetch_window(city, lookback_days).await?;

        let config = self.settings.anomaly;
        let owned_city = city.to_string();
        let flags = tokio::task::spawn_blocking(move || {
            anomaly::scan_window(&owned_city, &readings, kind, &config)
        })
        .await?;

        tracing::info!(
            "Anomaly scan for {} over {} days with {}: {} anomalies",
            city,
            lookback_days,
            kind,
            flags.len()
        );
        Ok(flags)
    }

    /// Scan the last `lookback_days` and store every high or critical
    /// anomaly as an alert.
    pub async fn detect_and_alert(&self, city: &str, lookback_days: u32) -> Result<AlertSummary> {
        // ---
        let city = require_city(city)?;
        check_range("lookback_days", lookback_days, MAX_ALERT_LOOKBACK_DAYS)?;
        let flags = self.detect_anomalies(city, lookback_days, None).await?;
        let alerts_created = self.store_alerts(&flags).await;
        Ok(AlertSummary {
            city: city.to_string(),
            lookback_days,
            anomalies_detected: flags.len(),
            alerts_created,
        })
    }

    /// Severity and method breakdown of the anomalies both detectors find
    /// in the last `days`.
    pub async fn anomaly_stats(&self, city: &str, days: u32) -> Result<AnomalyStats> {
        // ---
        let city = require_city(city)?;
        check_range("days", days, MAX_LOOKBACK_DAYS)?;
        let readings = self.fetch_window(city, days).await?;

        let config = self.settings.anomaly;
        let owned_city = city.to_string();
        let flags = tokio::task::spawn_blocking(move || {
            [StrategyKind::ZScore, StrategyKind::IsolationForest]
                .into_iter()
                .flat_map(|kind| anomaly::scan_window(&owned_city, &readings, kind, &config))
                .collect::<Vec<_>>()
        })
        .await?;

        let mut method_distribution: BTreeMap<String, usize> = [
            StrategyKind::ZScore.method_name(),
            StrategyKind::IsolationForest.method_name(),
        ]
        .into_iter()
        .map(|m| (m.to_string(), 0))
        .collect();
        for flag in &flags {
            *method_distribution.entry(flag.method.clone()).or_default() += 1;
        }

        Ok(AnomalyStats {
            city: city.to_string(),
            days_analyzed: days,
            total_anomalies: flags.len(),
            severity_distribution: SeverityCounts::tally(&flags),
            method_distribution,
            detected_at: Utc::now(),
        })
    }

    /// Persist the alertable flags; returns how many were stored.
    async fn store_alerts(&self, flags: &[AnomalyFlag]) -> usize {
        // ---
        let mut stored = 0;
        for flag in flags.iter().filter(|f| f.severity.is_alertable()) {
            match self.gateway.persist_alert(flag).await {
                Ok(()) => {
                    tracing::warn!("{}", flag.message());
                    stored += 1;
                }
                Err(e) => tracing::error!("Failed to store alert for {}: {}", flag.subject, e),
            }
        }
        stored
    }

    /// Top `top_n` features of the city's model by importance.
    pub fn feature_importance(&self, city: &str, top_n: usize) -> Result<Vec<FeatureImportance>> {
        // ---
        let city = require_city(city)?;
        if top_n == 0 {
            return Err(PipelineError::InvalidInput("top_n must be at least 1".to_string()));
        }
        let artifact = self
            .store
            .get(city)?
            .ok_or_else(|| PipelineError::ModelNotFound(city.to_string()))?;

        let mut ranked: Vec<FeatureImportance> = artifact
            .feature_columns
            .iter()
            .zip(artifact.model.feature_importances())
            .map(|(feature, importance)| FeatureImportance {
                feature: feature.clone(),
                importance: *importance,
            })
            .collect();
        ranked.sort_by(|a, b| b.importance.total_cmp(&a.importance));
        ranked.truncate(top_n);
        Ok(ranked)
    }

    /// Check each sensor's latest reading against its own trailing history
    /// and store an alert for every high or critical anomaly.
    ///
    /// Returns the number of alerts stored.
    pub async fn sweep_latest(&self, city: &str) -> Result<usize> {
        // ---
        let city = require_city(city)?;
        let config = AnomalyConfig {
            strategy: StrategyKind::ZScore,
            ..self.settings.anomaly
        };
        let readings = self.fetch_window(city, config.lookback_days).await?;

        let flags = anomaly::check_latest(city, &readings, &config);
        let stored = self.store_alerts(&flags).await;
        tracing::debug!(
            "Anomaly sweep for {}: {} anomalies, {} alerts stored",
            city,
            flags.len(),
            stored
        );
        Ok(stored)
    }

    /// Run [`Self::sweep_latest`] for every configured city. Errors are
    /// logged per city.
    pub async fn sweep_all(&self) -> usize {
        // ---
        let mut stored = 0;
        for city in &self.settings.cities {
            match self.sweep_latest(city).await {
                Ok(n) => stored += n,
                Err(e) => tracing::error!("Anomaly sweep for {} failed: {}", city, e),
            }
        }
        stored
    }

    /// Retrain every configured city. Errors are logged per city.
    pub async fn retrain_all(&self) {
        // ---
        for city in &self.settings.cities {
            match self.train(city, self.settings.retrain_days, None).await {
                Ok(outcome) => tracing::info!("Scheduled retrain for {}: {}", city, outcome.message),
                Err(e) => tracing::error!("Scheduled retrain for {} failed: {}", city, e),
            }
        }
    }

    /// Train every configured city that has no artifact yet.
    pub async fn train_missing(&self) {
        // ---
        for city in &self.settings.cities {
            match self.has_model(city) {
                Ok(true) => tracing::debug!("Model for {} already present", city),
                Ok(false) => match self.train(city, self.settings.retrain_days, None).await {
                    Ok(outcome) => tracing::info!("Startup training for {}: {}", city, outcome.message),
                    Err(e) => tracing::error!("Startup training for {} failed: {}", city, e),
                },
                Err(e) => tracing::error!("Could not check model for {}: {}", city, e),
            }
        }
    }
}
