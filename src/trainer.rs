//! PM2.5 model training.
//!
//! One run fetches history, builds features, fits the forest on the earliest
//! 80% of rows, scores it on the latest 20%, and commits a new artifact. CPU
//! work runs on the blocking pool so request handlers keep serving.

use std::collections::HashSet;
use std::ops::Range;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;

use crate::artifact::{ArtifactStore, ModelArtifact};
use crate::error::{PipelineError, Result};
use crate::features::extract_features;
use crate::forest::{ForestParams, RandomForest};
use crate::gateway::{fetch_with_timeout, Gateway};
use crate::models::{Measurement, Metrics, TrainOutcome, TrainStatus};
use crate::stats;

// ---

/// Forests grown for cross-validation are diagnostic only and capped at this
/// many trees.
const CV_MAX_TREES: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainingConfig {
    pub min_rows: usize,
    pub test_fraction: f64,
    pub cv_folds: usize,
    pub r2_acceptance: f64,
    /// Percent.
    pub mape_limit: f64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            min_rows: 200,
            test_fraction: 0.2,
            cv_folds: 5,
            r2_acceptance: 0.7,
            mape_limit: 30.0,
        }
    }
}

/// Index of the first test row when holding out the latest `test_fraction`
/// of `n` time-ordered rows.
pub fn temporal_split(n: usize, test_fraction: f64) -> usize {
    // ---
    let n_test = (n as f64 * test_fraction.clamp(0.0, 1.0)).ceil() as usize;
    n.saturating_sub(n_test.max(1))
}

/// Rolling-origin folds over `n` time-ordered rows.
///
/// Fold `i` trains on everything before its test block, so every test block
/// strictly follows its training rows. Returns no folds when `n` is too short
/// to give each block at least one row.
pub fn rolling_origin_folds(n: usize, folds: usize) -> Vec<(Range<usize>, Range<usize>)> {
    // ---
    if folds == 0 {
        return Vec::new();
    }
    let test_size = n / (folds + 1);
    if test_size == 0 {
        return Vec::new();
    }
    let first_test = n - folds * test_size;
    (0..folds)
        .map(|i| {
            let start = first_test + i * test_size;
            (0..start, start..start + test_size)
        })
        .collect()
}

/// Fit on the training split and score on the held-out split.
///
/// Rows must already be in time order.
pub fn fit_and_evaluate(
    x: &[Vec<f64>],
    y: &[f64],
    params: ForestParams,
    config: &TrainingConfig,
) -> Result<(RandomForest, Metrics)> {
    // ---
    let split = temporal_split(x.len(), config.test_fraction);
    if split == 0 {
        return Err(PipelineError::InvalidInput(format!(
            "{} rows cannot be split into train and test sets",
            x.len()
        )));
    }
    let (x_train, x_test) = x.split_at(split);
    let (y_train, y_test) = y.split_at(split);
    tracing::debug!(
        "Training set: {}, test set: {}",
        x_train.len(),
        x_test.len()
    );

    let forest = RandomForest::fit(x_train, y_train, params)?;
    let predicted = forest.predict_batch(x_test)?;
    let scores = stats::regression_scores(&predicted, y_test);

    let (cv_r2_mean, cv_r2_std) = cross_validate(x_train, y_train, params, config.cv_folds)?;

    Ok((
        forest,
        Metrics {
            r2: scores.r2,
            mae: scores.mae,
            rmse: scores.rmse,
            mape: scores.mape,
            cv_r2_mean,
            cv_r2_std,
            n_samples: x.len(),
            n_features: x.first().map_or(0, Vec::len),
            test_samples: x_test.len(),
        },
    ))
}

fn cross_validate(
    x: &[Vec<f64>],
    y: &[f64],
    params: ForestParams,
    folds: usize,
) -> Result<(f64, f64)> {
    // ---
    let cv_params = ForestParams {
        n_estimators: params.n_estimators.min(CV_MAX_TREES),
        ..params
    };

    let mut scores = Vec::with_capacity(folds);
    for (train, test) in rolling_origin_folds(x.len(), folds) {
        let forest = RandomForest::fit(&x[train.clone()], &y[train], cv_params)?;
        let predicted = forest.predict_batch(&x[test.clone()])?;
        scores.push(stats::regression_scores(&predicted, &y[test]).r2);
    }
    if scores.is_empty() {
        tracing::warn!("Too few rows for cross-validation, skipping");
        return Ok((0.0, 0.0));
    }
    Ok((stats::mean(&scores), stats::std_population(&scores)))
}

pub fn status_for(metrics: &Metrics, config: &TrainingConfig) -> TrainStatus {
    // ---
    if metrics.r2 >= config.r2_acceptance && metrics.mape <= config.mape_limit {
        TrainStatus::Success
    } else {
        TrainStatus::Warning
    }
}

fn status_message(status: TrainStatus, metrics: &Metrics) -> String {
    // ---
    match status {
        TrainStatus::Success => format!(
            "Model trained successfully! R² = {:.4}, MAPE = {:.2}%",
            metrics.r2, metrics.mape
        ),
        TrainStatus::Warning => format!(
            "Model trained but below target (R² = {:.4}, MAPE = {:.2}%). Consider collecting more data.",
            metrics.r2, metrics.mape
        ),
    }
}

/// Cities with a training run in flight.
#[derive(Debug, Clone, Default)]
pub struct TrainingLocks {
    active: Arc<Mutex<HashSet<String>>>,
}

/// Releases its city when dropped, on every exit path.
#[derive(Debug)]
pub struct TrainingGuard {
    active: Arc<Mutex<HashSet<String>>>,
    key: String,
}

impl TrainingLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `city`, or fail with [`PipelineError::TrainingInProgress`].
    pub fn acquire(&self, city: &str) -> Result<TrainingGuard> {
        // ---
        let key = city.trim().to_lowercase();
        let mut active = self
            .active
            .lock()
            .map_err(|_| PipelineError::Task("training lock poisoned".to_string()))?;
        if !active.insert(key.clone()) {
            return Err(PipelineError::TrainingInProgress(city.to_string()));
        }
        Ok(TrainingGuard {
            active: Arc::clone(&self.active),
            key,
        })
    }

    pub fn is_training(&self, city: &str) -> bool {
        self.active
            .lock()
            .map(|a| a.contains(&city.trim().to_lowercase()))
            .unwrap_or(false)
    }
}

impl Drop for TrainingGuard {
    fn drop(&mut self) {
        if let Ok(mut active) = self.active.lock() {
            active.remove(&self.key);
        }
    }
}

pub struct Trainer {
    gateway: Arc<dyn Gateway>,
    store: Arc<ArtifactStore>,
    locks: TrainingLocks,
    config: TrainingConfig,
    fetch_timeout: Duration,
}

impl Trainer {
    pub fn new(
        gateway: Arc<dyn Gateway>,
        store: Arc<ArtifactStore>,
        config: TrainingConfig,
        fetch_timeout: Duration,
    ) -> Self {
        Self {
            gateway,
            store,
            locks: TrainingLocks::new(),
            config,
            fetch_timeout,
        }
    }

    pub fn locks(&self) -> &TrainingLocks {
        &self.locks
    }

    /// Train and commit a model for `city` on the last `days` days.
    ///
    /// Nothing is written unless the run gets through evaluation.
    pub async fn train(
        &self,
        city: &str,
        days: u32,
        params: Option<ForestParams>,
    ) -> Result<TrainOutcome> {
        // ---
        let city = city.trim();
        if city.is_empty() {
            return Err(PipelineError::InvalidInput("city must not be empty".to_string()));
        }
        if days == 0 {
            return Err(PipelineError::InvalidInput("days must be at least 1".to_string()));
        }
        let params = params.unwrap_or_default();
        if params.n_estimators == 0 || params.max_depth == Some(0) {
            return Err(PipelineError::InvalidInput(
                "n_estimators and max_depth must be at least 1".to_string(),
            ));
        }

        let guard = self.locks.acquire(city)?;

        tracing::info!("Training {} on {} days of history", city, days);
        let since = Utc::now() - chrono::Duration::days(i64::from(days));
        let history =
            fetch_with_timeout(self.gateway.as_ref(), city, since, self.fetch_timeout).await?;
        tracing::info!("Fetched {} raw records for {}", history.len(), city);

        let store = Arc::clone(&self.store);
        let config = self.config;
        let owned_city = city.to_string();
        // The blocking fit outlives a dropped caller, so it owns the claim
        // and releases it only after the commit.
        let artifact = tokio::task::spawn_blocking(move || {
            let _guard = guard;
            build_artifact(&store, &owned_city, &history, params, &config)
        })
        .await??;

        let status = status_for(&artifact.metrics, &self.config);
        let m = &artifact.metrics;
        tracing::info!(
            "Model for {} v{}: R2 {:.4}, MAE {:.2}, RMSE {:.2}, MAPE {:.2}%, CV R2 {:.4} +/- {:.4}",
            city,
            artifact.version,
            m.r2,
            m.mae,
            m.rmse,
            m.mape,
            m.cv_r2_mean,
            m.cv_r2_std
        );
        if status == TrainStatus::Warning {
            tracing::warn!(
                "Model for {} is below target (R2 >= {}, MAPE <= {}%)",
                city,
                self.config.r2_acceptance,
                self.config.mape_limit
            );
        }

        Ok(TrainOutcome {
            status,
            metrics: artifact.metrics,
            city: artifact.city.clone(),
            trained_at: artifact.trained_at,
            version: artifact.version,
            message: status_message(status, &artifact.metrics),
        })
    }
}

fn build_artifact(
    store: &ArtifactStore,
    city: &str,
    history: &[Measurement],
    params: ForestParams,
    config: &TrainingConfig,
) -> Result<Arc<ModelArtifact>> {
    // ---
    let frame = extract_features(history);
    let (x, y) = frame.training_set();
    if x.len() < config.min_rows {
        tracing::warn!(
            "Not enough data to train {}: {} usable rows, need {}",
            city,
            x.len(),
            config.min_rows
        );
        return Err(PipelineError::InsufficientData {
            city: city.to_string(),
            rows: x.len(),
            required: config.min_rows,
        });
    }

    let (model, metrics) = fit_and_evaluate(&x, &y, params, config)?;
    store.commit(ModelArtifact {
        city: city.to_string(),
        version: store.next_version(city)?,
        trained_at: Utc::now(),
        feature_columns: frame.columns().to_vec(),
        metrics,
        params,
        model,
    })
}
