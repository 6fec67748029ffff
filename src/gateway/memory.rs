//! In-process gateway used by tests and database-less local runs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::Gateway;
use crate::error::{PipelineError, Result};
use crate::models::{AlertRecord, AnomalyFlag, Measurement, PredictionRecord};

// ---

#[derive(Debug, Default)]
pub struct MemoryGateway {
    measurements: RwLock<HashMap<String, Vec<Measurement>>>,
    predictions: RwLock<Vec<PredictionRecord>>,
    alerts: RwLock<Vec<AnomalyFlag>>,
    latency: RwLock<Option<Duration>>,
    unavailable: AtomicBool,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append readings for a city, keeping the series time-ordered.
    pub async fn insert(&self, city: &str, readings: impl IntoIterator<Item = Measurement>) {
        // ---
        let mut map = self.measurements.write().await;
        let series = map.entry(city.to_string()).or_default();
        series.extend(readings);
        series.sort_by_key(|m| m.timestamp);
    }

    pub async fn clear(&self, city: &str) {
        self.measurements.write().await.remove(city);
    }

    /// Delay every fetch, to exercise caller timeouts.
    pub async fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.write().await = latency;
    }

    /// Make every fetch fail as if the database were down.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub async fn predictions(&self) -> Vec<PredictionRecord> {
        self.predictions.read().await.clone()
    }

    pub async fn alerts(&self) -> Vec<AnomalyFlag> {
        self.alerts.read().await.clone()
    }
}

#[async_trait]
impl Gateway for MemoryGateway {
    async fn fetch_measurements(&self, city: &str, since: DateTime<Utc>) -> Result<Vec<Measurement>> {
        // ---
        let latency = *self.latency.read().await;
        if let Some(delay) = latency {
            tokio::time::sleep(delay).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(PipelineError::UpstreamFetch(
                "measurement store unavailable".to_string(),
            ));
        }

        let map = self.measurements.read().await;
        Ok(map
            .get(city)
            .map(|series| {
                series
                    .iter()
                    .filter(|m| m.timestamp >= since)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn persist_prediction(&self, record: &PredictionRecord) -> Result<()> {
        self.predictions.write().await.push(record.clone());
        Ok(())
    }

    async fn persist_alert(&self, flag: &AnomalyFlag) -> Result<()> {
        self.alerts.write().await.push(flag.clone());
        Ok(())
    }

    async fn recent_predictions(&self, city: &str, limit: u32) -> Result<Vec<PredictionRecord>> {
        // ---
        let mut rows: Vec<PredictionRecord> = self
            .predictions
            .read()
            .await
            .iter()
            .filter(|p| p.city == city)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        rows.truncate(limit as usize);
        Ok(rows)
    }

    async fn recent_alerts(
        &self,
        city: Option<&str>,
        since: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<AlertRecord>> {
        // ---
        let mut rows: Vec<AlertRecord> = self
            .alerts
            .read()
            .await
            .iter()
            .filter(|f| f.detected_at >= since && city.map_or(true, |c| f.city == c))
            .map(AlertRecord::from)
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        rows.truncate(limit as usize);
        Ok(rows)
    }
}
