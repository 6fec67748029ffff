//! Data models shared by the forecasting pipeline, the gateway and the API.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---

/// Joined air quality + weather reading for one city at one instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Measurement {
    // ---
    pub timestamp: DateTime<Utc>,
    pub city: String,
    pub sensor_id: Option<String>,
    pub pm25: f64,
    pub pm10: f64,
    pub no2: f64,
    pub temperature: f64,
    pub humidity: f64,
    pub wind_speed: f64,
    pub pressure: f64,
}

impl Measurement {
    /// Sensor this reading belongs to, falling back to the city for
    /// readings that came from an aggregated station feed.
    pub fn subject(&self) -> &str {
        // ---
        self.sensor_id.as_deref().unwrap_or(&self.city)
    }
}

/// Held-out evaluation plus diagnostic cross-validation numbers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    // ---
    pub r2: f64,
    pub mae: f64,
    pub rmse: f64,
    /// Percent, not a fraction.
    pub mape: f64,
    pub cv_r2_mean: f64,
    pub cv_r2_std: f64,
    pub n_samples: usize,
    pub n_features: usize,
    pub test_samples: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrainStatus {
    Success,
    /// Trained and persisted, but below the acceptance thresholds.
    Warning,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrainOutcome {
    // ---
    pub status: TrainStatus,
    pub metrics: Metrics,
    pub city: String,
    pub trained_at: DateTime<Utc>,
    pub version: u32,
    pub message: String,
}

/// US EPA PM2.5 band for a concentration in µg/m³.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AqiLevel {
    pub name: &'static str,
    pub color: &'static str,
    pub description: &'static str,
}

impl AqiLevel {
    pub fn for_pm25(pm25: f64) -> Self {
        // ---
        let (name, color, description) = if pm25 <= 12.0 {
            ("Good", "green", "Air quality is satisfactory")
        } else if pm25 <= 35.4 {
            ("Moderate", "yellow", "Air quality is acceptable")
        } else if pm25 <= 55.4 {
            (
                "Unhealthy for Sensitive Groups",
                "orange",
                "Sensitive groups may experience health effects",
            )
        } else if pm25 <= 150.4 {
            (
                "Unhealthy",
                "red",
                "Everyone may begin to experience health effects",
            )
        } else if pm25 <= 250.4 {
            (
                "Very Unhealthy",
                "purple",
                "Health alert: everyone may experience serious effects",
            )
        } else {
            (
                "Hazardous",
                "maroon",
                "Health warnings of emergency conditions",
            )
        };
        AqiLevel {
            name,
            color,
            description,
        }
    }
}

/// Result of a single `predict()` call.
#[derive(Debug, Clone, Serialize)]
pub struct PredictionResult {
    // ---
    pub city: String,
    pub pollutant: String,
    pub predicted_value: f64,
    pub lower_bound: f64,
    pub upper_bound: f64,
    pub confidence_score: f64,
    pub aqi_level: AqiLevel,
    pub prediction_for: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub model_metrics: Metrics,
}

/// Row of the `predictions` table.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct PredictionRecord {
    // ---
    pub id: Uuid,
    pub city: String,
    pub pollutant: String,
    pub predicted_value: f64,
    pub confidence_score: f64,
    pub lower_bound: f64,
    pub upper_bound: f64,
    pub prediction_for: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub model_r2: f64,
    pub model_mape: f64,
}

impl From<&PredictionResult> for PredictionRecord {
    fn from(p: &PredictionResult) -> Self {
        // ---
        PredictionRecord {
            id: Uuid::new_v4(),
            city: p.city.clone(),
            pollutant: p.pollutant.clone(),
            predicted_value: p.predicted_value,
            confidence_score: p.confidence_score,
            lower_bound: p.lower_bound,
            upper_bound: p.upper_bound,
            prediction_for: p.prediction_for,
            created_at: p.created_at,
            model_r2: p.model_metrics.r2,
            model_mape: p.model_metrics.mape,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Severity of an absolute z-score relative to the detection threshold.
    pub fn from_z_score(z_abs: f64, threshold: f64) -> Self {
        // ---
        if z_abs < threshold {
            Severity::Low
        } else if z_abs < threshold * 1.5 {
            Severity::Medium
        } else if z_abs < threshold * 2.0 {
            Severity::High
        } else {
            Severity::Critical
        }
    }

    /// Severity of an isolation score; more negative is more anomalous.
    pub fn from_isolation_score(score: f64) -> Self {
        // ---
        if score > -0.1 {
            Severity::Low
        } else if score > -0.2 {
            Severity::Medium
        } else if score > -0.3 {
            Severity::High
        } else {
            Severity::Critical
        }
    }

    pub fn is_alertable(self) -> bool {
        matches!(self, Severity::High | Severity::Critical)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

/// One evaluated reading. Only anomalous flags are persisted as alerts.
#[derive(Debug, Clone, Serialize)]
pub struct AnomalyFlag {
    // ---
    pub id: Uuid,
    pub city: String,
    /// Sensor id, or the city for station-level readings.
    pub subject: String,
    pub method: String,
    /// Z-score or isolation score, depending on `method`.
    pub statistic: f64,
    pub threshold: f64,
    pub is_anomaly: bool,
    pub severity: Severity,
    pub value: f64,
    pub expected: Option<f64>,
    pub observed_at: DateTime<Utc>,
    pub detected_at: DateTime<Utc>,
}

impl AnomalyFlag {
    pub fn message(&self) -> String {
        // ---
        format!(
            "Anomaly detected on {} ({}): PM2.5 = {:.1} ug/m3, {} = {:.2}",
            self.subject, self.city, self.value, self.method, self.statistic
        )
    }
}

/// `alert_type` of alerts raised by the anomaly detectors.
pub const ANOMALY_ALERT_TYPE: &str = "anomaly_detected";

/// Row of the `alerts` table.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct AlertRecord {
    // ---
    pub id: Uuid,
    pub city: String,
    pub alert_type: String,
    pub severity: String,
    pub message: String,
    /// The [`AnomalyFlag`] that raised the alert.
    pub data: Option<serde_json::Value>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl From<&AnomalyFlag> for AlertRecord {
    fn from(flag: &AnomalyFlag) -> Self {
        // ---
        AlertRecord {
            id: flag.id,
            city: flag.city.clone(),
            alert_type: ANOMALY_ALERT_TYPE.to_string(),
            severity: flag.severity.as_str().to_string(),
            message: flag.message(),
            data: serde_json::to_value(flag).ok(),
            is_active: true,
            created_at: flag.detected_at,
        }
    }
}

/// Anomaly counts per severity band.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SeverityCounts {
    pub low: usize,
    pub medium: usize,
    pub high: usize,
    pub critical: usize,
}

impl SeverityCounts {
    pub fn tally<'a>(flags: impl IntoIterator<Item = &'a AnomalyFlag>) -> Self {
        // ---
        let mut counts = Self::default();
        for flag in flags {
            match flag.severity {
                Severity::Low => counts.low += 1,
                Severity::Medium => counts.medium += 1,
                Severity::High => counts.high += 1,
                Severity::Critical => counts.critical += 1,
            }
        }
        counts
    }
}

/// Result of an on-demand scan that stores its severe anomalies as alerts.
#[derive(Debug, Clone, Serialize)]
pub struct AlertSummary {
    pub city: String,
    pub lookback_days: u32,
    pub anomalies_detected: usize,
    pub alerts_created: usize,
}

/// Anomaly breakdown for one city over a window, across both detectors.
#[derive(Debug, Clone, Serialize)]
pub struct AnomalyStats {
    // ---
    pub city: String,
    pub days_analyzed: u32,
    pub total_anomalies: usize,
    pub severity_distribution: SeverityCounts,
    /// Anomalies per detection method, keyed by method name.
    pub method_distribution: BTreeMap<String, usize>,
    pub detected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FeatureImportance {
    pub feature: String,
    pub importance: f64,
}
