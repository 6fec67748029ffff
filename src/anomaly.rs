//! Anomaly detection over recent sensor readings.
//!
//! [`AnomalyDetector`] is the single `fit`/`detect` contract. The strategy is
//! picked from configuration through [`StrategyKind`]. Degenerate inputs
//! degrade to "no anomaly" instead of erroring, because the scheduled sweep
//! must keep running.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::isolation::{IsolationForest, IsolationParams};
use crate::models::{AnomalyFlag, Measurement, Severity};
use crate::stats;

// ---

/// Readings the Z-score scan needs before it reports anything.
pub const MIN_ZSCORE_READINGS: usize = 24;

/// Readings the isolation-forest scan needs before it reports anything.
pub const MIN_ISOLATION_READINGS: usize = 100;

/// Components of the vector handed to the detectors.
pub const ANOMALY_FEATURES: &[&str] = &["pm25", "pm10", "no2"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    ZScore,
    IsolationForest,
}

impl StrategyKind {
    pub fn method_name(self) -> &'static str {
        match self {
            StrategyKind::ZScore => "z_score",
            StrategyKind::IsolationForest => "isolation_forest",
        }
    }

    fn min_readings(self) -> usize {
        match self {
            StrategyKind::ZScore => MIN_ZSCORE_READINGS,
            StrategyKind::IsolationForest => MIN_ISOLATION_READINGS,
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.method_name())
    }
}

impl FromStr for StrategyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // ---
        match s.trim().to_ascii_lowercase().as_str() {
            "zscore" | "z_score" | "z-score" => Ok(StrategyKind::ZScore),
            "isolation_forest" | "isolation-forest" | "iforest" => {
                Ok(StrategyKind::IsolationForest)
            }
            other => Err(format!("unknown anomaly strategy '{other}'")),
        }
    }
}

/// Detector settings shared by the on-demand scan and the scheduled sweep.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnomalyConfig {
    pub strategy: StrategyKind,
    pub z_threshold: f64,
    pub contamination: f64,
    pub lookback_days: u32,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::ZScore,
            z_threshold: 3.0,
            contamination: 0.1,
            lookback_days: 7,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    pub is_anomaly: bool,
    pub score: f64,
}

impl Detection {
    const NONE: Detection = Detection {
        is_anomaly: false,
        score: 0.0,
    };
}

/// Univariate detector on the distance from a trailing mean.
#[derive(Debug, Clone)]
pub struct ZScoreDetector {
    threshold: f64,
    mean: f64,
    std: f64,
    fitted: bool,
}

impl ZScoreDetector {
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold,
            mean: 0.0,
            std: 0.0,
            fitted: false,
        }
    }

    pub fn fit(&mut self, window: &[f64]) {
        // ---
        self.mean = stats::mean(window);
        self.std = stats::std_population(window);
        self.fitted = !window.is_empty();
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    pub fn std(&self) -> f64 {
        self.std
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// `|value - mean| / std`; zero when unfitted or the window had no spread.
    pub fn z_score(&self, value: f64) -> f64 {
        // ---
        if !self.fitted || !self.std.is_finite() || self.std <= 0.0 {
            return 0.0;
        }
        let z = ((value - self.mean) / self.std).abs();
        if z.is_finite() {
            z
        } else {
            0.0
        }
    }

    pub fn detect(&self, value: f64) -> Detection {
        // ---
        let z = self.z_score(value);
        Detection {
            is_anomaly: z > self.threshold,
            score: z,
        }
    }
}

impl Default for ZScoreDetector {
    fn default() -> Self {
        Self::new(3.0)
    }
}

/// Multivariate detector backed by an [`IsolationForest`].
#[derive(Debug, Clone)]
pub struct IsolationForestDetector {
    params: IsolationParams,
    model: Option<IsolationForest>,
}

impl IsolationForestDetector {
    pub fn new(contamination: f64) -> Self {
        Self {
            params: IsolationParams {
                contamination,
                ..IsolationParams::default()
            },
            model: None,
        }
    }

    pub fn fit(&mut self, matrix: &[Vec<f64>]) {
        // ---
        self.model = match IsolationForest::fit(matrix, self.params) {
            Ok(model) => Some(model),
            Err(e) => {
                tracing::warn!("Isolation forest fit skipped: {}", e);
                None
            }
        };
    }

    pub fn offset(&self) -> f64 {
        self.model.as_ref().map_or(0.0, IsolationForest::offset)
    }

    pub fn detect(&self, vector: &[f64]) -> Detection {
        // ---
        let Some(model) = &self.model else {
            return Detection::NONE;
        };
        match model.detect(vector) {
            Ok((is_anomaly, score)) => Detection { is_anomaly, score },
            Err(e) => {
                tracing::debug!("Isolation forest detect skipped: {}", e);
                Detection::NONE
            }
        }
    }
}

/// The one detection contract, whichever strategy is configured.
#[derive(Debug, Clone)]
pub enum AnomalyDetector {
    ZScore(ZScoreDetector),
    IsolationForest(IsolationForestDetector),
}

impl AnomalyDetector {
    pub fn new(kind: StrategyKind, config: &AnomalyConfig) -> Self {
        // ---
        match kind {
            StrategyKind::ZScore => AnomalyDetector::ZScore(ZScoreDetector::new(config.z_threshold)),
            StrategyKind::IsolationForest => {
                AnomalyDetector::IsolationForest(IsolationForestDetector::new(config.contamination))
            }
        }
    }

    pub fn from_config(config: &AnomalyConfig) -> Self {
        Self::new(config.strategy, config)
    }

    pub fn kind(&self) -> StrategyKind {
        match self {
            AnomalyDetector::ZScore(_) => StrategyKind::ZScore,
            AnomalyDetector::IsolationForest(_) => StrategyKind::IsolationForest,
        }
    }

    /// Fit on a window of samples. The Z-score strategy reads only the first
    /// component (pm25) of each sample.
    pub fn fit(&mut self, window: &[Vec<f64>]) {
        // ---
        match self {
            AnomalyDetector::ZScore(d) => {
                let values: Vec<f64> = window.iter().filter_map(|s| s.first().copied()).collect();
                d.fit(&values);
            }
            AnomalyDetector::IsolationForest(d) => d.fit(window),
        }
    }

    pub fn detect(&self, sample: &[f64]) -> Detection {
        // ---
        match self {
            AnomalyDetector::ZScore(d) => sample.first().map_or(Detection::NONE, |v| d.detect(*v)),
            AnomalyDetector::IsolationForest(d) => d.detect(sample),
        }
    }

    /// Decision threshold in the same units as [`Detection::score`].
    pub fn threshold(&self) -> f64 {
        match self {
            AnomalyDetector::ZScore(d) => d.threshold(),
            AnomalyDetector::IsolationForest(d) => d.offset(),
        }
    }

    /// Baseline pm25 the reading was compared against, where one exists.
    pub fn expected(&self) -> Option<f64> {
        match self {
            AnomalyDetector::ZScore(d) => Some(d.mean()),
            AnomalyDetector::IsolationForest(_) => None,
        }
    }

    pub fn severity(&self, detection: &Detection) -> Severity {
        // ---
        match self {
            AnomalyDetector::ZScore(d) => Severity::from_z_score(detection.score, d.threshold()),
            AnomalyDetector::IsolationForest(_) => Severity::from_isolation_score(detection.score),
        }
    }
}

pub fn anomaly_vector(m: &Measurement) -> Vec<f64> {
    vec![m.pm25, m.pm10, m.no2]
}

fn flag_for(city: &str, m: &Measurement, detector: &AnomalyDetector, detection: Detection) -> AnomalyFlag {
    // ---
    AnomalyFlag {
        id: Uuid::new_v4(),
        city: city.to_string(),
        subject: m.subject().to_string(),
        method: detector.kind().method_name().to_string(),
        statistic: detection.score,
        threshold: detector.threshold(),
        is_anomaly: detection.is_anomaly,
        severity: detector.severity(&detection),
        value: m.pm25,
        expected: detector.expected(),
        observed_at: m.timestamp,
        detected_at: Utc::now(),
    }
}

/// Fit on the whole window and report every anomalous reading, newest first.
///
/// Returns nothing when the window is shorter than the strategy's minimum.
pub fn scan_window(
    city: &str,
    readings: &[Measurement],
    kind: StrategyKind,
    config: &AnomalyConfig,
) -> Vec<AnomalyFlag> {
    // ---
    if readings.len() < kind.min_readings() {
        tracing::debug!(
            "Anomaly scan for {} skipped: {} readings, {} needs {}",
            city,
            readings.len(),
            kind,
            kind.min_readings()
        );
        return Vec::new();
    }

    let samples: Vec<Vec<f64>> = readings.iter().map(anomaly_vector).collect();
    let mut detector = AnomalyDetector::new(kind, config);
    detector.fit(&samples);

    let mut flags: Vec<AnomalyFlag> = readings
        .iter()
        .zip(&samples)
        .filter_map(|(m, s)| {
            let detection = detector.detect(s);
            detection
                .is_anomaly
                .then(|| flag_for(city, m, &detector, detection))
        })
        .collect();
    flags.sort_by(|a, b| b.observed_at.cmp(&a.observed_at));
    flags
}

/// Test each sensor's latest reading against that sensor's trailing history.
///
/// Used by the scheduled sweep. Only anomalous readings produce flags.
pub fn check_latest(city: &str, readings: &[Measurement], config: &AnomalyConfig) -> Vec<AnomalyFlag> {
    // ---
    let mut by_subject: BTreeMap<&str, Vec<&Measurement>> = BTreeMap::new();
    for m in readings {
        by_subject.entry(m.subject()).or_default().push(m);
    }

    let mut flags = Vec::new();
    for (subject, mut history) in by_subject {
        history.sort_by_key(|m| m.timestamp);
        let Some(latest) = history.pop() else {
            continue;
        };
        if history.len() < config.strategy.min_readings() {
            tracing::debug!(
                "Sensor {} has {} trailing readings, skipping",
                subject,
                history.len()
            );
            continue;
        }

        let window: Vec<Vec<f64>> = history.iter().map(|m| anomaly_vector(m)).collect();
        let mut detector = AnomalyDetector::from_config(config);
        detector.fit(&window);

        let detection = detector.detect(&anomaly_vector(latest));
        if detection.is_anomaly {
            flags.push(flag_for(city, latest, &detector, detection));
        }
    }
    flags
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use chrono::{Duration, TimeZone};

    fn readings(values: &[f64], sensor: Option<&str>) -> Vec<Measurement> {
        // ---
        let start = Utc.with_ymd_and_hms(2025, 5, 1, 0, 0, 0).unwrap();
        values
            .iter()
            .enumerate()
            .map(|(i, v)| Measurement {
                timestamp: start + Duration::hours(i as i64),
                city: "Paris".to_string(),
                sensor_id: sensor.map(String::from),
                pm25: *v,
                pm10: v * 1.5,
                no2: 20.0,
                temperature: 15.0,
                humidity: 55.0,
                wind_speed: 3.0,
                pressure: 1012.0,
            })
            .collect()
    }

    #[test]
    fn test_zscore_zero_std_never_flags() {
        // ---
        let mut d = ZScoreDetector::new(3.0);
        d.fit(&[12.0; 48]);
        assert_eq!(d.std(), 0.0);

        for value in [12.0, 500.0, -100.0, f64::MAX] {
            let detection = d.detect(value);
            assert!(!detection.is_anomaly);
            assert_eq!(detection.score, 0.0);
        }
    }

    #[test]
    fn test_zscore_four_sigma_flags() {
        // ---
        // Alternating 8/12: mean 10, population std 2.
        let window: Vec<f64> = (0..100).map(|i| if i % 2 == 0 { 8.0 } else { 12.0 }).collect();
        let mut d = ZScoreDetector::new(3.0);
        d.fit(&window);
        assert!((d.mean() - 10.0).abs() < 1e-12);
        assert!((d.std() - 2.0).abs() < 1e-12);

        let detection = d.detect(10.0 + 4.0 * 2.0);
        assert!(detection.is_anomaly);
        assert!((detection.score - 4.0).abs() < 1e-9);

        let below = d.detect(10.0 - 2.0 * 2.0);
        assert!(!below.is_anomaly);
        assert!((below.score - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_zscore_unfitted_is_quiet() {
        // ---
        let d = ZScoreDetector::default();
        assert!(!d.detect(1e9).is_anomaly);

        let mut empty = ZScoreDetector::default();
        empty.fit(&[]);
        assert!(!empty.detect(1e9).is_anomaly);
    }

    #[test]
    fn test_detector_enum_dispatches_by_config() {
        // ---
        let config = AnomalyConfig {
            strategy: StrategyKind::IsolationForest,
            ..AnomalyConfig::default()
        };
        let detector = AnomalyDetector::from_config(&config);
        assert_eq!(detector.kind(), StrategyKind::IsolationForest);
        assert_eq!(detector.expected(), None);

        // Unfitted isolation forest degrades to no anomaly.
        assert_eq!(detector.detect(&[1.0, 2.0, 3.0]), Detection::NONE);

        let zs = AnomalyDetector::from_config(&AnomalyConfig::default());
        assert_eq!(zs.kind(), StrategyKind::ZScore);
        assert_eq!(zs.threshold(), 3.0);
        assert_eq!(zs.detect(&[]), Detection::NONE);
    }

    #[test]
    fn test_isolation_strategy_flags_spike() {
        // ---
        let mut values: Vec<f64> = (0..200).map(|i| 15.0 + (i % 7) as f64 * 0.5).collect();
        values[120] = 180.0;
        let flags = scan_window(
            "Paris",
            &readings(&values, None),
            StrategyKind::IsolationForest,
            &AnomalyConfig::default(),
        );
        assert!(flags.iter().any(|f| f.value == 180.0));
        assert!(flags.iter().all(|f| f.method == "isolation_forest"));
    }

    #[test]
    fn test_scan_window_zscore_newest_first() {
        // ---
        let mut values: Vec<f64> = (0..100).map(|i| 20.0 + (i % 5) as f64).collect();
        values[10] = 150.0;
        values[80] = 160.0;
        let flags = scan_window(
            "Paris",
            &readings(&values, None),
            StrategyKind::ZScore,
            &AnomalyConfig::default(),
        );
        assert_eq!(flags.len(), 2);
        assert_eq!(flags[0].value, 160.0);
        assert_eq!(flags[1].value, 150.0);
        assert!(flags[0].observed_at > flags[1].observed_at);
        assert_eq!(flags[0].subject, "Paris");
        assert!(flags[0].expected.is_some());
    }

    #[test]
    fn test_scan_window_needs_minimum_readings() {
        // ---
        let flags = scan_window(
            "Paris",
            &readings(&[1.0, 1.0, 500.0], None),
            StrategyKind::ZScore,
            &AnomalyConfig::default(),
        );
        assert!(flags.is_empty());
    }

    #[test]
    fn test_check_latest_per_sensor() {
        // ---
        let mut quiet: Vec<f64> = (0..48).map(|i| 20.0 + (i % 4) as f64).collect();
        let mut spiky = quiet.clone();
        quiet.push(21.0);
        spiky.push(95.0);

        let mut all = readings(&quiet, Some("SENSOR_001"));
        all.extend(readings(&spiky, Some("SENSOR_002")));

        let flags = check_latest("Paris", &all, &AnomalyConfig::default());
        assert_eq!(flags.len(), 1);
        assert_eq!(flags[0].subject, "SENSOR_002");
        assert_eq!(flags[0].value, 95.0);
        assert!(flags[0].is_anomaly);
        assert!(flags[0].severity.is_alertable());
    }

    #[test]
    fn test_check_latest_flat_history_is_quiet() {
        // ---
        let mut values = vec![30.0; 40];
        values.push(300.0);
        let flags = check_latest("Paris", &readings(&values, None), &AnomalyConfig::default());
        assert!(flags.is_empty());
    }

    #[test]
    fn test_strategy_parsing() {
        // ---
        assert_eq!("zscore".parse::<StrategyKind>(), Ok(StrategyKind::ZScore));
        assert_eq!(
            "Isolation_Forest".parse::<StrategyKind>(),
            Ok(StrategyKind::IsolationForest)
        );
        assert!("lof".parse::<StrategyKind>().is_err());
    }
}
