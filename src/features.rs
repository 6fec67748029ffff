//! Feature engineering for the next-day PM2.5 forecast.
//!
//! [`extract_features`] is the single transform used both when training and
//! when predicting. The ordered column list [`FEATURE_COLUMNS`] is persisted
//! with every model artifact. Prediction refuses to run when the persisted
//! list and the current one differ, see [`FeatureFrame::ensure_columns`].
//!
//! Offsets are counted in samples, which are hourly for every source feeding
//! this pipeline.

use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};

use crate::error::{PipelineError, Result};
use crate::models::Measurement;
use crate::stats;

// ---

/// Trailing window for rolling statistics: one week of hourly samples.
pub const ROLLING_WINDOW: usize = 7 * 24;

/// Rolling statistics are defined once this many samples are in the window.
pub const ROLLING_MIN_PERIODS: usize = 24;

/// The target is pm25 this many samples after the row.
pub const FORECAST_HORIZON: usize = 24;

const LAGS: [usize; 5] = [1, 6, 12, 24, 168];

/// Ordered feature contract. Changing this list invalidates every artifact.
pub const FEATURE_COLUMNS: &[&str] = &[
    // Temporal
    "hour",
    "day_of_week",
    "is_weekend",
    "month",
    "season",
    "is_rush_hour",
    // Rolling stats
    "pm25_mean_7d",
    "pm25_std_7d",
    "pm25_min_7d",
    "pm25_max_7d",
    // Lags
    "pm25_lag_1h",
    "pm25_lag_6h",
    "pm25_lag_12h",
    "pm25_lag_24h",
    "pm25_lag_168h",
    // Rate of change
    "pm25_change_1h",
    "pm25_change_24h",
    // Weather
    "temperature",
    "humidity",
    "wind_speed",
    "pressure",
    // Co-pollutants
    "pm10",
    "no2",
    // Interactions
    "temp_humidity",
    "wind_pm25",
];

/// One row whose predictors are all defined.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureRow {
    pub timestamp: DateTime<Utc>,
    pub values: Vec<f64>,
    /// pm25 [`FORECAST_HORIZON`] samples later; `None` at the tail.
    pub target: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct FeatureFrame {
    columns: Vec<String>,
    rows: Vec<FeatureRow>,
}

impl FeatureFrame {
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[FeatureRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Feature matrix and target vector over rows with a defined target,
    /// in time order.
    pub fn training_set(&self) -> (Vec<Vec<f64>>, Vec<f64>) {
        // ---
        self.rows
            .iter()
            .filter_map(|r| r.target.map(|t| (r.values.clone(), t)))
            .unzip()
    }

    /// Most recent row with defined predictors, used for live inference.
    pub fn latest_row(&self) -> Option<&FeatureRow> {
        self.rows.last()
    }

    /// Fail unless `expected` matches this frame's columns exactly, order
    /// included.
    pub fn ensure_columns(&self, expected: &[String]) -> Result<()> {
        // ---
        if expected == self.columns.as_slice() {
            return Ok(());
        }
        Err(PipelineError::FeatureMismatch {
            expected: expected.to_vec(),
            actual: self.columns.clone(),
        })
    }
}

/// Ordered feature-column names as owned strings.
pub fn feature_columns() -> Vec<String> {
    FEATURE_COLUMNS.iter().map(|c| c.to_string()).collect()
}

/// Build the feature frame for one city's history.
///
/// Head rows without a full set of lags and rolling statistics are dropped.
/// Tail rows are kept with `target = None`, so the same frame serves
/// training via [`FeatureFrame::training_set`] and inference via
/// [`FeatureFrame::latest_row`].
pub fn extract_features(series: &[Measurement]) -> FeatureFrame {
    // ---
    let mut ordered: Vec<&Measurement> = series.iter().collect();
    ordered.sort_by_key(|m| m.timestamp);

    let pm25: Vec<f64> = ordered.iter().map(|m| m.pm25).collect();
    let mut rows = Vec::with_capacity(ordered.len().saturating_sub(LAGS[4]));

    for (i, m) in ordered.iter().enumerate() {
        let Some(rolling) = rolling_stats(&pm25, i) else {
            continue;
        };
        let Some(lags) = lag_values(&pm25, i) else {
            continue;
        };
        let (lag_1h, lag_24h) = (lags[0], lags[3]);

        let mut values = temporal_features(m.timestamp).to_vec();
        values.extend_from_slice(&rolling);
        values.extend_from_slice(&lags);
        values.extend_from_slice(&[m.pm25 - lag_1h, m.pm25 - lag_24h]);
        values.extend_from_slice(&[m.temperature, m.humidity, m.wind_speed, m.pressure]);
        values.extend_from_slice(&[m.pm10, m.no2]);
        values.extend_from_slice(&[m.temperature * m.humidity, m.wind_speed * m.pm25]);
        debug_assert_eq!(values.len(), FEATURE_COLUMNS.len());

        rows.push(FeatureRow {
            timestamp: m.timestamp,
            values,
            target: pm25.get(i + FORECAST_HORIZON).copied(),
        });
    }

    tracing::debug!(
        "Feature extraction: {} input rows, {} rows with defined predictors",
        series.len(),
        rows.len()
    );

    FeatureFrame {
        columns: feature_columns(),
        rows,
    }
}

/// hour, day_of_week, is_weekend, month, season, is_rush_hour.
fn temporal_features(ts: DateTime<Utc>) -> [f64; 6] {
    // ---
    let weekday = ts.weekday();
    let is_weekend = matches!(weekday, Weekday::Sat | Weekday::Sun);
    let hour = ts.hour();
    let is_rush_hour = !is_weekend && matches!(hour, 7..=9 | 17..=19);

    [
        hour as f64,
        weekday.num_days_from_monday() as f64,
        f64::from(u8::from(is_weekend)),
        ts.month() as f64,
        season(ts.month()) as f64,
        f64::from(u8::from(is_rush_hour)),
    ]
}

/// Northern hemisphere: 0 winter, 1 spring, 2 summer, 3 autumn.
fn season(month: u32) -> u8 {
    // ---
    match month {
        12 | 1 | 2 => 0,
        3..=5 => 1,
        6..=8 => 2,
        _ => 3,
    }
}

/// mean, std, min, max over the trailing window ending at `i`.
fn rolling_stats(pm25: &[f64], i: usize) -> Option<[f64; 4]> {
    // ---
    let start = (i + 1).saturating_sub(ROLLING_WINDOW);
    let window = &pm25[start..=i];
    if window.len() < ROLLING_MIN_PERIODS {
        return None;
    }
    let std = stats::std_sample(window)?;
    let min = window.iter().copied().fold(f64::INFINITY, f64::min);
    let max = window.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    Some([stats::mean(window), std, min, max])
}

fn lag_values(pm25: &[f64], i: usize) -> Option<[f64; 5]> {
    // ---
    let mut out = [0.0; 5];
    for (slot, lag) in out.iter_mut().zip(LAGS) {
        *slot = pm25[i.checked_sub(lag)?];
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::testutil::synthetic_series;
    use chrono::{Duration, TimeZone};

    fn col(name: &str) -> usize {
        FEATURE_COLUMNS.iter().position(|c| *c == name).unwrap()
    }

    fn ramp_series(hours: usize) -> Vec<Measurement> {
        // ---
        let start = Utc.with_ymd_and_hms(2025, 1, 6, 0, 0, 0).unwrap();
        (0..hours)
            .map(|h| Measurement {
                timestamp: start + Duration::hours(h as i64),
                city: "Paris".to_string(),
                sensor_id: None,
                pm25: h as f64,
                pm10: 2.0 * h as f64,
                no2: 10.0,
                temperature: 10.0,
                humidity: 50.0,
                wind_speed: 2.0,
                pressure: 1013.0,
            })
            .collect()
    }

    #[test]
    fn test_column_order_is_stable() {
        // ---
        let series = synthetic_series("Paris", Utc::now(), 400, 7);
        let a = extract_features(&series);
        let b = extract_features(&series);
        assert_eq!(a.columns(), b.columns());
        assert_eq!(a.columns(), feature_columns().as_slice());
        assert_eq!(a.columns().len(), FEATURE_COLUMNS.len());
        for row in a.rows() {
            assert_eq!(row.values.len(), a.columns().len());
        }
    }

    #[test]
    fn test_head_rows_dropped_and_tail_targets_undefined() {
        // ---
        let frame = extract_features(&ramp_series(300));

        // The 168h lag defines the first usable row.
        assert_eq!(frame.len(), 300 - 168);
        assert_eq!(frame.rows()[0].values[col("pm25_lag_168h")], 0.0);

        let (x, y) = frame.training_set();
        assert_eq!(x.len(), 300 - 168 - FORECAST_HORIZON);
        assert_eq!(x.len(), y.len());

        let latest = frame.latest_row().unwrap();
        assert_eq!(latest.target, None);
        assert_eq!(latest.values[col("pm25_lag_1h")], 298.0);
    }

    #[test]
    fn test_lags_targets_and_changes() {
        // ---
        let frame = extract_features(&ramp_series(300));
        let row = &frame.rows()[10];
        // pm25 equals the sample index in the ramp series.
        let idx = 168.0 + 10.0;

        assert_eq!(row.target, Some(idx + 24.0));
        assert_eq!(row.values[col("pm25_lag_1h")], idx - 1.0);
        assert_eq!(row.values[col("pm25_lag_6h")], idx - 6.0);
        assert_eq!(row.values[col("pm25_lag_12h")], idx - 12.0);
        assert_eq!(row.values[col("pm25_lag_24h")], idx - 24.0);
        assert_eq!(row.values[col("pm25_change_1h")], 1.0);
        assert_eq!(row.values[col("pm25_change_24h")], 24.0);
        assert_eq!(row.values[col("wind_pm25")], 2.0 * idx);
        assert_eq!(row.values[col("temp_humidity")], 500.0);
    }

    #[test]
    fn test_rolling_window_is_trailing() {
        // ---
        let frame = extract_features(&ramp_series(400));
        let row = frame.rows().last().unwrap();
        // Window covers samples 232..=399.
        assert_eq!(row.values[col("pm25_min_7d")], 232.0);
        assert_eq!(row.values[col("pm25_max_7d")], 399.0);
        assert!((row.values[col("pm25_mean_7d")] - 315.5).abs() < 1e-9);
    }

    #[test]
    fn test_rolling_min_periods() {
        // ---
        let pm25: Vec<f64> = (0..30).map(|v| v as f64).collect();
        assert!(rolling_stats(&pm25, 22).is_none());
        let stats = rolling_stats(&pm25, 23).unwrap();
        assert_eq!(stats[2], 0.0);
        assert_eq!(stats[3], 23.0);
    }

    #[test]
    fn test_temporal_encodings() {
        // ---
        // Monday 2025-01-06 08:00 UTC
        let monday_rush = temporal_features(Utc.with_ymd_and_hms(2025, 1, 6, 8, 0, 0).unwrap());
        assert_eq!(monday_rush, [8.0, 0.0, 0.0, 1.0, 0.0, 1.0]);

        // Saturday 2025-07-12 18:00 UTC, rush hour does not apply on weekends
        let saturday = temporal_features(Utc.with_ymd_and_hms(2025, 7, 12, 18, 0, 0).unwrap());
        assert_eq!(saturday, [18.0, 5.0, 1.0, 7.0, 2.0, 0.0]);

        assert_eq!(season(4), 1);
        assert_eq!(season(10), 3);
        assert_eq!(season(12), 0);
    }

    #[test]
    fn test_unsorted_input_is_ordered() {
        // ---
        let mut series = ramp_series(250);
        series.reverse();
        let frame = extract_features(&series);
        assert_eq!(frame.len(), 250 - 168);
        assert!(frame
            .rows()
            .windows(2)
            .all(|w| w[0].timestamp < w[1].timestamp));
    }

    #[test]
    fn test_ensure_columns_detects_reordering() {
        // ---
        let frame = extract_features(&ramp_series(200));
        assert!(frame.ensure_columns(&feature_columns()).is_ok());

        let mut swapped = feature_columns();
        swapped.swap(0, 1);
        assert!(matches!(
            frame.ensure_columns(&swapped),
            Err(PipelineError::FeatureMismatch { .. })
        ));

        let mut dropped = feature_columns();
        dropped.pop();
        assert!(frame.ensure_columns(&dropped).is_err());
    }

    #[test]
    fn test_short_series_yields_empty_frame() {
        // ---
        let frame = extract_features(&ramp_series(100));
        assert!(frame.is_empty());
        assert!(frame.latest_row().is_none());
    }
}
