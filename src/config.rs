//! Configuration loader for the `smartcity-forecast` service.
//!
//! All runtime settings come from environment variables (the caller loads an
//! optional `.env` first). Nothing else in the crate reads `env::var`.
//!
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};

use crate::anomaly::{AnomalyConfig, StrategyKind};
use crate::scheduler::{RetrainPolicy, SchedulePlan};
use crate::service::ServiceSettings;
use crate::trainer::TrainingConfig;

/// Parse an optional environment variable into `$ty`, with a default value.
macro_rules! parse_env {
    ($var_name:expr, $ty:ty, $default:expr) => {
        env::var($var_name)
            .ok()
            .map(|v| v.trim().parse::<$ty>())
            .transpose()
            .map_err(|e| anyhow!("Invalid {}: {}", $var_name, e))?
            .unwrap_or($default)
    };
}

/// Parse a required string environment variable.
macro_rules! require_env {
    ($var_name:expr) => {
        env::var($var_name)
            .map_err(|_| anyhow!("{} must be set in .env or environment", $var_name))?
    };
}

/// Optional string environment variable with a default value.
macro_rules! env_or {
    ($var_name:expr, $default:expr) => {
        env::var($var_name).unwrap_or_else(|_| $default.to_string())
    };
}

/// Strongly typed application configuration.
///
/// Immutable after loading.
#[derive(Debug, Clone)]
pub struct Config {
    // ---
    /// PostgreSQL connection string.
    pub db_url: String,

    /// Maximum number of database connections in the pool.
    pub db_pool_max: u32,

    pub bind_addr: SocketAddr,

    /// Directory holding one model artifact per city.
    pub model_dir: PathBuf,

    /// Cities served by the scheduled jobs.
    pub cities: Vec<String>,

    pub fetch_timeout_secs: u64,
    pub min_training_rows: u32,
    pub r2_acceptance: f64,
    pub mape_limit: f64,
    pub prediction_history_days: u32,

    pub anomaly_strategy: StrategyKind,
    pub z_threshold: f64,
    pub contamination: f64,
    /// `0` disables the scheduled anomaly sweep.
    pub anomaly_interval_secs: u64,
    pub anomaly_lookback_days: u32,

    /// `0` means retraining only happens through the API.
    pub retrain_interval_hours: u64,
    pub retrain_days: u32,
    pub train_on_startup: bool,
}

/// Load configuration from environment variables with defaults.
///
/// Required:
/// - `DATABASE_URL` – PostgreSQL connection string
///
/// Optional:
/// - `DB_POOL_MAX` – max DB connections (default: 5)
/// - `BIND_ADDR` – listen address (default: 0.0.0.0:8080)
/// - `MODEL_DIR` – artifact directory (default: models)
/// - `CITIES` – comma-separated city list (default: Paris)
/// - `FETCH_TIMEOUT_SECS` (default: 30)
/// - `MIN_TRAINING_ROWS` (default: 200)
/// - `R2_ACCEPTANCE` (default: 0.7), `MAPE_LIMIT` (default: 30)
/// - `PREDICTION_HISTORY_DAYS` (default: 9)
/// - `ANOMALY_STRATEGY` – `zscore` or `isolation_forest` (default: zscore)
/// - `Z_THRESHOLD` (default: 3.0), `CONTAMINATION` (default: 0.1)
/// - `ANOMALY_INTERVAL_SECS` (default: 1800), `ANOMALY_LOOKBACK_DAYS` (default: 7)
/// - `RETRAIN_INTERVAL_HOURS` (default: 0), `RETRAIN_DAYS` (default: 60)
/// - `TRAIN_ON_STARTUP` (default: false)
///
/// Returns an error if any required variable is missing or any value is
/// invalid.
pub fn load_from_env() -> Result<Config> {
    // ---
    let db_url = require_env!("DATABASE_URL");
    let db_pool_max = parse_env!("DB_POOL_MAX", u32, 5);
    let bind_addr = parse_env!("BIND_ADDR", SocketAddr, SocketAddr::from(([0, 0, 0, 0], 8080)));
    let model_dir = PathBuf::from(env_or!("MODEL_DIR", "models"));
    let cities = parse_cities(&env_or!("CITIES", "Paris"));

    let fetch_timeout_secs = parse_env!("FETCH_TIMEOUT_SECS", u64, 30);
    let min_training_rows = parse_env!("MIN_TRAINING_ROWS", u32, 200);
    let r2_acceptance = parse_env!("R2_ACCEPTANCE", f64, 0.7);
    let mape_limit = parse_env!("MAPE_LIMIT", f64, 30.0);
    let prediction_history_days = parse_env!("PREDICTION_HISTORY_DAYS", u32, 9);

    let anomaly_strategy = env_or!("ANOMALY_STRATEGY", "zscore")
        .parse::<StrategyKind>()
        .map_err(|e| anyhow!("Invalid ANOMALY_STRATEGY: {}", e))?;
    let z_threshold = parse_env!("Z_THRESHOLD", f64, 3.0);
    let contamination = parse_env!("CONTAMINATION", f64, 0.1);
    let anomaly_interval_secs = parse_env!("ANOMALY_INTERVAL_SECS", u64, 1800);
    let anomaly_lookback_days = parse_env!("ANOMALY_LOOKBACK_DAYS", u32, 7);

    let retrain_interval_hours = parse_env!("RETRAIN_INTERVAL_HOURS", u64, 0);
    let retrain_days = parse_env!("RETRAIN_DAYS", u32, 60);
    let train_on_startup = match env::var("TRAIN_ON_STARTUP") {
        Ok(v) => parse_bool(&v).ok_or_else(|| anyhow!("Invalid TRAIN_ON_STARTUP: {}", v))?,
        Err(_) => false,
    };

    let cfg = Config {
        db_url,
        db_pool_max,
        bind_addr,
        model_dir,
        cities,
        fetch_timeout_secs,
        min_training_rows,
        r2_acceptance,
        mape_limit,
        prediction_history_days,
        anomaly_strategy,
        z_threshold,
        contamination,
        anomaly_interval_secs,
        anomaly_lookback_days,
        retrain_interval_hours,
        retrain_days,
        train_on_startup,
    };
    cfg.validate()?;
    Ok(cfg)
}

/// Split a comma-separated city list, dropping blanks and duplicates.
pub fn parse_cities(raw: &str) -> Vec<String> {
    // ---
    let mut cities: Vec<String> = Vec::new();
    for city in raw.split(',').map(str::trim).filter(|c| !c.is_empty()) {
        if !cities.iter().any(|c| c.eq_ignore_ascii_case(city)) {
            cities.push(city.to_string());
        }
    }
    cities
}

pub fn parse_bool(raw: &str) -> Option<bool> {
    // ---
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Replace the password in a connection URL with `****`.
pub fn mask_db_url(db_url: &str) -> String {
    // ---
    if let Some(at_pos) = db_url.rfind('@') {
        if let Some(colon_pos) = db_url[..at_pos].rfind(':') {
            // A colon inside the scheme separator is not a password.
            if !db_url[colon_pos..].starts_with("://") {
                return format!("{}:****{}", &db_url[..colon_pos], &db_url[at_pos..]);
            }
        }
    }
    db_url.to_string()
}

impl Config {
    fn validate(&self) -> Result<()> {
        // ---
        if self.cities.is_empty() {
            bail!("CITIES must name at least one city");
        }
        if self.contamination.is_nan() || self.contamination <= 0.0 || self.contamination > 0.5 {
            bail!("CONTAMINATION must be in (0, 0.5], got {}", self.contamination);
        }
        if self.z_threshold.is_nan() || self.z_threshold <= 0.0 {
            bail!("Z_THRESHOLD must be positive, got {}", self.z_threshold);
        }
        if self.fetch_timeout_secs == 0 {
            bail!("FETCH_TIMEOUT_SECS must be at least 1");
        }
        if self.prediction_history_days == 0 || self.retrain_days == 0 || self.anomaly_lookback_days == 0 {
            bail!("PREDICTION_HISTORY_DAYS, RETRAIN_DAYS and ANOMALY_LOOKBACK_DAYS must be at least 1");
        }
        Ok(())
    }

    pub fn service_settings(&self) -> ServiceSettings {
        // ---
        ServiceSettings {
            cities: self.cities.clone(),
            training: TrainingConfig {
                min_rows: self.min_training_rows as usize,
                r2_acceptance: self.r2_acceptance,
                mape_limit: self.mape_limit,
                ..TrainingConfig::default()
            },
            fetch_timeout: Duration::from_secs(self.fetch_timeout_secs),
            prediction_history_days: self.prediction_history_days,
            anomaly: AnomalyConfig {
                strategy: self.anomaly_strategy,
                z_threshold: self.z_threshold,
                contamination: self.contamination,
                lookback_days: self.anomaly_lookback_days,
            },
            retrain_days: self.retrain_days,
        }
    }

    pub fn schedule_plan(&self) -> SchedulePlan {
        // ---
        SchedulePlan {
            anomaly_interval: (self.anomaly_interval_secs > 0)
                .then(|| Duration::from_secs(self.anomaly_interval_secs)),
            retrain: RetrainPolicy::from_hours(self.retrain_interval_hours),
            train_on_startup: self.train_on_startup,
        }
    }

    /// Log the loaded configuration, with the database password masked.
    pub fn log_config(&self) {
        // ---
        tracing::info!("Configuration loaded:");
        tracing::info!("  DATABASE_URL            : {}", mask_db_url(&self.db_url));
        tracing::info!("  DB_POOL_MAX             : {}", self.db_pool_max);
        tracing::info!("  BIND_ADDR               : {}", self.bind_addr);
        tracing::info!("  MODEL_DIR               : {}", self.model_dir.display());
        tracing::info!("  CITIES                  : {}", self.cities.join(", "));
        tracing::info!("  FETCH_TIMEOUT_SECS      : {}", self.fetch_timeout_secs);
        tracing::info!("  MIN_TRAINING_ROWS       : {}", self.min_training_rows);
        tracing::info!("  R2_ACCEPTANCE           : {}", self.r2_acceptance);
        tracing::info!("  MAPE_LIMIT              : {}", self.mape_limit);
        tracing::info!("  PREDICTION_HISTORY_DAYS : {}", self.prediction_history_days);
        tracing::info!("  ANOMALY_STRATEGY        : {}", self.anomaly_strategy);
        tracing::info!("  Z_THRESHOLD             : {}", self.z_threshold);
        tracing::info!("  CONTAMINATION           : {}", self.contamination);
        tracing::info!("  ANOMALY_INTERVAL_SECS   : {}", self.anomaly_interval_secs);
        tracing::info!("  ANOMALY_LOOKBACK_DAYS   : {}", self.anomaly_lookback_days);
        tracing::info!("  RETRAIN_INTERVAL_HOURS  : {}", self.retrain_interval_hours);
        tracing::info!("  RETRAIN_DAYS            : {}", self.retrain_days);
        tracing::info!("  TRAIN_ON_STARTUP        : {}", self.train_on_startup);
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_parse_cities() {
        // ---
        assert_eq!(parse_cities("Paris"), vec!["Paris"]);
        assert_eq!(
            parse_cities(" Paris, Lyon ,,paris, Marseille"),
            vec!["Paris", "Lyon", "Marseille"]
        );
        assert!(parse_cities(" , ").is_empty());
    }

    #[test]
    fn test_parse_bool() {
        // ---
        assert_eq!(parse_bool("TRUE"), Some(true));
        assert_eq!(parse_bool(" 0 "), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn test_mask_db_url() {
        // ---
        assert_eq!(
            mask_db_url("postgres://app:s3cret@db:5432/smartcity"),
            "postgres://app:****@db:5432/smartcity"
        );
        assert_eq!(
            mask_db_url("postgres://db:5432/smartcity"),
            "postgres://db:5432/smartcity"
        );
        assert_eq!(
            mask_db_url("postgres://app@db/smartcity"),
            "postgres://app@db/smartcity"
        );
    }

    fn sample_config() -> Config {
        // ---
        Config {
            db_url: "postgres://localhost/test".to_string(),
            db_pool_max: 5,
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            model_dir: PathBuf::from("models"),
            cities: vec!["Paris".to_string()],
            fetch_timeout_secs: 30,
            min_training_rows: 200,
            r2_acceptance: 0.7,
            mape_limit: 30.0,
            prediction_history_days: 9,
            anomaly_strategy: StrategyKind::ZScore,
            z_threshold: 3.0,
            contamination: 0.1,
            anomaly_interval_secs: 1800,
            anomaly_lookback_days: 7,
            retrain_interval_hours: 0,
            retrain_days: 60,
            train_on_startup: false,
        }
    }

    #[test]
    fn test_validate_rejects_bad_contamination() {
        // ---
        let mut cfg = sample_config();
        assert!(cfg.validate().is_ok());
        cfg.contamination = 0.6;
        assert!(cfg.validate().is_err());
        cfg.contamination = 0.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_derived_settings() {
        // ---
        let mut cfg = sample_config();
        let plan = cfg.schedule_plan();
        assert_eq!(plan.anomaly_interval, Some(Duration::from_secs(1800)));
        assert_eq!(plan.retrain, RetrainPolicy::Manual);

        cfg.anomaly_interval_secs = 0;
        cfg.retrain_interval_hours = 12;
        let plan = cfg.schedule_plan();
        assert_eq!(plan.anomaly_interval, None);
        assert_eq!(plan.retrain, RetrainPolicy::Every(Duration::from_secs(12 * 3600)));

        let settings = cfg.service_settings();
        assert_eq!(settings.training.min_rows, 200);
        assert_eq!(settings.training.test_fraction, 0.2);
        assert_eq!(settings.fetch_timeout, Duration::from_secs(30));
        assert_eq!(settings.anomaly.lookback_days, 7);
    }
}
