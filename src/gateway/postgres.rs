//! PostgreSQL gateway over the tables created by `schema::create_schema`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::PgPool;

use super::Gateway;
use crate::error::Result;
use crate::models::{AlertRecord, AnomalyFlag, Measurement, PredictionRecord, ANOMALY_ALERT_TYPE};

// ---

#[derive(Debug, Clone)]
pub struct PgGateway {
    pool: PgPool,
}

impl PgGateway {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Gateway for PgGateway {
    async fn fetch_measurements(&self, city: &str, since: DateTime<Utc>) -> Result<Vec<Measurement>> {
        // ---
        // Air quality and weather arrive from separate collectors; only
        // instants present in both are usable.
        let rows = sqlx::query_as::<_, Measurement>(
            r#"
            SELECT
                aq.timestamp   AS timestamp,
                aq.city        AS city,
                aq.sensor_id   AS sensor_id,
                aq.pm25        AS pm25,
                aq.pm10        AS pm10,
                aq.no2         AS no2,
                w.temperature  AS temperature,
                w.humidity     AS humidity,
                w.wind_speed   AS wind_speed,
                w.pressure     AS pressure
            FROM air_quality_measurements aq
            JOIN weather_data w
              ON w.city = aq.city AND w.timestamp = aq.timestamp
            WHERE aq.city = $1 AND aq.timestamp >= $2
            ORDER BY aq.timestamp
            "#,
        )
        .bind(city)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn persist_prediction(&self, record: &PredictionRecord) -> Result<()> {
        // ---
        sqlx::query(
            r#"
            INSERT INTO predictions (
                id, city, pollutant, predicted_value, confidence_score,
                lower_bound, upper_bound, prediction_for, created_at,
                model_r2, model_mape
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(record.id)
        .bind(&record.city)
        .bind(&record.pollutant)
        .bind(record.predicted_value)
        .bind(record.confidence_score)
        .bind(record.lower_bound)
        .bind(record.upper_bound)
        .bind(record.prediction_for)
        .bind(record.created_at)
        .bind(record.model_r2)
        .bind(record.model_mape)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn persist_alert(&self, flag: &AnomalyFlag) -> Result<()> {
        // ---
        sqlx::query(
            r#"
            INSERT INTO alerts (
                id, city, alert_type, severity, message, data, is_active, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, TRUE, $7)
            "#,
        )
        .bind(flag.id)
        .bind(&flag.city)
        .bind(ANOMALY_ALERT_TYPE)
        .bind(flag.severity.as_str())
        .bind(flag.message())
        .bind(Json(flag))
        .bind(flag.detected_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn recent_predictions(&self, city: &str, limit: u32) -> Result<Vec<PredictionRecord>> {
        // ---
        let rows = sqlx::query_as::<_, PredictionRecord>(
            r#"
            SELECT
                id, city, pollutant, predicted_value, confidence_score,
                lower_bound, upper_bound, prediction_for, created_at,
                COALESCE(model_r2, 'NaN'::float8)   AS model_r2,
                COALESCE(model_mape, 'NaN'::float8) AS model_mape
            FROM predictions
            WHERE city = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(city)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn recent_alerts(
        &self,
        city: Option<&str>,
        since: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<AlertRecord>> {
        // ---
        let rows = sqlx::query_as::<_, AlertRecord>(
            r#"
            SELECT id, city, alert_type, severity, message, data, is_active, created_at
            FROM alerts
            WHERE alert_type = $1
              AND created_at >= $2
              AND ($3::TEXT IS NULL OR city = $3)
            ORDER BY created_at DESC
            LIMIT $4
            "#,
        )
        .bind(ANOMALY_ALERT_TYPE)
        .bind(since)
        .bind(city)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }
}
