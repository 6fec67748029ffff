//! Database schema management for `smartcity-forecast`.
//!
//! Ensures the measurement, prediction and alert tables exist before serving
//! requests. Applied once on startup from `main.rs`.

use anyhow::Result;
use sqlx::PgPool;

// ---

/// Create or update the database schema (idempotent).
///
/// `air_quality_measurements` and `weather_data` are written by the
/// ingestion collectors and only read here. `predictions` and `alerts` are
/// written by this service. Safe to call on every startup.
pub async fn create_schema(pool: &PgPool) -> Result<()> {
    // ---
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS air_quality_measurements (
            id          BIGSERIAL PRIMARY KEY,
            city        TEXT             NOT NULL,
            sensor_id   TEXT,
            timestamp   TIMESTAMPTZ      NOT NULL,
            pm25        DOUBLE PRECISION NOT NULL,
            pm10        DOUBLE PRECISION NOT NULL,
            no2         DOUBLE PRECISION NOT NULL
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS weather_data (
            id          BIGSERIAL PRIMARY KEY,
            city        TEXT             NOT NULL,
            timestamp   TIMESTAMPTZ      NOT NULL,
            temperature DOUBLE PRECISION NOT NULL,
            humidity    DOUBLE PRECISION NOT NULL,
            wind_speed  DOUBLE PRECISION NOT NULL,
            pressure    DOUBLE PRECISION NOT NULL
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS predictions (
            id               UUID PRIMARY KEY,
            city             TEXT             NOT NULL,
            pollutant        TEXT             NOT NULL,
            predicted_value  DOUBLE PRECISION NOT NULL,
            confidence_score DOUBLE PRECISION NOT NULL,
            lower_bound      DOUBLE PRECISION NOT NULL,
            upper_bound      DOUBLE PRECISION NOT NULL,
            prediction_for   TIMESTAMPTZ      NOT NULL,
            created_at       TIMESTAMPTZ      NOT NULL,
            model_r2         DOUBLE PRECISION,
            model_mape       DOUBLE PRECISION
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS alerts (
            id          UUID PRIMARY KEY,
            city        TEXT        NOT NULL,
            alert_type  TEXT        NOT NULL,
            severity    TEXT        NOT NULL,
            message     TEXT        NOT NULL,
            data        JSONB,
            is_active   BOOLEAN     NOT NULL DEFAULT TRUE,
            created_at  TIMESTAMPTZ NOT NULL
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    // Training and sweep fetches filter on (city, timestamp)
    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_aq_city_timestamp
            ON air_quality_measurements (city, timestamp);
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_weather_city_timestamp
            ON weather_data (city, timestamp);
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_predictions_city_created
            ON predictions (city, created_at DESC);
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_alerts_city_active
            ON alerts (city, is_active);
        "#,
    )
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}
