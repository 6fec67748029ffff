use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use rand::{rngs::StdRng, Rng, SeedableRng};
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};

use smartcity_forecast::artifact::ArtifactStore;
use smartcity_forecast::gateway::MemoryGateway;
use smartcity_forecast::models::Measurement;
use smartcity_forecast::{routes, ForecastService, ServiceSettings};

// ---

struct TestApp {
    base: String,
    gateway: Arc<MemoryGateway>,
    client: Client,
    _models: tempfile::TempDir,
}

/// Serve the full router on an ephemeral port, backed by memory.
async fn spawn_app() -> Result<TestApp> {
    // ---
    let models = tempfile::tempdir()?;
    let gateway = Arc::new(MemoryGateway::new());
    let service = Arc::new(ForecastService::new(
        gateway.clone(),
        Arc::new(ArtifactStore::open(models.path())?),
        ServiceSettings {
            fetch_timeout: Duration::from_secs(5),
            ..ServiceSettings::default()
        },
    ));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        let _ = axum::serve(listener, routes::router(service)).await;
    });

    Ok(TestApp {
        base: format!("http://{}", addr),
        gateway,
        client: Client::new(),
        _models: models,
    })
}

/// Hourly history where tomorrow's pm25 follows today's temperature.
///
/// Mirrors the crate's `testutil::synthetic_series`, which is `#[cfg(test)]`
/// and so not visible to integration tests.
fn history(city: &str, end: DateTime<Utc>, hours: usize, seed: u64) -> Vec<Measurement> {
    // ---
    let mut rng = StdRng::seed_from_u64(seed);
    let drivers: Vec<f64> = (0..hours + 24).map(|_| rng.gen_range(0.0..30.0)).collect();
    (0..hours)
        .map(|t| {
            let pm25 = 10.0 + 2.0 * drivers[t] + rng.gen_range(-1.0..1.0);
            Measurement {
                timestamp: end - chrono::Duration::hours((hours - 1 - t) as i64),
                city: city.to_string(),
                sensor_id: None,
                pm25,
                pm10: pm25 * 1.5,
                no2: 20.0 + rng.gen_range(0.0..5.0),
                temperature: drivers[t + 24],
                humidity: rng.gen_range(40.0..80.0),
                wind_speed: rng.gen_range(0.0..10.0),
                pressure: rng.gen_range(1000.0..1025.0),
            }
        })
        .collect()
}

#[tokio::test]
async fn health_endpoint_ok() -> Result<()> {
    // ---
    let app = spawn_app().await?;
    let resp = app.client.get(format!("{}/health", app.base)).send().await?;
    assert_eq!(resp.status(), StatusCode::OK);

    let body: Value = resp.json().await?;
    assert_eq!(body["status"], "ok");
    Ok(())
}

#[tokio::test]
async fn predict_before_training_is_not_found() -> Result<()> {
    // ---
    let app = spawn_app().await?;
    let resp = app
        .client
        .get(format!("{}/api/v1/predictions/pm25?city=Paris", app.base))
        .send()
        .await?;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let body: Value = resp.json().await?;
    assert!(body["error"].as_str().unwrap_or_default().contains("Paris"));
    Ok(())
}

#[tokio::test]
async fn train_then_predict() -> Result<()> {
    // ---
    let app = spawn_app().await?;
    app.gateway
        .insert("Paris", history("Paris", Utc::now(), 40 * 24, 21))
        .await;

    let resp = app
        .client
        .post(format!("{}/api/v1/predictions/train", app.base))
        .json(&json!({"city": "Paris", "days": 60, "n_estimators": 20, "max_depth": 8}))
        .send()
        .await?;
    assert_eq!(resp.status(), StatusCode::OK);
    let outcome: Value = resp.json().await?;
    assert!(matches!(outcome["status"].as_str(), Some("success") | Some("warning")));
    assert_eq!(outcome["version"], 1);
    assert!(outcome["metrics"]["r2"].as_f64().unwrap_or(-1.0) > 0.5);

    let resp = app
        .client
        .get(format!("{}/api/v1/predictions/pm25?city=Paris", app.base))
        .send()
        .await?;
    assert_eq!(resp.status(), StatusCode::OK);
    let prediction: Value = resp.json().await?;
    let value = prediction["predicted_value"].as_f64().unwrap_or(f64::NAN);
    let lower = prediction["lower_bound"].as_f64().unwrap_or(f64::NAN);
    let upper = prediction["upper_bound"].as_f64().unwrap_or(f64::NAN);
    let confidence = prediction["confidence_score"].as_f64().unwrap_or(f64::NAN);
    assert!(lower >= 0.0 && lower <= value && value <= upper);
    assert!((0.0..=1.0).contains(&confidence));
    assert_eq!(prediction["pollutant"], "pm25");
    assert!(prediction["aqi_level"]["name"].is_string());
    assert_eq!(app.gateway.predictions().await.len(), 1);

    let resp = app
        .client
        .get(format!("{}/api/v1/predictions/history?city=Paris", app.base))
        .send()
        .await?;
    assert_eq!(resp.status(), StatusCode::OK);
    let stored: Value = resp.json().await?;
    assert_eq!(stored.as_array().map(Vec::len), Some(1));
    assert_eq!(stored[0]["predicted_value"], prediction["predicted_value"]);

    let resp = app
        .client
        .get(format!(
            "{}/api/v1/predictions/model/feature-importance?city=Paris&top_n=5",
            app.base
        ))
        .send()
        .await?;
    assert_eq!(resp.status(), StatusCode::OK);
    let importance: Value = resp.json().await?;
    assert_eq!(importance["features"].as_array().map(Vec::len), Some(5));

    Ok(())
}

#[tokio::test]
async fn training_on_short_history_is_unprocessable() -> Result<()> {
    // ---
    let app = spawn_app().await?;
    app.gateway
        .insert("Paris", history("Paris", Utc::now(), 250, 4))
        .await;

    let resp = app
        .client
        .post(format!("{}/api/v1/predictions/train", app.base))
        .json(&json!({"city": "Paris"}))
        .send()
        .await?;
    assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);

    let resp = app
        .client
        .post(format!("{}/api/v1/predictions/train", app.base))
        .json(&json!({"city": "Paris", "days": 0}))
        .send()
        .await?;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    Ok(())
}

#[tokio::test]
async fn anomaly_detection_flags_spike() -> Result<()> {
    // ---
    let app = spawn_app().await?;
    let mut readings = history("Paris", Utc::now(), 72, 8);
    for m in readings.iter_mut() {
        m.pm25 = 20.0;
    }
    if let Some(last) = readings.last_mut() {
        last.pm25 = 350.0;
    }
    app.gateway.insert("Paris", readings).await;

    let resp = app
        .client
        .get(format!(
            "{}/api/v1/anomalies/detect?city=Paris&lookback_days=7&strategy=zscore",
            app.base
        ))
        .send()
        .await?;
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await?;
    assert_eq!(body["total_anomalies"], 1);
    assert_eq!(body["strategy"], "z_score");
    assert_eq!(body["anomalies"][0]["value"], 350.0);

    let resp = app
        .client
        .get(format!(
            "{}/api/v1/anomalies/detect?city=Paris&strategy=astrology",
            app.base
        ))
        .send()
        .await?;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    Ok(())
}

#[tokio::test]
async fn detect_and_alert_then_list_alerts() -> Result<()> {
    // ---
    let app = spawn_app().await?;
    let mut readings = history("Paris", Utc::now(), 6 * 24, 8);
    for m in readings.iter_mut() {
        m.pm25 = 20.0;
    }
    if let Some(last) = readings.last_mut() {
        last.pm25 = 350.0;
    }
    app.gateway.insert("Paris", readings).await;

    let resp = app
        .client
        .post(format!(
            "{}/api/v1/anomalies/detect-and-alert?city=Paris&lookback_days=2",
            app.base
        ))
        .send()
        .await?;
    assert_eq!(resp.status(), StatusCode::OK);
    let summary: Value = resp.json().await?;
    assert_eq!(summary["anomalies_detected"], 1);
    assert_eq!(summary["alerts_created"], 1);

    let resp = app
        .client
        .get(format!("{}/api/v1/anomalies/recent?city=Paris", app.base))
        .send()
        .await?;
    assert_eq!(resp.status(), StatusCode::OK);
    let alerts: Value = resp.json().await?;
    assert_eq!(alerts.as_array().map(Vec::len), Some(1));
    assert_eq!(alerts[0]["alert_type"], "anomaly_detected");
    assert_eq!(alerts[0]["data"]["value"], 350.0);

    let resp = app
        .client
        .get(format!("{}/api/v1/anomalies/stats?city=Paris&days=7", app.base))
        .send()
        .await?;
    assert_eq!(resp.status(), StatusCode::OK);
    let stats: Value = resp.json().await?;
    assert_eq!(stats["method_distribution"]["z_score"], 1);
    assert!(stats["severity_distribution"]["critical"].as_u64().unwrap_or(0) >= 1);

    let resp = app
        .client
        .get(format!("{}/api/v1/anomalies/recent?hours=0", app.base))
        .send()
        .await?;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    Ok(())
}

#[tokio::test]
async fn missing_city_is_bad_request() -> Result<()> {
    // ---
    let app = spawn_app().await?;
    let resp = app
        .client
        .get(format!("{}/api/v1/predictions/pm25", app.base))
        .send()
        .await?;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    Ok(())
}
