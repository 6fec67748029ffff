//! Data access boundary.
//!
//! The pipeline reads history and writes predictions/alerts only through
//! [`Gateway`]. `postgres` is the production backend. `memory` backs tests
//! and local runs without a database.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{PipelineError, Result};
use crate::models::{AlertRecord, AnomalyFlag, Measurement, PredictionRecord};

mod memory;
mod postgres;

pub use memory::MemoryGateway;
pub use postgres::PgGateway;

// ---

#[async_trait]
pub trait Gateway: Send + Sync {
    /// Time-ordered history for `city` with `timestamp >= since`.
    async fn fetch_measurements(&self, city: &str, since: DateTime<Utc>) -> Result<Vec<Measurement>>;

    async fn persist_prediction(&self, record: &PredictionRecord) -> Result<()>;

    async fn persist_alert(&self, flag: &AnomalyFlag) -> Result<()>;

    /// Newest-first predictions stored for `city`, at most `limit`.
    async fn recent_predictions(&self, city: &str, limit: u32) -> Result<Vec<PredictionRecord>>;

    /// Newest-first anomaly alerts created at or after `since`, at most
    /// `limit`. `None` covers every city.
    async fn recent_alerts(
        &self,
        city: Option<&str>,
        since: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<AlertRecord>>;
}

/// Run a gateway read under a hard deadline. Failures and timeouts both
/// surface as [`PipelineError::UpstreamFetch`].
pub async fn within<T>(
    timeout: Duration,
    what: &str,
    call: impl Future<Output = Result<T>>,
) -> Result<T> {
    // ---
    match tokio::time::timeout(timeout, call).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => {
            tracing::error!("Failed to fetch {}: {}", what, e);
            Err(match e {
                PipelineError::UpstreamFetch(_) => e,
                other => PipelineError::UpstreamFetch(other.to_string()),
            })
        }
        Err(_) => {
            tracing::error!("Fetching {} timed out after {:?}", what, timeout);
            Err(PipelineError::UpstreamFetch(format!(
                "timed out after {timeout:?} fetching {what}"
            )))
        }
    }
}

/// Fetch with a hard deadline; a timeout becomes [`PipelineError::UpstreamFetch`].
pub async fn fetch_with_timeout(
    gateway: &dyn Gateway,
    city: &str,
    since: DateTime<Utc>,
    timeout: Duration,
) -> Result<Vec<Measurement>> {
    // ---
    let what = format!("measurements for {city}");
    let rows = within(timeout, &what, gateway.fetch_measurements(city, since)).await?;
    tracing::debug!("Fetched {} measurements for {} since {}", rows.len(), city, since);
    Ok(rows)
}
