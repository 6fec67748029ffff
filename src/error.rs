//! Error taxonomy for the forecasting and anomaly pipeline.
//!
//! Library code returns [`PipelineError`]; the binary converts to
//! `anyhow::Error` at the startup edge the same way the rest of `main.rs`
//! handles configuration and database failures.

use thiserror::Error;

/// Result alias used across the pipeline modules.
pub type Result<T> = std::result::Result<T, PipelineError>;

// ---

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Too few usable rows after feature engineering. No artifact is touched.
    #[error("insufficient data for {city}: {rows} usable rows, need at least {required}")]
    InsufficientData {
        city: String,
        rows: usize,
        required: usize,
    },

    /// History source unavailable or timed out.
    #[error("upstream fetch failed: {0}")]
    UpstreamFetch(String),

    #[error("no trained model found for {0}")]
    ModelNotFound(String),

    /// Persisted feature columns diverge from the current transform.
    #[error("feature columns do not match the trained model (expected {expected:?}, got {actual:?}); retrain required")]
    FeatureMismatch {
        expected: Vec<String>,
        actual: Vec<String>,
    },

    #[error("training already in progress for {0}")]
    TrainingInProgress(String),

    /// The tree learner rejected its input.
    #[error("model error: {0}")]
    Model(String),

    #[error("artifact store error: {0}")]
    Artifact(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("background task failed: {0}")]
    Task(String),
}

impl From<std::io::Error> for PipelineError {
    fn from(e: std::io::Error) -> Self {
        PipelineError::Artifact(e.to_string())
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(e: serde_json::Error) -> Self {
        PipelineError::Artifact(e.to_string())
    }
}

impl From<sqlx::Error> for PipelineError {
    fn from(e: sqlx::Error) -> Self {
        PipelineError::UpstreamFetch(e.to_string())
    }
}

impl From<tokio::task::JoinError> for PipelineError {
    fn from(e: tokio::task::JoinError) -> Self {
        PipelineError::Task(e.to_string())
    }
}
