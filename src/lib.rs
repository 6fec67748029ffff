//! PM2.5 forecasting and anomaly detection for the smart city dashboard.
//!
//! The binary in `main.rs` wires these modules together; the integration
//! tests drive the same [`routes::router`] against a [`gateway::MemoryGateway`].

pub mod anomaly;
pub mod artifact;
pub mod config;
pub mod error;
pub mod features;
pub mod forest;
pub mod gateway;
pub mod isolation;
pub mod models;
pub mod predictor;
pub mod routes;
pub mod scheduler;
pub mod schema;
pub mod service;
pub mod stats;
pub mod trainer;

#[cfg(test)]
mod testutil;

pub use config::Config;
pub use error::{PipelineError, Result};
pub use service::{ForecastService, ServiceSettings};
