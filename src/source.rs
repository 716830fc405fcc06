use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use thiserror::Error;

use crate::db::models::{Circuit, HourlyConsumption, Reading};

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },
    #[error("failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("database query failed: {0}")]
    Database(#[from] sqlx::Error),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// Remote source of truth the aggregator reads from.
///
/// Implementations are responsible for coercing their row shapes into the
/// typed models: numeric gaps become `0.0`, unkeyable rows are dropped.
#[async_trait]
pub trait TelemetrySource: Send + Sync {
    /// Circuits of `device_id`, in display order.
    async fn circuits_for_device(&self, device_id: &str) -> Result<Vec<Circuit>, SourceError>;

    /// Readings for `circuit_ids` with `timestamp >= since`, ascending by timestamp.
    async fn readings_since(
        &self,
        circuit_ids: &[String],
        since: DateTime<Utc>,
    ) -> Result<Vec<Reading>, SourceError>;

    /// Pre-aggregated hourly consumption for `circuit_ids` from `since` (local date) onwards.
    async fn hourly_consumption_since(
        &self,
        circuit_ids: &[String],
        since: NaiveDate,
    ) -> Result<Vec<HourlyConsumption>, SourceError>;
}
