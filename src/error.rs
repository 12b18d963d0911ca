//! Error types for Synheart Pulse

use thiserror::Error;

/// Errors that can occur while ingesting and processing readings
#[derive(Debug, Error)]
pub enum ComputeError {
    #[error("Failed to parse inbound message: {0}")]
    ParseError(String),

    #[error("Invalid JSON: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid reading: {0}")]
    InvalidReading(String),

    #[error("Unknown metric: {0}")]
    UnknownMetric(String),

    #[error("Late reading for user {user_id}: observed {lateness_ms} ms behind the watermark")]
    LateReading { user_id: String, lateness_ms: i64 },

    #[error("Reading for user {user_id} is {ahead_ms} ms ahead of its ingest time")]
    FutureReading { user_id: String, ahead_ms: i64 },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Partition {0} is unavailable")]
    PartitionUnavailable(usize),

    #[error("Runtime has been shut down")]
    RuntimeClosed,
}
