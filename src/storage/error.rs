//! Storage engine error types
//!
//! Defines all errors that can occur behind the data stream facade.

use crate::storage::types::MetricId;
use thiserror::Error;

/// Errors that can occur in the data stream backends
#[derive(Error, Debug)]
pub enum StreamError {
    /// Requested metric does not exist
    #[error("Unknown metric: {0}")]
    UnknownMetric(MetricId),

    /// Granularity name is unknown or not stored for the metric
    #[error("Unsupported granularity: {0}")]
    UnsupportedGranularity(String),

    /// Downsampler function name is not registered
    #[error("Unsupported downsampler: {0}")]
    UnsupportedDownsampler(String),

    /// Backend failed to initialize
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Timestamp lies inside an already downsampled bucket
    #[error("Invalid timestamp {timestamp}: data before {sealed_until} is already downsampled")]
    InvalidTimestamp { timestamp: i64, sealed_until: i64 },

    /// I/O operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization failed
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<bincode::Error> for StreamError {
    fn from(err: bincode::Error) -> Self {
        StreamError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for StreamError {
    fn from(err: serde_json::Error) -> Self {
        StreamError::Serialization(err.to_string())
    }
}

impl From<crate::config::ConfigError> for StreamError {
    fn from(err: crate::config::ConfigError) -> Self {
        StreamError::Configuration(err.to_string())
    }
}

/// Result type alias for data stream operations
pub type StreamResult<T> = Result<T, StreamError>;
