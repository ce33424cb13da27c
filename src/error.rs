//! Error types for the Gatehouse service.

use std::time::Duration;

use thiserror::Error;

/// Main error type for Gatehouse operations.
#[derive(Error, Debug)]
pub enum GatehouseError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A rate limit key could not be constructed or parsed
    #[error("Invalid rate limit key: {0}")]
    InvalidKey(String),

    /// Shared counter store errors
    #[error("Counter store error: {0}")]
    Store(#[from] redis::RedisError),

    /// The shared counter store did not answer in time
    #[error("Counter store timed out after {0:?}")]
    StoreTimeout(Duration),

    /// A health query named a backend that is not configured
    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    /// Metric registration or encoding errors
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// gRPC server errors
    #[error("gRPC error: {0}")]
    Grpc(#[from] tonic::transport::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Gatehouse operations.
pub type Result<T> = std::result::Result<T, GatehouseError>;
