//! Error types shared across the monitoring core.
//!
//! Two families live here. [`WardenError`] covers operations that can fail in the
//! ordinary sense (storage, configuration, pattern compilation). [`HandlerError`] is
//! what an event handler returns when it could not process an event; the bus turns
//! it into a log line and a circuit-breaker trip count, never into a propagated error.
//!
//! # Examples
//! ```
//! use warden::error::WardenError;
//!
//! let error = WardenError::Storage("events table unavailable".to_string());
//! assert_eq!(format!("{}", error), "Storage error: events table unavailable");
//! ```

use thiserror::Error;

/// Errors raised by the store, configuration layer and components.
#[derive(Error, Debug)]
pub enum WardenError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Component error: {0}")]
    Component(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Not found: {0}")]
    NotFound(String),
}

pub type WardenResult<T> = Result<T, WardenError>;

impl From<serde_json::Error> for WardenError {
    fn from(error: serde_json::Error) -> Self {
        WardenError::Serialization(error.to_string())
    }
}

impl From<toml::de::Error> for WardenError {
    fn from(error: toml::de::Error) -> Self {
        WardenError::Config(error.to_string())
    }
}

/// Failure reported by a single handler invocation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum HandlerError {
    #[error("Handler failed: {0}")]
    Failed(String),

    #[error("Handler panicked: {0}")]
    Panicked(String),

    #[error("Missing payload field: {0}")]
    MissingField(String),
}

impl From<WardenError> for HandlerError {
    fn from(error: WardenError) -> Self {
        HandlerError::Failed(error.to_string())
    }
}

/// Outcome of a handler invocation: `Ok(true)` when the event was acted upon.
pub type HandlerResult = Result<bool, HandlerError>;
