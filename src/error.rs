//! Application error types for clinic-sync
//!
//! This module defines common error types used throughout the application.
//! All error types use `thiserror` for ergonomic error handling.

use thiserror::Error;

use crate::config::ConfigError;

/// Local record store errors
#[derive(Debug, Error)]
pub enum StoreError {
    /// SQLite error
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Error reported by the async connection wrapper
    #[error("Database connection error: {0}")]
    Connection(#[from] tokio_rusqlite::Error),

    /// Record not found
    #[error("Record not found: {0}")]
    NotFound(String),

    /// Record already exists
    #[error("Duplicate record: {0}")]
    Duplicate(String),

    /// Stored row could not be decoded
    #[error("Corrupt record {local_id}: {reason}")]
    Corrupt { local_id: String, reason: String },

    /// Payload could not be serialized for storage
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Synchronization-related errors
///
/// These describe why a single remote submission did not produce a
/// structured answer. The executor folds them into
/// `SubmitOutcome::TransportFailure`, so they never escape a pass.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SyncError {
    /// Network timeout
    #[error("Network timeout")]
    NetworkTimeout,

    /// Connection refused
    #[error("Connection refused")]
    ConnectionRefused,

    /// Server error without a structured body
    #[error("Server error: HTTP {0}")]
    ServerError(u16),

    /// Credentials rejected by the remote service
    #[error("Unauthorized: HTTP {0}")]
    Unauthorized(u16),

    /// Response body did not match the expected schema
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Generic network error
    #[error("Network error: {0}")]
    Network(String),

    /// A sync pass ended without reporting a result
    #[error("Sync pass aborted before completion")]
    PassAborted,

    /// Trigger sent to a scheduler that has stopped
    #[error("Sync scheduler is not running")]
    SchedulerStopped,

    /// Scheduler state could not be read or written
    #[error("Scheduler state persistence failed: {0}")]
    StatePersistence(String),
}

/// Tracing initialisation errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TelemetryError {
    /// Subscriber could not be installed
    #[error("Failed to initialize tracing: {0}")]
    Init(String),

    /// Invalid filter directive
    #[error("Invalid log filter: {0}")]
    Filter(String),
}

/// Application-level error type
///
/// This is the main error type used at the application boundary.
/// It aggregates all domain-specific error types.
#[derive(Debug, Error)]
pub enum AppError {
    /// Store error
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Sync error
    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Telemetry error
    #[error("Telemetry error: {0}")]
    Telemetry(#[from] TelemetryError),

    /// Unknown entity type name
    #[error("Unknown entity type: {0}")]
    UnknownEntity(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            SyncError::NetworkTimeout
        } else if err.is_connect() {
            SyncError::ConnectionRefused
        } else if err.is_decode() {
            SyncError::InvalidResponse(err.to_string())
        } else {
            SyncError::Network(err.to_string())
        }
    }
}
