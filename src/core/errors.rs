use std::time::Duration;

use serde::{Deserialize, Serialize};
use sled::transaction::TransactionError;
use thiserror::Error;

/// Unified error type for the coordinator
#[derive(Debug, Error)]
pub enum CoordError {
    // Caller-facing errors
    #[error("Product already exists: {pid}")]
    Conflict { pid: String },

    #[error("Product not found: {pid}")]
    NotFound { pid: String },

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Dependency cycle: {downstream} -> {upstream} would close a loop")]
    CycleDetected { downstream: String, upstream: String },

    /// A claim attempt lost a race. Absorbed by the scheduler.
    #[error("Lost claim race on {pid}")]
    Contention { pid: String },

    // Storage errors
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Database error: {0}")]
    Database(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    // Configuration errors
    #[error("Configuration invalid: {0}")]
    InvalidConfiguration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// External error taxonomy exposed by the coordinator API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Conflict,
    NotFound,
    BadRequest,
    Internal,
}

impl CoordError {
    pub fn not_found(pid: impl Into<String>) -> Self {
        Self::NotFound { pid: pid.into() }
    }

    pub fn conflict(pid: impl Into<String>) -> Self {
        Self::Conflict { pid: pid.into() }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }

    /// Map onto the caller-facing taxonomy
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Conflict { .. } => ErrorKind::Conflict,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::BadRequest(_) | Self::CycleDetected { .. } => ErrorKind::BadRequest,
            _ => ErrorKind::Internal,
        }
    }

    /// Whether retrying the same call may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Contention { .. } | Self::Database(_) | Self::Storage(_) | Self::Io(_)
        )
    }

    /// Get suggested retry delay for this error
    pub fn suggested_retry_delay(&self) -> Option<Duration> {
        match self {
            Self::Contention { .. } => Some(Duration::from_millis(10)),
            Self::Database(_) | Self::Storage(_) => Some(Duration::from_secs(2)),
            Self::Io(_) => Some(Duration::from_secs(1)),
            _ => None,
        }
    }
}

impl From<TransactionError<CoordError>> for CoordError {
    fn from(err: TransactionError<CoordError>) -> Self {
        match err {
            TransactionError::Abort(e) => e,
            TransactionError::Storage(e) => CoordError::Database(e),
        }
    }
}

/// Result type alias for CoordError
pub type Result<T> = std::result::Result<T, CoordError>;
