use std::io;
use thiserror::Error;

use crate::types::ValidationError;

/// Result type for sandbox engine operations
pub type SandboxResult<T> = std::result::Result<T, SandboxError>;

/// Errors that can occur inside the sandbox engine
#[derive(Error, Debug)]
pub enum SandboxError {
    /// Static validation rejected the script before any process was spawned.
    /// Carries the scanner's field/message pairs.
    #[error("Validation failed: {}", format_validation_errors(.0))]
    ValidationFailed(Vec<ValidationError>),

    /// One or more required capabilities are missing for the script.
    /// Recoverable: granting the named capabilities and retrying succeeds.
    #[error("Permission denied: {}", .0.join("; "))]
    PermissionDenied(Vec<String>),

    /// Process pool acquire/release failure
    #[error("Pool error: {0}")]
    PoolError(String),

    /// Platform-specific facility failed (kill, process group)
    #[error("Platform error: {0}")]
    PlatformError(String),

    /// Invalid request from the caller
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// IO error occurred
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl SandboxError {
    /// Create a new validation failure from scanner errors
    pub fn validation_failed(errors: Vec<ValidationError>) -> Self {
        Self::ValidationFailed(errors)
    }

    /// Create a new permission denied error from missing-capability messages
    pub fn permission_denied(missing: Vec<String>) -> Self {
        Self::PermissionDenied(missing)
    }

    /// Create a new pool error
    pub fn pool_error(reason: impl Into<String>) -> Self {
        Self::PoolError(reason.into())
    }

    /// Create a new platform error
    pub fn platform_error(reason: impl Into<String>) -> Self {
        Self::PlatformError(reason.into())
    }

    /// Create a new invalid request error
    pub fn invalid_request(reason: impl Into<String>) -> Self {
        Self::InvalidRequest(reason.into())
    }
}

fn format_validation_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| format!("{}: {}", e.field, e.message))
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<serde_json::Error> for SandboxError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}
