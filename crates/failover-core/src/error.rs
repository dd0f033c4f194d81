//! Error types for failover coordination
//!
//! TigerStyle: Explicit error types with context, using thiserror.
//!
//! Only recoverable conditions live here. Broken caller invariants
//! (double commit, finishing an operation that never started) panic.

use thiserror::Error;

/// Result type alias for failover-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while configuring the coordination layer
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("invalid configuration: {field}: {reason}")]
    InvalidConfiguration { field: String, reason: String },

    #[error("telemetry initialization failed: {reason}")]
    TelemetryInitFailed { reason: String },
}

impl Error {
    pub fn invalid_configuration(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Configuration field the error refers to, if any
    pub fn field(&self) -> Option<&str> {
        match self {
            Self::InvalidConfiguration { field, .. } => Some(field),
            Self::TelemetryInitFailed { .. } => None,
        }
    }
}
