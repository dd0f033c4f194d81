//! Cache error types
//!
//! TigerStyle: Explicit error variants with context.
//!
//! `UpdatePending` is the normal outcome of contention and callers retry the
//! whole higher-level operation. `NotFound` is terminal for the entity.

use std::fmt;
use thiserror::Error;

/// Kind of entity held in a cache
///
/// Maps a generic cache failure onto the entity-specific error code that
/// callers report (`NodeNotFound`, `ServiceTypeNotFound`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Node,
    Service,
    ServiceType,
    Application,
    FailoverUnit,
    Replica,
}

impl EntityKind {
    /// Entity-specific not-found error code
    pub fn not_found_code(&self) -> &'static str {
        match self {
            EntityKind::Node => "NodeNotFound",
            EntityKind::Service => "ServiceNotFound",
            EntityKind::ServiceType => "ServiceTypeNotFound",
            EntityKind::Application => "ApplicationNotFound",
            EntityKind::FailoverUnit => "FailoverUnitNotFound",
            EntityKind::Replica => "ReplicaNotFound",
        }
    }

    /// Short lowercase name, used as a metric label
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Node => "node",
            EntityKind::Service => "service",
            EntityKind::ServiceType => "service_type",
            EntityKind::Application => "application",
            EntityKind::FailoverUnit => "failover_unit",
            EntityKind::Replica => "replica",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors returned when locking a cache entry
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// Another writer still holds the entry after the timeout
    #[error("update pending on {kind} entry")]
    UpdatePending { kind: EntityKind },

    /// The entry was deleted or never existed
    #[error("{}", .kind.not_found_code())]
    NotFound { kind: EntityKind },
}

impl CacheError {
    /// Create an update pending error
    pub fn update_pending(kind: EntityKind) -> Self {
        Self::UpdatePending { kind }
    }

    /// Create a not found error
    pub fn not_found(kind: EntityKind) -> Self {
        Self::NotFound { kind }
    }

    /// Entity kind the error refers to
    pub fn kind(&self) -> EntityKind {
        match self {
            Self::UpdatePending { kind } | Self::NotFound { kind } => *kind,
        }
    }

    /// Check if this error indicates a retriable condition
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::UpdatePending { .. })
    }

    /// Check if the entity is gone
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Result type for cache operations
pub type CacheResult<T> = Result<T, CacheError>;
