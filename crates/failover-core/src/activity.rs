//! Activity identifiers
//!
//! An activity id correlates every log line produced on behalf of one
//! request, from the caller that asked for work down to the execution
//! that performed it.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Correlation identifier threaded through requests for diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActivityId(Uuid);

impl ActivityId {
    /// Generate a fresh activity id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// The nil activity id, used for internally generated requests
    pub const fn nil() -> Self {
        Self(Uuid::nil())
    }

    /// Wrap an existing uuid
    pub const fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// The underlying uuid
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Whether this is the nil id
    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }
}

impl Default for ActivityId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ActivityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for ActivityId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}
