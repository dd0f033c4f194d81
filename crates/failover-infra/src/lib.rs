//! Failover Infra
//!
//! Concurrency coordination primitives for replica reconfiguration.
//!
//! # Overview
//!
//! The crate provides:
//! - `VersionedCacheEntry`: optimistic single-writer locking over shared snapshots
//! - `EntityCache`: keyed collections of versioned entries
//! - `OperationManager`: admission, compatibility and cancellation of API calls
//! - `BackgroundWorkManager`: coalesced, rate-limited background work
//! - `EntitySetWorkManager`: background draining of marked entities
//!
//! A typical mutation locks a cache entry, runs an operation admitted by the
//! target's `OperationManager`, commits the new value and requests follow-up
//! work without re-entering the current call stack.
//!
//! # TigerStyle
//! - Contention and missing entities are values, broken invariants panic
//! - Each primitive owns one internal mutex
//! - Caller-supplied callbacks never run while that mutex is held

pub mod background_work;
pub mod cache_entry;
pub mod entity_cache;
pub mod entity_set_work;
pub mod error;
pub mod operation_kind;
pub mod operation_manager;
pub mod wait;

pub use background_work::{
    BackgroundWork, BackgroundWorkConfig, BackgroundWorkManager, WorkOutcome, WorkPhase,
};
pub use cache_entry::{CacheValue, LockedCacheEntry, VersionedCacheEntry};
pub use entity_cache::EntityCache;
pub use entity_set_work::{EntityProcessor, EntitySetWorkManager};
pub use error::{CacheError, CacheResult, EntityKind};
pub use operation_kind::{ApiName, CompatibilityTable, OperationKind};
pub use operation_manager::{
    cancel_handle, CancelHandle, Cancellable, ManagerState, OperationManager, OperationRecord,
    QueryDetails,
};
pub use wait::WaitGate;
