//! Metrics recording for the coordination primitives
//!
//! TigerStyle: Explicit metric names with units, type-safe recording.
//!
//! Recording goes through the `metrics` facade. Without an installed
//! recorder every call is a no-op, so library code records unconditionally.

use crate::constants::*;

/// Record a cache lock wait that reached its deadline
pub fn record_cache_lock_timeout(entity: &'static str) {
    ::metrics::counter!(METRIC_NAME_CACHE_LOCK_TIMEOUTS_TOTAL, "entity" => entity).increment(1);
}

/// Record a try-lock that found the entry already locked
pub fn record_cache_lock_contended(entity: &'static str) {
    ::metrics::counter!(METRIC_NAME_CACHE_LOCK_CONTENDED_TOTAL, "entity" => entity).increment(1);
}

/// Record a committed cache value
pub fn record_cache_commit(entity: &'static str) {
    ::metrics::counter!(METRIC_NAME_CACHE_COMMITS_TOTAL, "entity" => entity).increment(1);
}

/// Record an admitted operation
pub fn record_operation_started(kind: &'static str) {
    ::metrics::counter!(METRIC_NAME_OPERATIONS_STARTED_TOTAL, "kind" => kind).increment(1);
}

/// Record a rejected operation
pub fn record_operation_rejected(kind: &'static str) {
    ::metrics::counter!(METRIC_NAME_OPERATIONS_REJECTED_TOTAL, "kind" => kind).increment(1);
}

/// Record cancellation signals issued to outstanding operations
pub fn record_operations_cancelled(count: usize) {
    ::metrics::counter!(METRIC_NAME_OPERATIONS_CANCELLED_TOTAL).increment(count as u64);
}

/// Record a background work execution start
pub fn record_work_execution(manager: &str) {
    ::metrics::counter!(METRIC_NAME_WORK_EXECUTIONS_TOTAL, "manager" => manager.to_string())
        .increment(1);
}

/// Record a request absorbed by an already pending request
pub fn record_work_request_coalesced(manager: &str) {
    ::metrics::counter!(
        METRIC_NAME_WORK_REQUESTS_COALESCED_TOTAL,
        "manager" => manager.to_string()
    )
    .increment(1);
}

/// Record the number of entities waiting in an entity-set work manager
pub fn record_entity_set_pending(manager: &str, count: usize) {
    ::metrics::gauge!(METRIC_NAME_ENTITY_SET_PENDING_COUNT, "manager" => manager.to_string())
        .set(count as f64);
}
