//! TigerStyle constants for failover coordination
//!
//! All limits are explicit, use big-endian naming (most significant first),
//! and include units in the name.

// =============================================================================
// Cache Limits
// =============================================================================

/// Default time a writer waits for a locked cache entry (1 sec)
pub const CACHE_LOCK_TIMEOUT_MS_DEFAULT: u64 = 1000;

/// Maximum time a writer may wait for a locked cache entry (1 min)
pub const CACHE_LOCK_TIMEOUT_MS_MAX: u64 = 60 * 1000;

// =============================================================================
// Background Work Limits
// =============================================================================

/// Default minimum spacing between the starts of two executions
pub const WORK_MIN_INTERVAL_MS_DEFAULT: u64 = 100;

/// Maximum configurable spacing between executions (10 min)
pub const WORK_MIN_INTERVAL_MS_MAX: u64 = 10 * 60 * 1000;

/// Default interval before work that asked for a retry runs again (5 sec)
pub const WORK_RETRY_INTERVAL_MS_DEFAULT: u64 = 5 * 1000;

/// Maximum retry interval (1 hour)
pub const WORK_RETRY_INTERVAL_MS_MAX: u64 = 60 * 60 * 1000;

/// Maximum length of a work manager name in bytes
pub const WORK_MANAGER_NAME_LENGTH_BYTES_MAX: usize = 128;

/// Maximum number of entities tracked by one entity-set work manager
pub const ENTITY_SET_COUNT_MAX: usize = 1_000_000;

// =============================================================================
// Operation Limits
// =============================================================================

/// Maximum concurrent instances of one multi-instance operation kind
pub const OPERATION_INSTANCES_COUNT_MAX: usize = 1024;

/// Maximum number of distinct operation kinds in a compatibility table
pub const OPERATION_KINDS_COUNT_MAX: usize = 64;

// =============================================================================
// Runtime Limits
// =============================================================================

/// Longest single sleep accepted by a runtime (1 hour)
pub const RUNTIME_SLEEP_MS_MAX: u64 = 60 * 60 * 1000;

// =============================================================================
// Metric Names
// =============================================================================

/// Waiting cache lock attempts that reached their deadline
pub const METRIC_NAME_CACHE_LOCK_TIMEOUTS_TOTAL: &str = "failover_cache_lock_timeouts_total";

/// Non-waiting cache lock attempts that found the entry locked
pub const METRIC_NAME_CACHE_LOCK_CONTENDED_TOTAL: &str = "failover_cache_lock_contended_total";

/// Values committed into cache entries
pub const METRIC_NAME_CACHE_COMMITS_TOTAL: &str = "failover_cache_commits_total";

/// Operations admitted by an operation manager
pub const METRIC_NAME_OPERATIONS_STARTED_TOTAL: &str = "failover_operations_started_total";

/// Operations rejected by an operation manager
pub const METRIC_NAME_OPERATIONS_REJECTED_TOTAL: &str = "failover_operations_rejected_total";

/// Cancellation signals issued to outstanding operations
pub const METRIC_NAME_OPERATIONS_CANCELLED_TOTAL: &str = "failover_operations_cancelled_total";

/// Background work executions started
pub const METRIC_NAME_WORK_EXECUTIONS_TOTAL: &str = "failover_work_executions_total";

/// Background work requests absorbed by an already pending request
pub const METRIC_NAME_WORK_REQUESTS_COALESCED_TOTAL: &str =
    "failover_work_requests_coalesced_total";

/// Entities waiting in an entity-set work manager
pub const METRIC_NAME_ENTITY_SET_PENDING_COUNT: &str = "failover_entity_set_pending_count";
