//! Admission and cancellation of overlapping operations on one target
//!
//! TigerStyle: One mutex, atomic check-and-record, callbacks outside the lock.
//!
//! # State machine
//!
//! ```text
//!   Opened --close_for_business(false)--> Closed  (only the close kind admitted)
//!   Opened --close_for_business(true)---> Aborted (nothing admitted)
//!   Closed --close_for_business(true)---> Aborted
//!   Closed/Aborted --open_for_business()--> Opened (requires no outstanding operations)
//! ```
//!
//! # Invariants
//! - An operation starts only if the state admits its kind, the kind is not
//!   disallowed, and every outstanding kind is compatible with it
//! - Each outstanding operation is cancelled at most once
//! - Cancellation handles are never invoked while the internal lock is held

use crate::operation_kind::{CompatibilityTable, OperationKind};
use failover_core::{metrics, OperationConfig, TimeProvider};
use parking_lot::Mutex;
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

// =============================================================================
// Cancellation
// =============================================================================

/// Advisory cancellation signal for an outstanding operation
///
/// The manager only signals; the operation decides how to stop.
pub trait Cancellable: Send + Sync {
    fn cancel(&self);
}

impl<F> Cancellable for F
where
    F: Fn() + Send + Sync,
{
    fn cancel(&self) {
        self()
    }
}

/// Shared cancellation handle
pub type CancelHandle = Arc<dyn Cancellable>;

/// Wrap a closure as a cancellation handle
pub fn cancel_handle<F>(cancel: F) -> CancelHandle
where
    F: Fn() + Send + Sync + 'static,
{
    Arc::new(cancel)
}

// =============================================================================
// Public types
// =============================================================================

/// Admission state of an `OperationManager`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    /// Every kind admitted, subject to compatibility
    Opened,
    /// Only the close kind admitted
    Closed,
    /// Nothing admitted
    Aborted,
}

impl fmt::Display for ManagerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ManagerState::Opened => write!(f, "opened"),
            ManagerState::Closed => write!(f, "closed"),
            ManagerState::Aborted => write!(f, "aborted"),
        }
    }
}

/// What `finish` hands back for tracing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationRecord<K> {
    pub kind: K,
    pub started_at_ms: u64,
    pub finished_at_ms: u64,
    /// Instances of `kind` still outstanding (always 0 for single-instance)
    pub remaining_instances: usize,
}

impl<K> OperationRecord<K> {
    /// Time the operation was outstanding
    pub fn duration_ms(&self) -> u64 {
        self.finished_at_ms.saturating_sub(self.started_at_ms)
    }
}

/// Diagnostic snapshot of outstanding operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryDetails<K> {
    /// Outstanding kinds in ordinal order
    pub kinds: Vec<K>,
    /// Earliest start time among them
    pub started_at_ms: Option<u64>,
}

impl<K> QueryDetails<K> {
    fn empty() -> Self {
        Self {
            kinds: Vec::new(),
            started_at_ms: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }
}

// =============================================================================
// Internal bookkeeping
// =============================================================================

enum Tracking {
    Single {
        cancel: Option<CancelHandle>,
    },
    Multi {
        instances: usize,
        cancels: Vec<CancelHandle>,
    },
}

impl Tracking {
    fn instances(&self) -> usize {
        match self {
            Tracking::Single { .. } => 1,
            Tracking::Multi { instances, .. } => *instances,
        }
    }

    fn handles(&self) -> Vec<CancelHandle> {
        match self {
            Tracking::Single { cancel } => cancel.iter().cloned().collect(),
            Tracking::Multi { cancels, .. } => cancels.clone(),
        }
    }
}

struct Outstanding {
    started_at_ms: u64,
    tracking: Tracking,
    cancel_requested: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rejection<K> {
    NotAdmitted(ManagerState),
    Disallowed,
    Incompatible(K),
    AlreadyRunning,
    InstanceLimit(usize),
}

impl<K: fmt::Display> fmt::Display for Rejection<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::NotAdmitted(state) => write!(f, "not admitted while {}", state),
            Rejection::Disallowed => write!(f, "marked for cancel"),
            Rejection::Incompatible(running) => write!(f, "incompatible with running {}", running),
            Rejection::AlreadyRunning => write!(f, "already running"),
            Rejection::InstanceLimit(count) => write!(f, "instance limit {} reached", count),
        }
    }
}

struct ManagerInner<K> {
    state: ManagerState,
    outstanding: HashMap<K, Outstanding>,
    disallowed: HashSet<K>,
}

// =============================================================================
// OperationManager
// =============================================================================

/// Tracks outstanding operations against one target and gates new ones
pub struct OperationManager<K: OperationKind> {
    table: Arc<CompatibilityTable<K>>,
    time: Arc<dyn TimeProvider>,
    instances_count_max: usize,
    inner: Mutex<ManagerInner<K>>,
}

impl<K: OperationKind> OperationManager<K> {
    /// Create an opened manager with default limits
    pub fn new(table: Arc<CompatibilityTable<K>>, time: Arc<dyn TimeProvider>) -> Self {
        Self::with_config(table, time, &OperationConfig::default())
    }

    /// Create an opened manager
    pub fn with_config(
        table: Arc<CompatibilityTable<K>>,
        time: Arc<dyn TimeProvider>,
        config: &OperationConfig,
    ) -> Self {
        assert!(
            config.instances_count_max > 0,
            "instances_count_max must be positive"
        );

        Self {
            table,
            time,
            instances_count_max: config.instances_count_max,
            inner: Mutex::new(ManagerInner {
                state: ManagerState::Opened,
                outstanding: HashMap::new(),
                disallowed: HashSet::new(),
            }),
        }
    }

    pub fn state(&self) -> ManagerState {
        self.inner.lock().state
    }

    /// Number of outstanding operation kinds
    pub fn outstanding_count(&self) -> usize {
        self.inner.lock().outstanding.len()
    }

    pub fn is_operation_running(&self, kind: K) -> bool {
        self.inner.lock().outstanding.contains_key(&kind)
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Admit every kind again
    ///
    /// # Panics
    /// If reopened from `Closed`/`Aborted` while operations are outstanding.
    pub fn open_for_business(&self) {
        let mut inner = self.inner.lock();
        if inner.state == ManagerState::Opened {
            return;
        }

        assert!(
            inner.outstanding.is_empty(),
            "reopened with {} outstanding operations",
            inner.outstanding.len()
        );

        inner.state = ManagerState::Opened;
        inner.disallowed.clear();
        info!("operation manager opened");
    }

    /// Stop admitting new work
    ///
    /// A graceful close still admits the close kind; an abort admits nothing.
    /// Closing twice is a no-op and an abort is never downgraded.
    pub fn close_for_business(&self, is_abort: bool) {
        let mut inner = self.inner.lock();
        let target = if is_abort {
            ManagerState::Aborted
        } else {
            ManagerState::Closed
        };

        let next = match (inner.state, target) {
            (ManagerState::Aborted, _) => ManagerState::Aborted,
            (_, target) => target,
        };
        if next == inner.state {
            return;
        }

        info!(from = %inner.state, to = %next, "operation manager closing");
        inner.state = next;
    }

    // -------------------------------------------------------------------------
    // Admission
    // -------------------------------------------------------------------------

    /// Whether `kind` would be admitted right now
    ///
    /// A hint only; `try_start` re-checks atomically.
    pub fn can_start(&self, kind: K) -> bool {
        let inner = self.inner.lock();
        self.check_start(&inner, kind).is_ok()
    }

    /// Atomically check admission and record `kind` as outstanding
    ///
    /// Returns false with no side effect when rejected.
    pub fn try_start(&self, kind: K, cancel: Option<CancelHandle>) -> bool {
        let mut inner = self.inner.lock();
        if let Err(rejection) = self.check_start(&inner, kind) {
            return Self::reject(kind, rejection);
        }

        let started_at_ms = self.time.now_ms();
        inner.outstanding.insert(
            kind,
            Outstanding {
                started_at_ms,
                tracking: Tracking::Single { cancel },
                cancel_requested: false,
            },
        );
        metrics::record_operation_started(kind.as_str());
        debug!(%kind, started_at_ms, "operation started");
        true
    }

    /// Attach a cancellation handle to `kind`, continuing an admitted operation
    ///
    /// Only state and disallowed kinds are checked; compatibility was settled
    /// when the operation first started. If `kind` is not outstanding it is
    /// recorded as a new single-instance operation.
    pub fn try_continue(&self, kind: K, cancel: Option<CancelHandle>) -> bool {
        let mut inner = self.inner.lock();
        if let Err(rejection) = Self::check_admitted(&self.table, &inner, kind) {
            return Self::reject(kind, rejection);
        }

        let now_ms = self.time.now_ms();
        match inner.outstanding.entry(kind) {
            Entry::Occupied(mut existing) => match &mut existing.get_mut().tracking {
                Tracking::Single { cancel: slot } => *slot = cancel,
                Tracking::Multi { .. } => {
                    panic!("continued multi-instance operation {} as single", kind)
                }
            },
            Entry::Vacant(vacant) => {
                vacant.insert(Outstanding {
                    started_at_ms: now_ms,
                    tracking: Tracking::Single { cancel },
                    cancel_requested: false,
                });
            }
        }
        debug!(%kind, "operation continued");
        true
    }

    /// Remove the outstanding record for `kind`
    ///
    /// # Panics
    /// If `kind` is not outstanding as a single-instance operation.
    pub fn finish(&self, kind: K) -> OperationRecord<K> {
        let finished_at_ms = self.time.now_ms();
        let mut inner = self.inner.lock();

        let removed = inner.outstanding.remove(&kind);
        let Some(outstanding) = removed else {
            panic!("finished operation {} that is not outstanding", kind);
        };
        assert!(
            matches!(outstanding.tracking, Tracking::Single { .. }),
            "finished multi-instance operation {} as single",
            kind
        );

        let record = OperationRecord {
            kind,
            started_at_ms: outstanding.started_at_ms,
            finished_at_ms,
            remaining_instances: 0,
        };
        debug!(%kind, duration_ms = record.duration_ms(), "operation finished");
        record
    }

    // -------------------------------------------------------------------------
    // Multi-instance variants
    // -------------------------------------------------------------------------

    /// Like `try_start`, but several instances of `kind` may run at once
    pub fn try_start_multi_instance(&self, kind: K, cancel: Option<CancelHandle>) -> bool {
        let mut inner = self.inner.lock();
        if let Err(rejection) = self.check_start_multi(&inner, kind) {
            return Self::reject(kind, rejection);
        }

        let now_ms = self.time.now_ms();
        let outstanding = inner.outstanding.entry(kind).or_insert_with(|| Outstanding {
            started_at_ms: now_ms,
            tracking: Tracking::Multi {
                instances: 0,
                cancels: Vec::new(),
            },
            cancel_requested: false,
        });

        let instances = match &mut outstanding.tracking {
            Tracking::Multi { instances, cancels } => {
                *instances += 1;
                cancels.extend(cancel);
                *instances
            }
            Tracking::Single { .. } => unreachable!("single-instance record rejected by admission"),
        };

        metrics::record_operation_started(kind.as_str());
        debug!(%kind, instances, "operation instance started");
        true
    }

    /// Attach a cancellation handle to a multi-instance `kind`
    ///
    /// Records one instance if `kind` is not outstanding; otherwise the
    /// instance count is unchanged.
    pub fn try_continue_multi_instance(&self, kind: K, cancel: Option<CancelHandle>) -> bool {
        let mut inner = self.inner.lock();
        if let Err(rejection) = Self::check_admitted(&self.table, &inner, kind) {
            return Self::reject(kind, rejection);
        }

        let now_ms = self.time.now_ms();
        let outstanding = inner.outstanding.entry(kind).or_insert_with(|| Outstanding {
            started_at_ms: now_ms,
            tracking: Tracking::Multi {
                instances: 1,
                cancels: Vec::new(),
            },
            cancel_requested: false,
        });

        match &mut outstanding.tracking {
            Tracking::Multi { cancels, .. } => cancels.extend(cancel),
            Tracking::Single { .. } => {
                panic!("continued single-instance operation {} as multi", kind)
            }
        }
        debug!(%kind, "operation instance continued");
        true
    }

    /// Finish one instance of `kind`
    ///
    /// The record is removed when the last instance finishes.
    ///
    /// # Panics
    /// If `kind` has no outstanding multi-instance record.
    pub fn finish_multi_instance(&self, kind: K) -> OperationRecord<K> {
        let finished_at_ms = self.time.now_ms();
        let mut inner = self.inner.lock();

        let Some(outstanding) = inner.outstanding.get_mut(&kind) else {
            panic!("finished operation instance {} that is not outstanding", kind);
        };
        let started_at_ms = outstanding.started_at_ms;

        let remaining_instances = match &mut outstanding.tracking {
            Tracking::Multi { instances, .. } => {
                assert!(*instances > 0, "instance count underflow for {}", kind);
                *instances -= 1;
                *instances
            }
            Tracking::Single { .. } => {
                panic!("finished single-instance operation {} as multi", kind)
            }
        };

        if remaining_instances == 0 {
            inner.outstanding.remove(&kind);
        }

        debug!(%kind, remaining_instances, "operation instance finished");
        OperationRecord {
            kind,
            started_at_ms,
            finished_at_ms,
            remaining_instances,
        }
    }

    // -------------------------------------------------------------------------
    // Cancellation
    // -------------------------------------------------------------------------

    /// Cancel every outstanding operation the current state no longer admits
    ///
    /// Returns the number of operations signalled.
    pub fn cancel_operations(&self) -> usize {
        let (signalled, handles) = {
            let mut inner = self.inner.lock();
            let state = inner.state;
            let close_kind = self.table.close_kind();

            let mut handles = Vec::new();
            let mut signalled = 0;
            for (kind, outstanding) in inner.outstanding.iter_mut() {
                if Self::state_admits(state, close_kind, *kind) || outstanding.cancel_requested {
                    continue;
                }
                outstanding.cancel_requested = true;
                signalled += 1;
                handles.extend(outstanding.tracking.handles());
                debug!(%kind, %state, "cancelling operation");
            }

            if signalled > 0 {
                metrics::record_operations_cancelled(signalled);
            }
            (signalled, handles)
        };

        for handle in handles {
            handle.cancel();
        }
        signalled
    }

    /// Disallow `kind` and cancel it if outstanding
    ///
    /// Returns true if a cancellation was signalled by this call.
    pub fn cancel_or_mark_for_cancel(&self, kind: K) -> bool {
        let handles = {
            let mut inner = self.inner.lock();
            inner.disallowed.insert(kind);

            match inner.outstanding.get_mut(&kind) {
                Some(outstanding) if !outstanding.cancel_requested => {
                    outstanding.cancel_requested = true;
                    metrics::record_operations_cancelled(1);
                    Some(outstanding.tracking.handles())
                }
                _ => None,
            }
        };

        let Some(handles) = handles else {
            debug!(%kind, "operation marked for cancel");
            return false;
        };

        debug!(%kind, "cancelling operation");
        for handle in handles {
            handle.cancel();
        }
        true
    }

    /// Allow `kind` again after `cancel_or_mark_for_cancel`
    ///
    /// Returns false if `kind` was not disallowed.
    pub fn remove_operation_for_cancel(&self, kind: K) -> bool {
        let removed = self.inner.lock().disallowed.remove(&kind);
        if !removed {
            debug!(%kind, "operation was not marked for cancel");
        }
        removed
    }

    // -------------------------------------------------------------------------
    // Diagnostics
    // -------------------------------------------------------------------------

    /// Outstanding kinds and the earliest start time; empty unless opened
    pub fn details_for_query(&self) -> QueryDetails<K> {
        let inner = self.inner.lock();
        if inner.state != ManagerState::Opened {
            return QueryDetails::empty();
        }

        let mut kinds: Vec<K> = inner.outstanding.keys().copied().collect();
        kinds.sort_by_key(|kind| kind.ordinal());
        let started_at_ms = inner
            .outstanding
            .values()
            .map(|outstanding| outstanding.started_at_ms)
            .min();

        QueryDetails {
            kinds,
            started_at_ms,
        }
    }

    /// The longest-running outstanding kind, if any
    pub fn name_for_query(&self) -> Option<K> {
        let inner = self.inner.lock();
        inner
            .outstanding
            .iter()
            .min_by_key(|(kind, outstanding)| (outstanding.started_at_ms, kind.ordinal()))
            .map(|(kind, _)| *kind)
    }

    // -------------------------------------------------------------------------
    // Admission checks (caller holds the lock)
    // -------------------------------------------------------------------------

    fn state_admits(state: ManagerState, close_kind: Option<K>, kind: K) -> bool {
        match state {
            ManagerState::Opened => true,
            ManagerState::Closed => close_kind == Some(kind),
            ManagerState::Aborted => false,
        }
    }

    fn check_admitted(
        table: &CompatibilityTable<K>,
        inner: &ManagerInner<K>,
        kind: K,
    ) -> Result<(), Rejection<K>> {
        if !Self::state_admits(inner.state, table.close_kind(), kind) {
            return Err(Rejection::NotAdmitted(inner.state));
        }
        if inner.disallowed.contains(&kind) {
            return Err(Rejection::Disallowed);
        }
        Ok(())
    }

    fn check_compatible(&self, inner: &ManagerInner<K>, kind: K) -> Result<(), Rejection<K>> {
        match inner
            .outstanding
            .keys()
            .find(|running| **running != kind && !self.table.compatible(**running, kind))
        {
            Some(running) => Err(Rejection::Incompatible(*running)),
            None => Ok(()),
        }
    }

    fn check_start(&self, inner: &ManagerInner<K>, kind: K) -> Result<(), Rejection<K>> {
        Self::check_admitted(&self.table, inner, kind)?;
        if inner.outstanding.contains_key(&kind) {
            return Err(Rejection::AlreadyRunning);
        }
        self.check_compatible(inner, kind)
    }

    fn check_start_multi(&self, inner: &ManagerInner<K>, kind: K) -> Result<(), Rejection<K>> {
        Self::check_admitted(&self.table, inner, kind)?;
        if let Some(outstanding) = inner.outstanding.get(&kind) {
            match outstanding.tracking {
                Tracking::Single { .. } => return Err(Rejection::AlreadyRunning),
                Tracking::Multi { instances, .. } if instances >= self.instances_count_max => {
                    return Err(Rejection::InstanceLimit(instances));
                }
                Tracking::Multi { .. } => {}
            }
        }
        self.check_compatible(inner, kind)
    }

    fn reject(kind: K, rejection: Rejection<K>) -> bool {
        metrics::record_operation_rejected(kind.as_str());
        match rejection {
            Rejection::InstanceLimit(_) => warn!(%kind, reason = %rejection, "operation rejected"),
            _ => debug!(%kind, reason = %rejection, "operation rejected"),
        }
        false
    }
}

impl<K: OperationKind> fmt::Display for OperationManager<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();

        let mut outstanding: Vec<(&K, &Outstanding)> = inner.outstanding.iter().collect();
        outstanding.sort_by_key(|(kind, _)| kind.ordinal());
        let mut disallowed: Vec<&K> = inner.disallowed.iter().collect();
        disallowed.sort_by_key(|kind| kind.ordinal());

        write!(f, "{} [", inner.state)?;
        for (index, (kind, record)) in outstanding.iter().enumerate() {
            if index > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}@{}", kind, record.started_at_ms)?;
            if matches!(record.tracking, Tracking::Multi { .. }) {
                write!(f, "x{}", record.tracking.instances())?;
            }
            if record.cancel_requested {
                write!(f, "(cancelling)")?;
            }
        }
        write!(f, "]")?;

        if !disallowed.is_empty() {
            write!(f, " disallowed [")?;
            for (index, kind) in disallowed.iter().enumerate() {
                if index > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}", kind)?;
            }
            write!(f, "]")?;
        }
        Ok(())
    }
}

impl<K: OperationKind> fmt::Debug for OperationManager<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationManager")
            .field("state", &self.state())
            .field("outstanding", &self.outstanding_count())
            .field("instances_count_max", &self.instances_count_max)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation_kind::ApiName;
    use failover_core::ManualClock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn manager() -> (OperationManager<ApiName>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000));
        let manager = OperationManager::new(Arc::new(ApiName::replicator_table()), clock.clone());
        (manager, clock)
    }

    fn counting_handle(counter: &Arc<AtomicUsize>) -> CancelHandle {
        let counter = counter.clone();
        cancel_handle(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_starts_opened() {
        let (manager, _) = manager();
        assert_eq!(manager.state(), ManagerState::Opened);
        assert_eq!(manager.outstanding_count(), 0);
        assert!(manager.can_start(ApiName::Open));
    }

    #[test]
    fn test_incompatible_until_finish() {
        let (manager, clock) = manager();

        assert!(manager.try_start(ApiName::ChangeRole, None));
        assert!(!manager.can_start(ApiName::UpdateEpoch));
        assert!(!manager.try_start(ApiName::UpdateEpoch, None));
        assert!(!manager.is_operation_running(ApiName::UpdateEpoch));

        clock.advance(250);
        let record = manager.finish(ApiName::ChangeRole);
        assert_eq!(record.kind, ApiName::ChangeRole);
        assert_eq!(record.duration_ms(), 250);
        assert_eq!(record.remaining_instances, 0);

        assert!(manager.try_start(ApiName::UpdateEpoch, None));
    }

    #[test]
    fn test_compatible_kinds_overlap() {
        let (manager, _) = manager();

        assert!(manager.try_start(ApiName::BuildReplica, None));
        assert!(manager.try_start(ApiName::RemoveReplica, None));
        assert!(manager.try_start(ApiName::GetQuery, None));
        assert_eq!(manager.outstanding_count(), 3);
    }

    #[test]
    fn test_same_kind_single_instance_rejected() {
        let (manager, _) = manager();
        assert!(manager.try_start(ApiName::GetStatus, None));
        assert!(!manager.try_start(ApiName::GetStatus, None));
    }

    #[test]
    fn test_graceful_close_admits_only_close() {
        let (manager, _) = manager();
        manager.close_for_business(false);

        assert_eq!(manager.state(), ManagerState::Closed);
        for kind in ApiName::ALL {
            assert_eq!(manager.can_start(*kind), *kind == ApiName::Close, "{}", kind);
        }
        assert!(manager.try_start(ApiName::Close, None));
        assert!(!manager.try_start(ApiName::Abort, None));
    }

    #[test]
    fn test_abort_admits_nothing() {
        let (manager, _) = manager();
        manager.close_for_business(true);

        assert_eq!(manager.state(), ManagerState::Aborted);
        for kind in ApiName::ALL {
            assert!(!manager.try_start(*kind, None), "{}", kind);
        }
    }

    #[test]
    fn test_close_idempotent_and_abort_not_downgraded() {
        let (manager, _) = manager();

        manager.close_for_business(false);
        manager.close_for_business(false);
        assert_eq!(manager.state(), ManagerState::Closed);

        manager.close_for_business(true);
        assert_eq!(manager.state(), ManagerState::Aborted);

        manager.close_for_business(false);
        assert_eq!(manager.state(), ManagerState::Aborted);
    }

    #[test]
    fn test_reopen_after_close() {
        let (manager, _) = manager();
        manager.cancel_or_mark_for_cancel(ApiName::ReportLoad);
        manager.close_for_business(true);

        manager.open_for_business();
        assert_eq!(manager.state(), ManagerState::Opened);
        // Reopening clears kinds marked for cancel
        assert!(manager.try_start(ApiName::ReportLoad, None));
    }

    #[test]
    #[should_panic(expected = "reopened with 1 outstanding operations")]
    fn test_reopen_with_outstanding_panics() {
        let (manager, _) = manager();
        assert!(manager.try_start(ApiName::Open, None));
        manager.close_for_business(false);
        manager.open_for_business();
    }

    #[test]
    #[should_panic(expected = "not outstanding")]
    fn test_finish_unknown_panics() {
        let (manager, _) = manager();
        manager.finish(ApiName::ChangeRole);
    }

    #[test]
    fn test_cancel_operations_after_close() {
        let (manager, _) = manager();
        let cancels = Arc::new(AtomicUsize::new(0));

        assert!(manager.try_start(ApiName::BuildReplica, Some(counting_handle(&cancels))));
        assert!(manager.try_start(ApiName::RemoveReplica, Some(counting_handle(&cancels))));
        manager.close_for_business(false);

        assert_eq!(manager.cancel_operations(), 2);
        assert_eq!(cancels.load(Ordering::SeqCst), 2);

        // At most once per outstanding operation
        assert_eq!(manager.cancel_operations(), 0);
        assert_eq!(cancels.load(Ordering::SeqCst), 2);
        assert!(manager.to_string().contains("(cancelling)"));
    }

    #[test]
    fn test_cancel_operations_spares_admitted_kinds() {
        let (manager, _) = manager();
        let cancels = Arc::new(AtomicUsize::new(0));

        assert!(manager.try_start(ApiName::Close, Some(counting_handle(&cancels))));
        manager.close_for_business(false);

        assert_eq!(manager.cancel_operations(), 0);
        assert_eq!(cancels.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_cancel_handle_may_reenter_manager() {
        let clock = Arc::new(ManualClock::new(0));
        let manager = Arc::new(OperationManager::new(
            Arc::new(ApiName::service_table()),
            clock,
        ));

        let reentrant = {
            let manager = manager.clone();
            cancel_handle(move || {
                manager.finish(ApiName::ChangeRole);
            })
        };
        assert!(manager.try_start(ApiName::ChangeRole, Some(reentrant)));

        assert!(manager.cancel_or_mark_for_cancel(ApiName::ChangeRole));
        assert!(!manager.is_operation_running(ApiName::ChangeRole));
    }

    #[test]
    fn test_mark_for_cancel_blocks_until_removed() {
        let (manager, _) = manager();
        let cancels = Arc::new(AtomicUsize::new(0));

        assert!(manager.try_start(ApiName::CatchupReplicaSet, Some(counting_handle(&cancels))));
        assert!(manager.cancel_or_mark_for_cancel(ApiName::CatchupReplicaSet));
        assert!(!manager.cancel_or_mark_for_cancel(ApiName::CatchupReplicaSet));
        assert_eq!(cancels.load(Ordering::SeqCst), 1);

        manager.finish(ApiName::CatchupReplicaSet);
        assert!(!manager.try_start(ApiName::CatchupReplicaSet, None));
        assert!(!manager.try_continue(ApiName::CatchupReplicaSet, None));

        assert!(manager.remove_operation_for_cancel(ApiName::CatchupReplicaSet));
        assert!(!manager.remove_operation_for_cancel(ApiName::CatchupReplicaSet));
        assert!(manager.try_start(ApiName::CatchupReplicaSet, None));
    }

    #[test]
    fn test_try_continue_attaches_handle() {
        let (manager, _) = manager();
        let cancels = Arc::new(AtomicUsize::new(0));

        assert!(manager.try_start(ApiName::Open, None));
        assert!(manager.try_continue(ApiName::Open, Some(counting_handle(&cancels))));
        assert_eq!(manager.outstanding_count(), 1);

        manager.close_for_business(true);
        assert!(!manager.try_continue(ApiName::Open, None));
        assert_eq!(manager.cancel_operations(), 1);
        assert_eq!(cancels.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_try_continue_records_missing_kind() {
        let (manager, clock) = manager();
        clock.advance(5);

        assert!(manager.try_continue(ApiName::ChangeRole, None));
        let record = manager.finish(ApiName::ChangeRole);
        assert_eq!(record.started_at_ms, 1_005);
    }

    #[test]
    fn test_multi_instance_counting() {
        let (manager, _) = manager();
        let cancels = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            assert!(manager
                .try_start_multi_instance(ApiName::GetStatus, Some(counting_handle(&cancels))));
        }
        assert!(!manager.try_start(ApiName::GetStatus, None));
        assert_eq!(manager.to_string(), "opened [get_status@1000x3]");

        assert_eq!(manager.finish_multi_instance(ApiName::GetStatus).remaining_instances, 2);
        assert_eq!(manager.finish_multi_instance(ApiName::GetStatus).remaining_instances, 1);
        assert!(manager.is_operation_running(ApiName::GetStatus));

        // One signal reaches every attached handle
        manager.cancel_or_mark_for_cancel(ApiName::GetStatus);
        assert_eq!(cancels.load(Ordering::SeqCst), 3);

        assert_eq!(manager.finish_multi_instance(ApiName::GetStatus).remaining_instances, 0);
        assert!(!manager.is_operation_running(ApiName::GetStatus));
    }

    #[test]
    fn test_cancel_operations_signals_every_instance_once() {
        let (manager, _) = manager();
        let cancels = Arc::new(AtomicUsize::new(0));

        assert!(manager
            .try_start_multi_instance(ApiName::BuildReplica, Some(counting_handle(&cancels))));
        assert!(manager
            .try_start_multi_instance(ApiName::BuildReplica, Some(counting_handle(&cancels))));
        assert!(manager
            .try_continue_multi_instance(ApiName::BuildReplica, Some(counting_handle(&cancels))));
        manager.close_for_business(false);

        // One record, three attached handles
        assert_eq!(manager.cancel_operations(), 1);
        assert_eq!(cancels.load(Ordering::SeqCst), 3);

        assert_eq!(manager.cancel_operations(), 0);
        assert_eq!(cancels.load(Ordering::SeqCst), 3);
        assert_eq!(manager.to_string(), "closed [build_replica@1000x2(cancelling)]");
    }

    #[test]
    fn test_try_continue_multi_instance_records_missing_kind() {
        let (manager, clock) = manager();
        clock.advance(20);

        assert!(manager.try_continue_multi_instance(ApiName::ReportLoad, None));
        assert!(manager.is_operation_running(ApiName::ReportLoad));
        assert_eq!(manager.to_string(), "opened [report_load@1020x1]");

        clock.advance(5);
        let record = manager.finish_multi_instance(ApiName::ReportLoad);
        assert_eq!(record.remaining_instances, 0);
        assert_eq!(record.started_at_ms, 1_020);
        assert_eq!(record.duration_ms(), 5);
        assert!(!manager.is_operation_running(ApiName::ReportLoad));
        assert_eq!(manager.outstanding_count(), 0);
    }

    #[test]
    #[should_panic(expected = "continued multi-instance operation get_status as single")]
    fn test_continue_multi_as_single_panics() {
        let (manager, _) = manager();
        assert!(manager.try_start_multi_instance(ApiName::GetStatus, None));
        manager.try_continue(ApiName::GetStatus, None);
    }

    #[test]
    #[should_panic(expected = "continued single-instance operation get_status as multi")]
    fn test_continue_single_as_multi_panics() {
        let (manager, _) = manager();
        assert!(manager.try_start(ApiName::GetStatus, None));
        manager.try_continue_multi_instance(ApiName::GetStatus, None);
    }

    #[test]
    #[should_panic(expected = "finished single-instance operation get_status as multi")]
    fn test_finish_single_as_multi_panics() {
        let (manager, _) = manager();
        assert!(manager.try_start(ApiName::GetStatus, None));
        manager.finish_multi_instance(ApiName::GetStatus);
    }

    #[test]
    #[should_panic(expected = "finished multi-instance operation get_status as single")]
    fn test_finish_multi_as_single_panics() {
        let (manager, _) = manager();
        assert!(manager.try_start_multi_instance(ApiName::GetStatus, None));
        manager.finish(ApiName::GetStatus);
    }

    #[test]
    fn test_multi_instance_respects_compatibility_and_limit() {
        let clock = Arc::new(ManualClock::new(0));
        let config = OperationConfig {
            instances_count_max: 2,
        };
        let manager =
            OperationManager::with_config(Arc::new(ApiName::replicator_table()), clock, &config);

        assert!(manager.try_start(ApiName::ChangeRole, None));
        assert!(!manager.try_start_multi_instance(ApiName::BuildReplica, None));
        manager.finish(ApiName::ChangeRole);

        assert!(manager.try_start_multi_instance(ApiName::BuildReplica, None));
        assert!(manager.try_start_multi_instance(ApiName::BuildReplica, None));
        assert!(!manager.try_start_multi_instance(ApiName::BuildReplica, None));
        assert!(manager.try_continue_multi_instance(ApiName::BuildReplica, None));
        assert!(manager.try_start(ApiName::RemoveReplica, None));
    }

    #[test]
    fn test_details_for_query() {
        let (manager, clock) = manager();
        assert!(manager.details_for_query().is_empty());
        assert_eq!(manager.name_for_query(), None);

        assert!(manager.try_start(ApiName::RemoveReplica, None));
        clock.advance(10);
        assert!(manager.try_start(ApiName::BuildReplica, None));

        let details = manager.details_for_query();
        assert_eq!(details.kinds, vec![ApiName::BuildReplica, ApiName::RemoveReplica]);
        assert_eq!(details.started_at_ms, Some(1_000));
        assert_eq!(manager.name_for_query(), Some(ApiName::RemoveReplica));

        manager.close_for_business(false);
        assert!(manager.details_for_query().is_empty());
    }

    #[test]
    fn test_display_lists_disallowed() {
        let (manager, _) = manager();
        manager.cancel_or_mark_for_cancel(ApiName::OnDataLoss);
        assert_eq!(manager.to_string(), "opened [] disallowed [on_data_loss]");
    }
}
