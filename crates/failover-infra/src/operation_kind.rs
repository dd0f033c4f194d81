//! Operation kinds and their compatibility matrix
//!
//! TigerStyle: A closed set of kinds, a precomputed boolean matrix, no
//! lookups that can fail at runtime.
//!
//! `compatible(running, candidate)` answers whether `candidate` may start
//! while an operation of kind `running` is outstanding. The matrix is built
//! once at startup and shared read-only by every `OperationManager`.

use failover_core::OPERATION_KINDS_COUNT_MAX;
use std::fmt;
use std::hash::Hash;

/// A finite, closed set of operation identifiers
pub trait OperationKind:
    Copy + Eq + Hash + fmt::Debug + fmt::Display + Send + Sync + 'static
{
    /// Every kind, ordered by `ordinal()`
    const ALL: &'static [Self];

    /// Dense index of this kind in `ALL`
    fn ordinal(self) -> usize;

    /// Stable name used in logs and metric labels
    fn as_str(self) -> &'static str;
}

// =============================================================================
// ApiName
// =============================================================================

/// API calls made against a single replica
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ApiName {
    Open,
    Close,
    Abort,
    ChangeRole,
    CatchupReplicaSet,
    BuildReplica,
    RemoveReplica,
    UpdateEpoch,
    GetStatus,
    UpdateCatchupConfiguration,
    UpdateCurrentConfiguration,
    OnDataLoss,
    ReportLoad,
    GetQuery,
}

impl ApiName {
    /// Kinds that may overlap with any other kind
    const UNRESTRICTED: [ApiName; 4] = [
        ApiName::Abort,
        ApiName::GetStatus,
        ApiName::ReportLoad,
        ApiName::GetQuery,
    ];

    /// Compatibility matrix for calls into a replicator
    ///
    /// Replica builds and removals overlap with each other and with catch-up
    /// and configuration updates. Everything else runs alone.
    pub fn replicator_table() -> CompatibilityTable<ApiName> {
        let mut table = Self::base_table();

        table.allow_symmetric(ApiName::BuildReplica, ApiName::BuildReplica);
        table.allow_symmetric(ApiName::BuildReplica, ApiName::RemoveReplica);
        table.allow_symmetric(ApiName::RemoveReplica, ApiName::RemoveReplica);

        for update in [
            ApiName::UpdateCatchupConfiguration,
            ApiName::UpdateCurrentConfiguration,
            ApiName::CatchupReplicaSet,
        ] {
            table.allow_symmetric(update, ApiName::BuildReplica);
            table.allow_symmetric(update, ApiName::RemoveReplica);
        }

        table
    }

    /// Compatibility matrix for calls into a service implementation
    pub fn service_table() -> CompatibilityTable<ApiName> {
        Self::base_table()
    }

    fn base_table() -> CompatibilityTable<ApiName> {
        let mut table = CompatibilityTable::new().with_close_kind(ApiName::Close);
        for kind in Self::UNRESTRICTED {
            table.allow_everything(kind);
        }
        table
    }
}

impl OperationKind for ApiName {
    const ALL: &'static [Self] = &[
        ApiName::Open,
        ApiName::Close,
        ApiName::Abort,
        ApiName::ChangeRole,
        ApiName::CatchupReplicaSet,
        ApiName::BuildReplica,
        ApiName::RemoveReplica,
        ApiName::UpdateEpoch,
        ApiName::GetStatus,
        ApiName::UpdateCatchupConfiguration,
        ApiName::UpdateCurrentConfiguration,
        ApiName::OnDataLoss,
        ApiName::ReportLoad,
        ApiName::GetQuery,
    ];

    fn ordinal(self) -> usize {
        self as usize
    }

    fn as_str(self) -> &'static str {
        match self {
            ApiName::Open => "open",
            ApiName::Close => "close",
            ApiName::Abort => "abort",
            ApiName::ChangeRole => "change_role",
            ApiName::CatchupReplicaSet => "catchup_replica_set",
            ApiName::BuildReplica => "build_replica",
            ApiName::RemoveReplica => "remove_replica",
            ApiName::UpdateEpoch => "update_epoch",
            ApiName::GetStatus => "get_status",
            ApiName::UpdateCatchupConfiguration => "update_catchup_configuration",
            ApiName::UpdateCurrentConfiguration => "update_current_configuration",
            ApiName::OnDataLoss => "on_data_loss",
            ApiName::ReportLoad => "report_load",
            ApiName::GetQuery => "get_query",
        }
    }
}

impl fmt::Display for ApiName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// CompatibilityTable
// =============================================================================

/// Boolean matrix over `(running, candidate)` pairs
///
/// Starts with every pair incompatible; the builder methods open pairs up.
#[derive(Clone, PartialEq, Eq)]
pub struct CompatibilityTable<K: OperationKind> {
    allowed: Vec<bool>,
    close_kind: Option<K>,
}

impl<K: OperationKind> CompatibilityTable<K> {
    /// Create a table where no two kinds may overlap
    pub fn new() -> Self {
        let count = K::ALL.len();
        assert!(count > 0, "operation kind set must not be empty");
        assert!(
            count <= OPERATION_KINDS_COUNT_MAX,
            "too many operation kinds: {} > {}",
            count,
            OPERATION_KINDS_COUNT_MAX
        );
        for (index, kind) in K::ALL.iter().enumerate() {
            assert_eq!(kind.ordinal(), index, "ordinal of {} out of order", kind);
        }

        Self {
            allowed: vec![false; count * count],
            close_kind: None,
        }
    }

    /// Designate the kind admitted after a graceful close
    pub fn with_close_kind(mut self, kind: K) -> Self {
        self.close_kind = Some(kind);
        self
    }

    /// Kind admitted after a graceful close, if any
    pub fn close_kind(&self) -> Option<K> {
        self.close_kind
    }

    /// Allow `candidate` to start while `running` is outstanding
    pub fn allow(&mut self, running: K, candidate: K) -> &mut Self {
        let index = Self::index(running, candidate);
        self.allowed[index] = true;
        self
    }

    /// Allow `a` and `b` to overlap in either order
    pub fn allow_symmetric(&mut self, a: K, b: K) -> &mut Self {
        self.allow(a, b);
        self.allow(b, a)
    }

    /// Allow `kind` to overlap with every kind, itself included
    pub fn allow_everything(&mut self, kind: K) -> &mut Self {
        for other in K::ALL {
            self.allow_symmetric(kind, *other);
        }
        self
    }

    /// Whether `candidate` may start while `running` is outstanding
    pub fn compatible(&self, running: K, candidate: K) -> bool {
        self.allowed[Self::index(running, candidate)]
    }

    fn index(running: K, candidate: K) -> usize {
        running.ordinal() * K::ALL.len() + candidate.ordinal()
    }
}

impl<K: OperationKind> Default for CompatibilityTable<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: OperationKind> fmt::Debug for CompatibilityTable<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pairs: Vec<(K, K)> = K::ALL
            .iter()
            .flat_map(|running| K::ALL.iter().map(move |candidate| (*running, *candidate)))
            .filter(|(running, candidate)| self.compatible(*running, *candidate))
            .collect();
        f.debug_struct("CompatibilityTable")
            .field("close_kind", &self.close_kind)
            .field("allowed", &pairs)
            .finish()
    }
}
