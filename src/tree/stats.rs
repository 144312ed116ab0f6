use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use serde::Serialize;

/// Snapshot of tree statistics at a point in time.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StrataStatsSnapshot {
    /// Pages read from storage into the cache
    pub page_loads: u64,
    /// Unreferenced pages evicted from the cache
    pub evictions: u64,
    /// Balance passes that found work to do
    pub balance_passes: u64,
    /// Leaf page splits
    pub leaf_splits: u64,
    /// Branch page splits
    pub branch_splits: u64,
    /// Leaf page merges
    pub leaf_merges: u64,
    /// Branch page merges
    pub branch_merges: u64,
    /// Root splits that added a level
    pub root_drains: u64,
    /// Root collapses that removed a level
    pub root_fills: u64,
    /// Ghost records purged from leaves
    pub ghost_deletions: u64,
    /// Planned operations abandoned because the tree changed underneath
    pub aborted_operations: u64,
}

/// Thread-safe statistics for the cache and the balancer.
#[derive(Default)]
pub struct StrataStats {
    page_loads: AtomicU64,
    evictions: AtomicU64,
    balance_passes: AtomicU64,
    leaf_splits: AtomicU64,
    branch_splits: AtomicU64,
    leaf_merges: AtomicU64,
    branch_merges: AtomicU64,
    root_drains: AtomicU64,
    root_fills: AtomicU64,
    ghost_deletions: AtomicU64,
    aborted_operations: AtomicU64,
}

impl StrataStats {
    /// Returns the number of pages loaded from storage.
    pub fn page_loads(&self) -> u64 {
        self.page_loads.load(AtomicOrdering::Relaxed)
    }

    /// Returns the number of leaf splits.
    pub fn leaf_splits(&self) -> u64 {
        self.leaf_splits.load(AtomicOrdering::Relaxed)
    }

    /// Returns the number of leaf merges.
    pub fn leaf_merges(&self) -> u64 {
        self.leaf_merges.load(AtomicOrdering::Relaxed)
    }

    pub(crate) fn inc_page_loads(&self) {
        self.page_loads.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn add_evictions(&self, count: usize) {
        self.evictions.fetch_add(count as u64, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_balance_passes(&self) {
        self.balance_passes.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_leaf_splits(&self) {
        self.leaf_splits.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_branch_splits(&self) {
        self.branch_splits.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_leaf_merges(&self) {
        self.leaf_merges.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_branch_merges(&self) {
        self.branch_merges.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_root_drains(&self) {
        self.root_drains.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_root_fills(&self) {
        self.root_fills.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_ghost_deletions(&self) {
        self.ghost_deletions.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_aborted_operations(&self) {
        self.aborted_operations
            .fetch_add(1, AtomicOrdering::Relaxed);
    }

    /// Creates a snapshot of all current statistics.
    pub fn snapshot(&self) -> StrataStatsSnapshot {
        StrataStatsSnapshot {
            page_loads: self.page_loads(),
            evictions: self.evictions.load(AtomicOrdering::Relaxed),
            balance_passes: self.balance_passes.load(AtomicOrdering::Relaxed),
            leaf_splits: self.leaf_splits(),
            branch_splits: self.branch_splits.load(AtomicOrdering::Relaxed),
            leaf_merges: self.leaf_merges(),
            branch_merges: self.branch_merges.load(AtomicOrdering::Relaxed),
            root_drains: self.root_drains.load(AtomicOrdering::Relaxed),
            root_fills: self.root_fills.load(AtomicOrdering::Relaxed),
            ghost_deletions: self.ghost_deletions.load(AtomicOrdering::Relaxed),
            aborted_operations: self.aborted_operations.load(AtomicOrdering::Relaxed),
        }
    }

    /// Emits current statistics to the tracing infrastructure.
    pub fn emit_tracing(&self) {
        let snapshot = self.snapshot();
        tracing::info!(
            target: "strata::stats",
            page_loads = snapshot.page_loads,
            evictions = snapshot.evictions,
            balance_passes = snapshot.balance_passes,
            leaf_splits = snapshot.leaf_splits,
            branch_splits = snapshot.branch_splits,
            leaf_merges = snapshot.leaf_merges,
            branch_merges = snapshot.branch_merges,
            root_drains = snapshot.root_drains,
            root_fills = snapshot.root_fills,
            ghost_deletions = snapshot.ghost_deletions,
            aborted_operations = snapshot.aborted_operations,
            "strata stats snapshot"
        );
    }
}
