//! Deferred structural maintenance.
//!
//! Foreground writes only record which leaves changed size. A balance pass
//! snapshots those records, gathers the affected leaves and their neighbors,
//! plans splits, merges and ghost deletions, then executes the plan one
//! operation at a time. Each operation takes its own locks, makes its page
//! images durable, and only then installs them in memory. Operations may
//! queue a follow-up that runs before the rest of the plan.

mod ghost;
mod merge;
mod plan;
mod session;
mod split;

use std::collections::{BTreeMap, VecDeque};

use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use super::page::Address;
use super::sheaf::Sheaf;
use crate::error::{Result, StrataError};

use plan::gather;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Idle,
    Gathering,
    Planning,
    Executing,
}

/// One planned or follow-up structural change.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Operation {
    SplitLeaf {
        address: Address,
        key: Option<Vec<u8>>,
        had_ghost: bool,
    },
    SplitBranch {
        address: Address,
        key: Vec<u8>,
    },
    DrainRoot,
    MergeLeaves {
        left: Address,
        right: Address,
        left_key: Option<Vec<u8>>,
        right_key: Vec<u8>,
        left_ghost: bool,
    },
    ChooseBranchesToMerge {
        address: Address,
        key: Vec<u8>,
    },
    MergeBranches {
        address: Address,
        depth: i32,
        key: Vec<u8>,
    },
    FillRoot,
    DeleteGhost {
        key: Vec<u8>,
    },
}

impl Operation {
    fn execute(self, sheaf: &Sheaf) -> Result<Option<Operation>> {
        match self {
            Operation::SplitLeaf {
                address,
                key,
                had_ghost,
            } => split::split_leaf(sheaf, address, key, had_ghost),
            Operation::SplitBranch { address, key } => split::split_branch(sheaf, address, &key),
            Operation::DrainRoot => split::drain_root(sheaf),
            Operation::MergeLeaves {
                left,
                right,
                left_key,
                right_key,
                left_ghost,
            } => merge::merge_leaves(sheaf, left, right, left_key, &right_key, left_ghost),
            Operation::ChooseBranchesToMerge { address, key } => {
                merge::choose_branches_to_merge(sheaf, address, &key)
            }
            Operation::MergeBranches {
                address,
                depth,
                key,
            } => merge::merge_branches(sheaf, address, depth, &key),
            Operation::FillRoot => merge::fill_root(sheaf),
            Operation::DeleteGhost { key } => ghost::delete_ghost(sheaf, &key).map(|_| None),
        }
    }
}

/// Serializes balance passes over one tree.
pub(crate) struct Balancer {
    phase: Mutex<Phase>,
}

struct PhaseReset<'a>(&'a Mutex<Phase>);

impl Drop for PhaseReset<'_> {
    fn drop(&mut self) {
        *self.0.lock() = Phase::Idle;
    }
}

impl Balancer {
    pub(crate) fn new() -> Self {
        Self {
            phase: Mutex::new(Phase::Idle),
        }
    }

    /// Runs one pass over the leaves recorded since the previous pass.
    ///
    /// Returns `Ok(false)` when nothing was recorded. A pass already in
    /// progress is reported as [`StrataError::Balancing`]. When an operation
    /// fails, every leaf of the snapshot is recorded again so a later pass
    /// retries.
    pub(crate) fn balance(&self, sheaf: &Sheaf) -> Result<bool> {
        {
            let mut phase = self.phase.lock();
            if *phase != Phase::Idle {
                return Err(StrataError::Balancing);
            }
            *phase = Phase::Gathering;
        }
        let _reset = PhaseReset(&self.phase);

        let lengths = sheaf.take_lengths();
        if lengths.is_empty() {
            return Ok(false);
        }
        sheaf.stats.inc_balance_passes();
        let outcome = self.pass(sheaf, &lengths);
        if let Err(err) = &outcome {
            warn!(error = %err, candidates = lengths.len(), "balancer.pass_failed");
            for address in lengths.keys() {
                sheaf.mark(*address);
            }
        }
        sheaf.trim();
        outcome.map(|()| true)
    }

    fn enter(&self, phase: Phase) {
        *self.phase.lock() = phase;
    }

    fn pass(&self, sheaf: &Sheaf, lengths: &BTreeMap<Address, usize>) -> Result<()> {
        let plan = gather(sheaf, lengths)?;

        self.enter(Phase::Planning);
        let planned = plan.operations(lengths, sheaf.options.leaf_size);
        for address in &planned.remarks {
            sheaf.mark(*address);
        }
        let remarked = planned.remarks.len();
        debug!(
            operations = planned.operations.len(),
            remarked,
            "balancer.plan"
        );

        self.enter(Phase::Executing);
        let mut queue: VecDeque<Operation> = planned.operations.into();
        let mut executed = 0usize;
        while let Some(operation) = queue.pop_front() {
            trace!(?operation, "balancer.execute");
            if let Some(next) = operation.execute(sheaf)? {
                queue.push_front(next);
            }
            executed += 1;
            sheaf.trim();
        }
        info!(
            candidates = lengths.len(),
            executed,
            remarked,
            "balancer.pass"
        );
        Ok(())
    }
}

/// Records an abandoned operation and puts its leaves back on the
/// candidate list.
fn abandon(sheaf: &Sheaf, reason: &str, leaves: &[Address]) {
    warn!(reason, ?leaves, "balancer.abandon");
    sheaf.stats.inc_aborted_operations();
    for address in leaves {
        sheaf.mark(*address);
    }
}

/// Page counts and per-page sizes for splitting `length` items into pages
/// of at most `bound`. Earlier pages take the remainder.
fn partition(length: usize, bound: usize) -> Vec<usize> {
    let pages = length.div_ceil(bound);
    let records = length / pages;
    let remainder = length % pages;
    (0..pages)
        .map(|page| records + usize::from(page < remainder))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{merge, partition, Balancer, Phase};
    use crate::error::StrataError;
    use crate::storage::{Commit, MemoryStorage, Storage};
    use crate::tree::options::StrataOptions;
    use crate::tree::order::Order;
    use crate::tree::page::{Address, Item, Page};
    use crate::tree::sheaf::Sheaf;

    #[test]
    fn overlapping_pass_is_refused() {
        let sheaf = Sheaf::new(
            Arc::new(MemoryStorage::new()),
            Order::default(),
            StrataOptions::default(),
            Address::FIRST_LEAF,
        );
        let balancer = Balancer::new();
        *balancer.phase.lock() = Phase::Executing;
        assert!(matches!(balancer.balance(&sheaf), Err(StrataError::Balancing)));

        *balancer.phase.lock() = Phase::Idle;
        assert!(!balancer.balance(&sheaf).expect("idle balancer runs"));
        assert_eq!(*balancer.phase.lock(), Phase::Idle);
    }

    #[test]
    fn follow_up_for_a_branch_off_its_route_is_dropped() {
        let storage = Arc::new(MemoryStorage::new());
        let mut commit = Commit::new();
        commit.write(&Page::branch(
            Address::ROOT,
            vec![Item::child(None, Address::FIRST_LEAF)],
        ));
        commit.write(&Page::leaf(Address::FIRST_LEAF, Vec::new(), None));
        storage.commit(commit).expect("commit");
        let sheaf = Sheaf::new(
            storage,
            Order::default(),
            StrataOptions::default(),
            Address::FIRST_LEAF,
        );

        let next = merge::choose_branches_to_merge(&sheaf, Address(2), b"a")
            .expect("missed branch is not an error");
        assert_eq!(next, None);
        assert_eq!(sheaf.stats.snapshot().aborted_operations, 1);
    }

    #[test]
    fn partition_spreads_items_evenly() {
        assert_eq!(partition(6, 3), vec![3, 3]);
        assert_eq!(partition(7, 3), vec![3, 2, 2]);
        assert_eq!(partition(17, 16), vec![9, 8]);
        assert_eq!(partition(4, 3), vec![2, 2]);
    }
}
