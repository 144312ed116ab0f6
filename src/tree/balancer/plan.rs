//! Gathering leaf summaries and turning them into a plan.

use std::collections::{BTreeMap, BTreeSet};

use super::Operation;
use crate::error::{Result, StrataError};
use crate::tree::descent::{Descent, Direction, Stop};
use crate::tree::locker::Locker;
use crate::tree::page::{Address, Page};
use crate::tree::sheaf::Sheaf;

/// Summary of one leaf, linked to its gathered neighbors by arena index.
#[derive(Debug)]
pub(crate) struct Node {
    pub(crate) address: Address,
    pub(crate) key: Option<Vec<u8>>,
    pub(crate) length: usize,
    pub(crate) ghost: bool,
    pub(crate) right_address: Option<Address>,
    pub(crate) left: Option<usize>,
    pub(crate) right: Option<usize>,
}

/// Leaf summaries collected by one pass.
#[derive(Debug, Default)]
pub(crate) struct Plan {
    nodes: Vec<Node>,
    ordered: BTreeMap<Address, usize>,
    ghosts: BTreeSet<Address>,
}

/// Operations in execution order, plus leaves to reconsider next pass.
#[derive(Debug, Default)]
pub(crate) struct Planned {
    pub(crate) operations: Vec<Operation>,
    pub(crate) remarks: Vec<Address>,
}

impl Plan {
    /// Summarizes a leaf, reusing an existing summary for the same address.
    pub(crate) fn summarize(&mut self, page: &Page) -> usize {
        let address = page.address();
        if let Some(&index) = self.ordered.get(&address) {
            return index;
        }
        let key = if address == Address::FIRST_LEAF {
            None
        } else {
            page.first_key().map(<[u8]>::to_vec)
        };
        let ghost = page.ghosts() > 0;
        if ghost {
            self.ghosts.insert(address);
        }
        self.nodes.push(Node {
            address,
            key,
            length: page.length(),
            ghost,
            right_address: page.right(),
            left: None,
            right: None,
        });
        let index = self.nodes.len() - 1;
        self.ordered.insert(address, index);
        index
    }

    pub(crate) fn node(&self, address: Address) -> Option<&Node> {
        self.ordered.get(&address).map(|&index| &self.nodes[index])
    }

    pub(crate) fn link(&mut self, left: usize, right: usize) {
        self.nodes[left].right = Some(right);
        self.nodes[right].left = Some(left);
    }

    fn unlink(&mut self, node: usize) {
        if let Some(left) = self.nodes[node].left.take() {
            self.nodes[left].right = None;
        }
        if let Some(right) = self.nodes[node].right.take() {
            self.nodes[right].left = None;
        }
    }

    /// Cuts the link to the right of `node`, returning the detached node.
    fn terminate(&mut self, node: usize) -> Option<usize> {
        let right = self.nodes[node].right.take();
        if let Some(right) = right {
            self.nodes[right].left = None;
        }
        right
    }

    /// Plans splits for oversized leaves, merges for adjacent pairs that fit
    /// in one leaf, and ghost deletions for the remaining ghosted leaves.
    ///
    /// Merges pair neighbors two at a time; a chain of small leaves takes
    /// several passes to collapse. Empty leaves that could not be paired are
    /// returned for reconsideration.
    pub(crate) fn operations(mut self, lengths: &BTreeMap<Address, usize>, leaf_size: usize) -> Planned {
        let mut planned = Planned::default();
        let mut involved = BTreeSet::new();

        for address in lengths.keys() {
            let Some(&node) = self.ordered.get(address) else {
                continue;
            };
            if self.nodes[node].length > leaf_size {
                planned.operations.push(Operation::SplitLeaf {
                    address: *address,
                    key: self.nodes[node].key.clone(),
                    had_ghost: self.nodes[node].ghost,
                });
                self.ghosts.remove(address);
                self.unlink(node);
                involved.insert(*address);
            }
        }

        let heads: Vec<usize> = self
            .ordered
            .values()
            .copied()
            .filter(|&node| {
                self.nodes[node].left.is_none() && !involved.contains(&self.nodes[node].address)
            })
            .collect();
        for head in heads {
            let mut cursor = Some(head);
            while let Some(node) = cursor {
                let Some(right) = self.nodes[node].right else {
                    break;
                };
                if self.nodes[node].length + self.nodes[right].length > leaf_size {
                    cursor = self.terminate(node);
                    continue;
                }
                cursor = self.terminate(right);
                let (left, right) = (&self.nodes[node], &self.nodes[right]);
                let Some(right_key) = right.key.clone() else {
                    continue;
                };
                planned.operations.push(Operation::MergeLeaves {
                    left: left.address,
                    right: right.address,
                    left_key: left.key.clone(),
                    right_key,
                    left_ghost: left.ghost,
                });
                let pair = [left.address, right.address];
                for address in pair {
                    self.ghosts.remove(&address);
                    involved.insert(address);
                }
            }
        }

        for address in &self.ghosts {
            let node = &self.nodes[self.ordered[address]];
            if node.length == 0 {
                continue;
            }
            if let Some(key) = node.key.clone() {
                planned.operations.push(Operation::DeleteGhost { key });
                involved.insert(*address);
            }
        }

        for address in lengths.keys() {
            let Some(node) = self.node(*address) else {
                continue;
            };
            if node.length == 0 && *address != Address::FIRST_LEAF && !involved.contains(address) {
                planned.remarks.push(*address);
            }
        }
        planned
    }
}

/// Summarizes every recorded leaf whose length dropped, together with its
/// left and right neighbors, holding each page only while reading it.
pub(crate) fn gather(sheaf: &Sheaf, lengths: &BTreeMap<Address, usize>) -> Result<Plan> {
    let mut plan = Plan::default();
    let mut locker = sheaf.locker();
    let outcome = gather_into(sheaf, &mut locker, lengths, &mut plan);
    locker.dispose();
    outcome.map(|()| plan)
}

fn gather_into(
    sheaf: &Sheaf,
    locker: &mut Locker<'_>,
    lengths: &BTreeMap<Address, usize>,
    plan: &mut Plan,
) -> Result<()> {
    for (&address, &recorded) in lengths {
        let Some(node) = visit(sheaf, locker, plan, address)? else {
            continue;
        };
        if plan.nodes[node].length >= recorded {
            continue;
        }
        if address != Address::FIRST_LEAF && plan.nodes[node].left.is_none() {
            if let Some(key) = plan.nodes[node].key.clone() {
                let left = left_neighbor(locker, plan, &key)?;
                plan.link(left, node);
            }
        }
        if plan.nodes[node].right.is_none() {
            if let Some(right_address) = plan.nodes[node].right_address {
                if let Some(right) = visit(sheaf, locker, plan, right_address)? {
                    plan.link(node, right);
                }
            }
        }
    }
    Ok(())
}

/// Summarizes the leaf at `address`. A leaf merged away since it was
/// recorded yields `None`, and the empty cache entry the attempt to load it
/// left behind is evicted.
fn visit(
    sheaf: &Sheaf,
    locker: &mut Locker<'_>,
    plan: &mut Plan,
    address: Address,
) -> Result<Option<usize>> {
    if let Some(&node) = plan.ordered.get(&address) {
        return Ok(Some(node));
    }
    match locker.lock(address, false) {
        Ok(()) => {}
        Err(StrataError::NotFound(_)) => {
            sheaf.evict(address);
            return Ok(None);
        }
        Err(err) => return Err(err),
    }
    let page = locker.page(address);
    let node = (!page.is_deleted()).then(|| plan.summarize(page));
    locker.unlock(address);
    Ok(node)
}

/// Finds the leaf to the left of the leaf whose pivot is `key`.
fn left_neighbor(locker: &mut Locker<'_>, plan: &mut Plan, key: &[u8]) -> Result<usize> {
    let mut descent = Descent::new(locker)?;
    let keys = [key.to_vec()];
    let outcome = descend_left(&mut descent, locker, key, &keys);
    let node = outcome.map(|()| plan.summarize(locker.page(descent.page())));
    descent.release(locker);
    node
}

fn descend_left(
    descent: &mut Descent,
    locker: &mut Locker<'_>,
    key: &[u8],
    keys: &[Vec<u8>],
) -> Result<()> {
    descent.descend(locker, Direction::Key(key), Stop::Found(keys))?;
    let index = descent.index();
    descent.set_index(index - 1);
    descent.descend(locker, Direction::Rightmost, Stop::Leaf)
}
