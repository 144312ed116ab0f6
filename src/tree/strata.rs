use std::sync::Arc;

use tracing::{debug, info};

use super::balancer::Balancer;
use super::cursor::Cursor;
use super::locker::Locker;
use super::options::StrataOptions;
use super::order::Order;
use super::page::{Address, Item, Page};
use super::sheaf::Sheaf;
use super::stats::StrataStatsSnapshot;
use crate::error::{Result, StrataError};
use crate::storage::{Commit, Storage};

/// A persistent B+tree of records ordered by extracted keys.
///
/// Reads and writes lock single leaves; structural maintenance is deferred
/// to [`Strata::balance`], which may run on another thread while
/// foreground operations continue.
pub struct Strata {
    sheaf: Sheaf,
    balancer: Balancer,
}

/// Shape of the tree as seen by [`Strata::check`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Shape {
    /// Levels below the root; a root whose children are leaves has depth 1.
    pub depth: usize,
    /// Number of branch pages, root included.
    pub branches: usize,
    /// Item count of each branch, root first, in depth-first order.
    pub fanout: Vec<usize>,
    /// Live record keys of each leaf, left to right.
    pub leaves: Vec<Vec<Vec<u8>>>,
    /// Ghost count of each leaf, left to right.
    pub ghosts: Vec<usize>,
}

impl Shape {
    /// Total live records.
    pub fn records(&self) -> usize {
        self.leaves.iter().map(Vec::len).sum()
    }
}

impl Strata {
    /// Writes an empty tree (a root with one empty leaf) to fresh storage
    /// and opens it.
    pub fn create(storage: Arc<dyn Storage>, order: Order, options: StrataOptions) -> Result<Self> {
        options.validate()?;
        if storage.high_water()?.is_some() {
            return Err(StrataError::InvalidArgument(
                "storage already holds a tree".into(),
            ));
        }
        let mut commit = Commit::new();
        commit.write(&Page::branch(
            Address::ROOT,
            vec![Item::child(None, Address::FIRST_LEAF)],
        ));
        commit.write(&Page::leaf(Address::FIRST_LEAF, Vec::new(), None));
        storage.commit(commit)?;
        info!("strata.create");
        Self::open(storage, order, options)
    }

    /// Opens an existing tree.
    pub fn open(storage: Arc<dyn Storage>, order: Order, options: StrataOptions) -> Result<Self> {
        options.validate()?;
        let high_water = storage
            .high_water()?
            .ok_or(StrataError::NotFound(Address::ROOT))?;
        debug!(%high_water, "strata.open");
        Ok(Self {
            sheaf: Sheaf::new(storage, order, options, high_water),
            balancer: Balancer::new(),
        })
    }

    /// Options the tree was opened with.
    pub fn options(&self) -> &StrataOptions {
        &self.sheaf.options
    }

    /// Key order of the tree.
    pub fn order(&self) -> &Order {
        &self.sheaf.order
    }

    /// A fresh locker for driving descents directly.
    pub fn locker(&self) -> Locker<'_> {
        self.sheaf.locker()
    }

    /// Opens a cursor on the leaf covering `key`.
    pub fn cursor(&self, key: &[u8], exclusive: bool) -> Result<Cursor<'_>> {
        Cursor::open(&self.sheaf, Some(key), exclusive)
    }

    /// Opens a cursor on the first leaf.
    pub fn first(&self, exclusive: bool) -> Result<Cursor<'_>> {
        Cursor::open(&self.sheaf, None, exclusive)
    }

    /// Looks up the record stored under `key`.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let cursor = self.cursor(key, false)?;
        let record = cursor
            .index_of(key)
            .and_then(std::result::Result::ok)
            .and_then(|index| cursor.get(index))
            .map(<[u8]>::to_vec);
        Ok(record)
    }

    /// Inserts a record, replacing any record with the same key. Returns
    /// true when the record is new.
    pub fn insert(&self, record: impl Into<Vec<u8>>) -> Result<bool> {
        let record = record.into();
        let key = self.sheaf.order.extract(&record).to_vec();
        let mut cursor = self.cursor(&key, true)?;
        cursor.insert(record)
    }

    /// Removes the record stored under `key`, returning it.
    pub fn remove(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut cursor = self.cursor(key, true)?;
        match cursor.index_of(key) {
            Some(Ok(index)) => cursor.remove(index).map(Some),
            _ => Ok(None),
        }
    }

    /// Every live record in key order.
    pub fn records(&self) -> Result<Vec<Vec<u8>>> {
        let mut cursor = self.first(false)?;
        let mut records = Vec::new();
        loop {
            records.extend(
                cursor
                    .page()
                    .records()
                    .filter_map(Item::record_bytes)
                    .map(<[u8]>::to_vec),
            );
            if !cursor.next()? {
                return Ok(records);
            }
        }
    }

    /// Records a leaf as a balance candidate. Callers driving cursors
    /// directly use this after changing a page by other means.
    pub fn unbalanced(&self, page: &Page, force: bool) {
        self.sheaf.unbalanced(page, force);
    }

    /// Returns true when leaves are waiting for a balance pass.
    pub fn needs_balance(&self) -> bool {
        self.sheaf.has_candidates()
    }

    /// Runs one balance pass. Returns false when there was nothing to do.
    pub fn balance(&self) -> Result<bool> {
        self.balancer.balance(&self.sheaf)
    }

    /// Runs balance passes until none has work left.
    pub fn balance_fully(&self) -> Result<usize> {
        let mut passes = 0;
        while self.balance()? {
            passes += 1;
        }
        Ok(passes)
    }

    /// Evicts unreferenced pages until the cache heft is at most `heft`.
    pub fn purge(&self, heft: usize) -> usize {
        self.sheaf.purge(heft)
    }

    /// Current cache heft.
    pub fn heft(&self) -> usize {
        self.sheaf.heft()
    }

    /// Number of cached pages, the meta page included.
    pub fn cached(&self) -> usize {
        self.sheaf.cached()
    }

    /// Statistics gathered since the tree was opened.
    pub fn stats(&self) -> StrataStatsSnapshot {
        self.sheaf.stats.snapshot()
    }

    /// Emits statistics through `tracing`.
    pub fn emit_stats(&self) {
        self.sheaf.stats.emit_tracing();
    }

    /// Walks the whole tree under shared locks and verifies its structure:
    /// branch keys ascend, every pivot equals the first key of the leftmost
    /// leaf beneath it, branches below the root hold at most `branch_size`
    /// items, leaves sit at one depth, records ascend across the leaf chain,
    /// and the chain visits leaves in tree order.
    pub fn check(&self) -> Result<Shape> {
        let mut locker = self.sheaf.locker();
        let mut walk = Walk {
            order: &self.sheaf.order,
            branch_size: self.sheaf.options.branch_size,
            shape: Shape::default(),
            rights: Vec::new(),
            addresses: Vec::new(),
            depth: None,
        };
        let outcome = walk.visit(&mut locker, Address::ROOT, 0, None);
        locker.dispose();
        outcome?;
        walk.finish()
    }
}

struct Walk<'o> {
    order: &'o Order,
    branch_size: usize,
    shape: Shape,
    rights: Vec<Option<Address>>,
    addresses: Vec<Address>,
    depth: Option<usize>,
}

fn corrupt(message: String) -> StrataError {
    StrataError::Corruption(message)
}

impl Walk<'_> {
    /// Visits `address`, returning the first key of its leftmost leaf.
    fn visit(
        &mut self,
        locker: &mut Locker<'_>,
        address: Address,
        depth: usize,
        bound: Option<&[u8]>,
    ) -> Result<Option<Vec<u8>>> {
        locker.lock(address, false)?;
        let outcome = self.inspect(locker, address, depth, bound);
        locker.unlock(address);
        outcome
    }

    fn inspect(
        &mut self,
        locker: &mut Locker<'_>,
        address: Address,
        depth: usize,
        bound: Option<&[u8]>,
    ) -> Result<Option<Vec<u8>>> {
        let page = locker.page(address).clone();
        if page.is_leaf() {
            return self.leaf(&page, depth, bound);
        }
        self.shape.branches += 1;
        self.shape.fanout.push(page.items().len());
        if address != Address::ROOT && page.items().len() > self.branch_size {
            return Err(corrupt(format!(
                "branch {address} holds {} items, more than {}",
                page.items().len(),
                self.branch_size
            )));
        }
        let first = page
            .items()
            .first()
            .ok_or_else(|| corrupt(format!("branch {address} is empty")))?;
        if first.key().is_some() {
            return Err(corrupt(format!("branch {address} has a keyed first item")));
        }
        let mut leftmost = None;
        for (index, item) in page.items().iter().enumerate() {
            let child = item
                .child_address()
                .ok_or_else(|| corrupt(format!("branch {address} holds a record")))?;
            if index > 1 {
                let (previous, current) = (page.items()[index - 1].key(), item.key());
                if let (Some(previous), Some(current)) = (previous, current) {
                    if !self.order.compare(previous, current).is_lt() {
                        return Err(corrupt(format!("branch {address} keys out of order")));
                    }
                }
            }
            let child_bound = if index == 0 { bound } else { item.key() };
            let child_first = self.visit(locker, child, depth + 1, child_bound)?;
            if index == 0 {
                leftmost = child_first;
            } else if child_first.as_deref() != item.key() {
                return Err(corrupt(format!(
                    "pivot {index} of branch {address} does not match child {child}"
                )));
            }
        }
        Ok(leftmost)
    }

    fn leaf(&mut self, page: &Page, depth: usize, bound: Option<&[u8]>) -> Result<Option<Vec<u8>>> {
        match self.depth {
            None => self.depth = Some(depth),
            Some(expected) if expected != depth => {
                return Err(corrupt(format!(
                    "leaf {} at depth {depth}, expected {expected}",
                    page.address()
                )))
            }
            Some(_) => {}
        }
        if page.address() == Address::FIRST_LEAF && page.ghosts() > 0 {
            return Err(corrupt("first leaf carries a ghost".into()));
        }
        if let (Some(bound), Some(first)) = (bound, page.first_key()) {
            if self.order.compare(first, bound).is_lt() {
                return Err(corrupt(format!("leaf {} sorts below its pivot", page.address())));
            }
        }
        let keys: Vec<Vec<u8>> = page
            .records()
            .filter_map(Item::key)
            .map(<[u8]>::to_vec)
            .collect();
        self.shape.leaves.push(keys);
        self.shape.ghosts.push(page.ghosts());
        self.rights.push(page.right());
        self.addresses.push(page.address());
        Ok(page.first_key().map(<[u8]>::to_vec))
    }

    fn finish(self) -> Result<Shape> {
        for (index, right) in self.rights.iter().enumerate() {
            if *right != self.addresses.get(index + 1).copied() {
                return Err(corrupt(format!(
                    "leaf {} links to {right:?} out of tree order",
                    self.addresses[index]
                )));
            }
        }
        let mut previous: Option<&[u8]> = None;
        for key in self.shape.leaves.iter().flatten() {
            if let Some(previous) = previous {
                if !self.order.compare(previous, key).is_lt() {
                    return Err(corrupt("records out of order".into()));
                }
            }
            previous = Some(key);
        }
        let mut shape = self.shape;
        shape.depth = self.depth.unwrap_or(0);
        Ok(shape)
    }
}
