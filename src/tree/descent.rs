//! Root-to-target walks that leave a page locked for the caller.
//!
//! A descent starts at the meta page and locks hand over hand: each child is
//! locked before its parent is released, unless the descent retains its
//! ancestors. A descent can fork to share its current page with a second
//! walk that continues independently.

use std::collections::HashMap;

use super::locker::Locker;
use super::order::Order;
use super::page::{Address, Page};
use crate::error::{Result, StrataError};

/// How to choose the child index on each page.
#[derive(Clone, Copy, Debug)]
pub enum Direction<'k> {
    /// Follow the key.
    Key(&'k [u8]),
    /// Always index 0, or the first live record in a leaf.
    Leftmost,
    /// Always the last index.
    Rightmost,
}

/// When to stop descending.
#[derive(Clone, Copy, Debug)]
pub enum Stop<'k> {
    /// At a leaf.
    Leaf,
    /// At a branch whose children are leaves.
    Penultimate,
    /// At the given depth, where the root is depth 0.
    Level(i32),
    /// At the page with this address.
    Address(Address),
    /// At the branch whose selected item points at this child.
    Child(Address),
    /// At a branch whose selected, non-first item carries one of these keys.
    Found(&'k [Vec<u8>]),
}

/// Cursor over the tree structure holding a lock on its current page.
#[derive(Debug)]
pub struct Descent {
    page: Address,
    index: usize,
    found: bool,
    depth: i32,
    exclusive: bool,
    retain: bool,
    ancestors: Vec<Address>,
    indexes: HashMap<Address, usize>,
    lesser: Option<Address>,
    greater: Option<Address>,
    upper: Option<Vec<u8>>,
}

impl Descent {
    /// Starts a descent at the meta page, holding it shared.
    pub fn new(locker: &mut Locker<'_>) -> Result<Self> {
        if locker.holds(Address::META) {
            locker.increment(Address::META);
        } else {
            locker.lock(Address::META, false)?;
        }
        let mut indexes = HashMap::new();
        indexes.insert(Address::META, 0);
        Ok(Self {
            page: Address::META,
            index: 0,
            found: false,
            depth: -1,
            exclusive: false,
            retain: false,
            ancestors: Vec::new(),
            indexes,
            lesser: None,
            greater: None,
            upper: None,
        })
    }

    /// Current page address.
    pub fn page(&self) -> Address {
        self.page
    }

    /// Index selected on the current page. For a leaf key miss this is the
    /// insertion point.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Whether the last key search hit an exact match.
    pub fn found(&self) -> bool {
        self.found
    }

    /// Depth of the current page; the root is 0 and the meta page -1.
    pub fn depth(&self) -> i32 {
        self.depth
    }

    /// Index taken at each page visited.
    pub fn indexes(&self) -> &HashMap<Address, usize> {
        &self.indexes
    }

    /// Retained ancestors, top first.
    pub fn ancestors(&self) -> &[Address] {
        &self.ancestors
    }

    /// Lowest visited branch with a sibling slot to the left of the path.
    pub fn lesser(&self) -> Option<Address> {
        self.lesser
    }

    /// Lowest visited branch with a sibling slot to the right of the path.
    pub fn greater(&self) -> Option<Address> {
        self.greater
    }

    /// Pivot of the nearest slot to the right of the path, which bounds the
    /// keys reachable below the current page. `None` on the right edge.
    pub fn upper(&self) -> Option<&[u8]> {
        self.upper.as_deref()
    }

    /// Locks subsequently visited pages exclusively.
    pub fn exclude(&mut self) {
        self.exclusive = true;
    }

    /// Keeps ancestors locked instead of releasing them on the way down.
    pub fn retain(&mut self) {
        self.retain = true;
    }

    /// Overrides the index on the current page.
    pub fn set_index(&mut self, index: usize) {
        self.index = index;
        self.indexes.insert(self.page, index);
    }

    /// Continues a second walk from the current page. The fork gets its own
    /// hold on the page, inherits the lock mode, and does not retain.
    pub fn fork(&self, locker: &mut Locker<'_>) -> Descent {
        locker.increment(self.page);
        Descent {
            page: self.page,
            index: self.index,
            found: self.found,
            depth: self.depth,
            exclusive: self.exclusive,
            retain: false,
            ancestors: Vec::new(),
            indexes: self.indexes.clone(),
            lesser: self.lesser,
            greater: self.greater,
            upper: self.upper.clone(),
        }
    }

    /// Trades the shared lock on the current page for an exclusive one.
    ///
    /// # Panics
    ///
    /// Panics when another hold on the page exists in this locker, since
    /// the upgrade would deadlock against it.
    pub fn upgrade(&mut self, locker: &mut Locker<'_>) -> Result<()> {
        locker.unlock(self.page);
        assert!(
            !locker.holds(self.page),
            "upgrade of page {} with other holds outstanding",
            self.page
        );
        if let Err(err) = locker.lock(self.page, true) {
            self.reset(locker)?;
            return Err(err);
        }
        self.exclusive = true;
        Ok(())
    }

    fn reset(&mut self, locker: &mut Locker<'_>) -> Result<()> {
        self.page = Address::META;
        self.index = 0;
        self.depth = -1;
        self.upper = None;
        if locker.holds(Address::META) {
            locker.increment(Address::META);
            Ok(())
        } else {
            locker.lock(Address::META, false)
        }
    }

    /// Walks down until `stop` holds, choosing children by `direction`.
    ///
    /// Returns a corruption error when the walk reaches a leaf without the
    /// stop condition being met.
    pub fn descend(
        &mut self,
        locker: &mut Locker<'_>,
        direction: Direction<'_>,
        stop: Stop<'_>,
    ) -> Result<()> {
        if self.seek(locker, direction, stop)? {
            Ok(())
        } else {
            Err(StrataError::Corruption(format!(
                "descent reached leaf {} without meeting {stop:?}",
                self.page
            )))
        }
    }

    /// Like [`Descent::descend`], but reports a walk that bottoms out at a
    /// leaf without meeting `stop` as `Ok(false)`, leaving the leaf locked.
    pub fn seek(
        &mut self,
        locker: &mut Locker<'_>,
        direction: Direction<'_>,
        stop: Stop<'_>,
    ) -> Result<bool> {
        let order = locker.order();
        loop {
            let page = locker.page(self.page);
            if self.stopped(order, page, stop) {
                return Ok(true);
            }
            if page.is_leaf() {
                return Ok(false);
            }
            if let Some(next) = page.items().get(self.index + 1) {
                self.greater = Some(self.page);
                self.upper = next.key().map(<[u8]>::to_vec);
            }
            if self.index > 0 {
                self.lesser = Some(self.page);
            }
            let child = page
                .items()
                .get(self.index)
                .and_then(|item| item.child_address())
                .ok_or_else(|| {
                    StrataError::Corruption(format!(
                        "branch {} has no child at index {}",
                        self.page, self.index
                    ))
                })?;

            locker.lock(child, self.exclusive)?;
            if self.retain {
                self.ancestors.push(self.page);
            } else {
                locker.unlock(self.page);
            }
            self.page = child;
            self.depth += 1;

            let page = locker.page(child);
            let index = self.select(order, page, direction);
            self.set_index(index);
        }
    }

    fn select(&mut self, order: &Order, page: &Page, direction: Direction<'_>) -> usize {
        self.found = false;
        match direction {
            Direction::Key(key) => match page.find(order, key) {
                Ok(index) => {
                    self.found = true;
                    index
                }
                Err(index) if page.is_leaf() => index,
                Err(index) => index - 1,
            },
            Direction::Leftmost if page.is_leaf() => page.ghosts(),
            Direction::Leftmost => 0,
            Direction::Rightmost => page.items().len().saturating_sub(1),
        }
    }

    fn stopped(&self, order: &Order, page: &Page, stop: Stop<'_>) -> bool {
        match stop {
            Stop::Leaf => page.is_leaf(),
            Stop::Penultimate => {
                !page.is_leaf()
                    && page
                        .items()
                        .first()
                        .and_then(|item| item.child_address())
                        .is_some_and(Address::is_leaf)
            }
            Stop::Level(level) => self.depth == level,
            Stop::Address(address) => self.page == address,
            Stop::Child(address) => {
                !page.is_leaf()
                    && page
                        .items()
                        .get(self.index)
                        .and_then(|item| item.child_address())
                        == Some(address)
            }
            Stop::Found(keys) => {
                self.page != Address::META
                    && !page.is_leaf()
                    && self.index != 0
                    && page
                        .items()
                        .get(self.index)
                        .and_then(|item| item.key())
                        .is_some_and(|key| keys.iter().any(|sought| order.same(key, sought)))
            }
        }
    }

    /// Detaches the current page from the descent, leaving its hold with
    /// the locker. Only valid for a descent that retains nothing.
    pub(crate) fn into_page(self) -> Address {
        debug_assert!(self.ancestors.is_empty());
        self.page
    }

    /// Releases the current page and any retained ancestors.
    pub fn release(self, locker: &mut Locker<'_>) {
        locker.unlock(self.page);
        for address in self.ancestors.into_iter().rev() {
            locker.unlock(address);
        }
    }
}
