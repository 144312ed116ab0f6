//! Page and item model shared by the cache, the descent and the balancer.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::order::Order;

/// Stable page identifier. Even addresses are branches, odd addresses leaves.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(pub i64);

impl Address {
    /// Always-resident dummy page whose single item points at the root.
    pub const META: Address = Address(-2);
    /// The root branch.
    pub const ROOT: Address = Address(0);
    /// The leftmost leaf, which never carries a ghost.
    pub const FIRST_LEAF: Address = Address(1);

    /// Returns true for leaf addresses.
    pub fn is_leaf(self) -> bool {
        self.0.rem_euclid(2) == 1
    }

    /// Returns true for branch addresses, including the meta-root.
    pub fn is_branch(self) -> bool {
        !self.is_leaf()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What an item carries: a user record in leaves, a child pointer in branches.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    /// Leaf record bytes.
    Record(Vec<u8>),
    /// Branch child address.
    Child(Address),
}

/// One slot of a page.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    key: Option<Vec<u8>>,
    payload: Payload,
    heft: usize,
}

const CHILD_HEFT: usize = std::mem::size_of::<i64>();

impl Item {
    /// Builds a leaf item for `record`, indexed by `key`.
    pub fn record(key: Vec<u8>, record: Vec<u8>) -> Self {
        let heft = key.len() + record.len();
        Self {
            key: Some(key),
            payload: Payload::Record(record),
            heft,
        }
    }

    /// Builds a branch item pointing at `child`. Only a branch's first item
    /// has no key.
    pub fn child(key: Option<Vec<u8>>, child: Address) -> Self {
        let heft = key.as_ref().map_or(0, Vec::len) + CHILD_HEFT;
        Self {
            key,
            payload: Payload::Child(child),
            heft,
        }
    }

    /// The item key; `None` only for a branch's first item.
    pub fn key(&self) -> Option<&[u8]> {
        self.key.as_deref()
    }

    /// The item payload.
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Child address when this is a branch item.
    pub fn child_address(&self) -> Option<Address> {
        match self.payload {
            Payload::Child(address) => Some(address),
            Payload::Record(_) => None,
        }
    }

    /// Record bytes when this is a leaf item.
    pub fn record_bytes(&self) -> Option<&[u8]> {
        match &self.payload {
            Payload::Record(record) => Some(record),
            Payload::Child(_) => None,
        }
    }

    /// Approximate in-memory size used for cache accounting.
    pub fn heft(&self) -> usize {
        self.heft
    }

    /// Replaces the key, keeping the heft in step. Returns the old key.
    pub(crate) fn set_key(&mut self, key: Option<Vec<u8>>) -> Option<Vec<u8>> {
        let old = std::mem::replace(&mut self.key, key);
        let old_len = old.as_ref().map_or(0, Vec::len);
        let new_len = self.key.as_ref().map_or(0, Vec::len);
        self.heft = self.heft - old_len + new_len;
        old
    }
}

/// A leaf or branch page.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Page {
    pub(crate) address: Address,
    pub(crate) items: Vec<Item>,
    pub(crate) ghosts: usize,
    pub(crate) right: Option<Address>,
    #[serde(skip)]
    pub(crate) resident: bool,
    #[serde(skip)]
    pub(crate) deleted: bool,
}

impl Page {
    /// Builds a leaf page.
    pub fn leaf(address: Address, items: Vec<Item>, right: Option<Address>) -> Self {
        debug_assert!(address.is_leaf());
        Self {
            address,
            items,
            ghosts: 0,
            right,
            resident: true,
            deleted: false,
        }
    }

    /// Builds a branch page.
    pub fn branch(address: Address, items: Vec<Item>) -> Self {
        debug_assert!(address.is_branch());
        Self {
            address,
            items,
            ghosts: 0,
            right: None,
            resident: true,
            deleted: false,
        }
    }

    /// Placeholder cached ahead of the storage read that fills it.
    pub(crate) fn pending(address: Address) -> Self {
        Self {
            address,
            items: Vec::new(),
            ghosts: 0,
            right: None,
            resident: false,
            deleted: false,
        }
    }

    /// Sets the ghost count of a leaf page. Used by storage decoders.
    pub fn with_ghosts(mut self, ghosts: usize) -> Self {
        self.ghosts = ghosts;
        self
    }

    /// The page address.
    pub fn address(&self) -> Address {
        self.address
    }

    /// Returns true for leaf pages.
    pub fn is_leaf(&self) -> bool {
        self.address.is_leaf()
    }

    /// All items, ghosts included.
    pub fn items(&self) -> &[Item] {
        &self.items
    }

    /// Number of leading ghost items.
    pub fn ghosts(&self) -> usize {
        self.ghosts
    }

    /// Next leaf to the right, for leaves.
    pub fn right(&self) -> Option<Address> {
        self.right
    }

    /// Item count excluding ghosts.
    pub fn length(&self) -> usize {
        self.items.len() - self.ghosts
    }

    /// Sum of item hefts.
    pub fn heft(&self) -> usize {
        self.items.iter().map(Item::heft).sum()
    }

    /// Returns true once the balancer has merged this page away.
    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    /// Key of the first item, ghost or real.
    pub fn first_key(&self) -> Option<&[u8]> {
        self.items.first().and_then(Item::key)
    }

    /// Live records of a leaf, ghosts skipped.
    pub fn records(&self) -> impl Iterator<Item = &Item> {
        self.items[self.ghosts..].iter()
    }

    /// Child addresses of a branch in order.
    pub fn children(&self) -> impl Iterator<Item = Address> + '_ {
        self.items.iter().filter_map(Item::child_address)
    }

    /// Binary search for `key`. Leaves search past their ghosts, branches
    /// past their unkeyed first item.
    pub fn find(&self, order: &Order, key: &[u8]) -> Result<usize, usize> {
        let low = if self.is_leaf() { self.ghosts } else { 1 };
        find(order, &self.items, key, low)
    }
}

/// Binary search over `items[low..]`. A missing key yields the insertion
/// point. A null key orders before every key.
pub(crate) fn find(order: &Order, items: &[Item], key: &[u8], low: usize) -> Result<usize, usize> {
    let mut low = low.min(items.len());
    let mut high = items.len();
    while low < high {
        let mid = low + (high - low) / 2;
        let ordering = match items[mid].key() {
            Some(existing) => order.compare(key, existing),
            None => Ordering::Greater,
        };
        match ordering {
            Ordering::Less => high = mid,
            Ordering::Greater => low = mid + 1,
            Ordering::Equal => return Ok(mid),
        }
    }
    Err(low)
}
