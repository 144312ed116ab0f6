use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::trace;

use super::locker::Locker;
use super::options::StrataOptions;
use super::order::Order;
use super::page::{Address, Item, Page};
use super::stats::StrataStats;
use crate::primitives::cache::Cache;
use crate::storage::Storage;

/// A cached page, shared between every locker that holds it.
pub(crate) type PageCell = Arc<RwLock<Page>>;

/// State shared by the foreground operations and the balancer.
pub(crate) struct Sheaf {
    pub(crate) storage: Arc<dyn Storage>,
    pub(crate) order: Order,
    pub(crate) options: StrataOptions,
    pub(crate) cache: Mutex<Cache<Address, PageCell>>,
    pub(crate) stats: StrataStats,
    next_address: Mutex<i64>,
    lengths: Mutex<BTreeMap<Address, usize>>,
}

impl Sheaf {
    pub(crate) fn new(
        storage: Arc<dyn Storage>,
        order: Order,
        options: StrataOptions,
        high_water: Address,
    ) -> Self {
        let mut cache = Cache::new();
        // Pinned for the life of the tree; never released.
        cache.hold(Address::META, || {
            Arc::new(RwLock::new(Page::branch(
                Address::META,
                vec![Item::child(None, Address::ROOT)],
            )))
        });
        Self {
            storage,
            order,
            options,
            cache: Mutex::new(cache),
            stats: StrataStats::default(),
            next_address: Mutex::new(high_water.0 + 1),
            lengths: Mutex::new(BTreeMap::new()),
        }
    }

    pub(crate) fn locker(&self) -> Locker<'_> {
        Locker::new(self)
    }

    /// Allocates a fresh address of the requested kind.
    pub(crate) fn allocate(&self, leaf: bool) -> Address {
        let mut next = self.next_address.lock();
        if (next.rem_euclid(2) == 1) != leaf {
            *next += 1;
        }
        let address = Address(*next);
        *next += 1;
        address
    }

    /// Records a leaf as a balance candidate. Called before the mutation so
    /// the first recorded length is the one a pass compares against.
    pub(crate) fn unbalanced(&self, page: &Page, force: bool) {
        debug_assert!(page.is_leaf());
        let mut lengths = self.lengths.lock();
        if force {
            lengths.insert(page.address(), self.options.leaf_size);
        } else {
            lengths.entry(page.address()).or_insert(page.length());
        }
    }

    /// Forces a leaf back onto the candidate list by address.
    pub(crate) fn mark(&self, address: Address) {
        self.lengths.lock().insert(address, self.options.leaf_size);
    }

    /// Drops a merged-away leaf from the candidate list.
    pub(crate) fn forget(&self, address: Address) {
        self.lengths.lock().remove(&address);
    }

    pub(crate) fn take_lengths(&self) -> BTreeMap<Address, usize> {
        std::mem::take(&mut *self.lengths.lock())
    }

    pub(crate) fn has_candidates(&self) -> bool {
        !self.lengths.lock().is_empty()
    }

    /// Removes a deleted page from the cache once nothing references it.
    pub(crate) fn evict(&self, address: Address) {
        let mut cache = self.cache.lock();
        if cache.references(&address) == Some(0) {
            cache.hold(address, || unreachable!("entry checked above"));
            cache.remove(&address);
            trace!(%address, "sheaf.evict");
        }
    }

    pub(crate) fn purge(&self, heft: usize) -> usize {
        let evicted = self.cache.lock().purge(heft);
        self.stats.add_evictions(evicted);
        evicted
    }

    /// Purges down to the configured ceiling when the cache has grown past it.
    pub(crate) fn trim(&self) {
        let max = self.options.max_heft;
        if self.cache.lock().heft() > max {
            self.purge(max);
        }
    }

    pub(crate) fn heft(&self) -> usize {
        self.cache.lock().heft()
    }

    pub(crate) fn cached(&self) -> usize {
        self.cache.lock().len()
    }
}
