//! Per-operation lock bookkeeping over cached pages.
//!
//! A [`Locker`] belongs to one logical operation. Every lock it takes pins
//! the page in the cache; every unlock releases that pin. A page may be held
//! several times by the same locker (a descent and its forks) through
//! [`Locker::increment`], but never locked twice from scratch.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{RawRwLock, RwLock};
use tracing::trace;

use super::order::Order;
use super::page::{Address, Page};
use super::sheaf::{PageCell, Sheaf};
use crate::error::{Result, StrataError};

enum Guard {
    Shared(ArcRwLockReadGuard<RawRwLock, Page>),
    Exclusive(ArcRwLockWriteGuard<RawRwLock, Page>),
}

impl Guard {
    fn page(&self) -> &Page {
        match self {
            Guard::Shared(guard) => guard,
            Guard::Exclusive(guard) => guard,
        }
    }
}

struct Hold {
    guard: Guard,
    count: usize,
}

/// Lock holder for a single logical operation.
pub struct Locker<'a> {
    sheaf: &'a Sheaf,
    locks: HashMap<Address, Hold>,
}

impl<'a> Locker<'a> {
    pub(crate) fn new(sheaf: &'a Sheaf) -> Self {
        Self {
            sheaf,
            locks: HashMap::new(),
        }
    }

    /// Key order of the tree this locker works on.
    pub fn order(&self) -> &'a Order {
        &self.sheaf.order
    }

    /// Pins `address` in the cache and locks it, loading it from storage on
    /// first use. A failed load releases the pin and reports the error.
    ///
    /// # Panics
    ///
    /// Panics when this locker already holds `address`.
    pub fn lock(&mut self, address: Address, exclusive: bool) -> Result<()> {
        assert!(
            !self.locks.contains_key(&address),
            "page {address} already locked by this locker"
        );
        let cell = self
            .sheaf
            .cache
            .lock()
            .hold(address, || Arc::new(RwLock::new(Page::pending(address))));
        match self.acquire(address, &cell, exclusive) {
            Ok(guard) => {
                trace!(%address, exclusive, "locker.lock");
                self.locks.insert(address, Hold { guard, count: 1 });
                Ok(())
            }
            Err(err) => {
                self.sheaf.cache.lock().release(&address);
                Err(err)
            }
        }
    }

    fn acquire(&self, address: Address, cell: &PageCell, exclusive: bool) -> Result<Guard> {
        if !exclusive {
            let guard = cell.read_arc();
            if guard.resident {
                return Ok(Guard::Shared(guard));
            }
        }
        let mut guard = cell.write_arc();
        if !guard.resident {
            let mut page = if address.is_leaf() {
                self.sheaf.storage.read_leaf(address)?
            } else {
                self.sheaf.storage.read_branch(address)?
            };
            if page.address() != address {
                return Err(StrataError::Corruption(format!(
                    "storage returned page {} for {address}",
                    page.address()
                )));
            }
            page.resident = true;
            *guard = page;
            self.sheaf.cache.lock().set_heft(&address, guard.heft());
            self.sheaf.stats.inc_page_loads();
        }
        if exclusive {
            Ok(Guard::Exclusive(guard))
        } else {
            Ok(Guard::Shared(ArcRwLockWriteGuard::downgrade(guard)))
        }
    }

    /// Adds a hold on a page this locker already has locked.
    pub fn increment(&mut self, address: Address) {
        let hold = self
            .locks
            .get_mut(&address)
            .unwrap_or_else(|| panic!("increment of page {address} not held by this locker"));
        hold.count += 1;
        self.sheaf
            .cache
            .lock()
            .hold(address, || panic!("held page {address} missing from cache"));
    }

    /// Drops one hold. The page lock is released with the last hold, after
    /// publishing the heft of an exclusively held page to the cache.
    pub fn unlock(&mut self, address: Address) {
        let hold = self
            .locks
            .get_mut(&address)
            .unwrap_or_else(|| panic!("unlock of page {address} not held by this locker"));
        hold.count -= 1;
        if hold.count == 0 {
            if let Some(hold) = self.locks.remove(&address) {
                if let Guard::Exclusive(guard) = &hold.guard {
                    self.sheaf.cache.lock().set_heft(&address, guard.heft());
                }
                drop(hold);
                trace!(%address, "locker.unlock");
            }
        }
        self.sheaf.cache.lock().release(&address);
    }

    /// Caches and exclusively locks a page created by this operation.
    ///
    /// # Panics
    ///
    /// Panics when the address is already cached.
    pub(crate) fn encache(&mut self, page: Page) {
        let address = page.address();
        let cell = Arc::new(RwLock::new(page));
        let mut cache = self.sheaf.cache.lock();
        let held = cache.hold(address, || Arc::clone(&cell));
        assert!(Arc::ptr_eq(&held, &cell), "page {address} already cached");
        let guard = cell.write_arc();
        cache.set_heft(&address, guard.heft());
        drop(cache);
        self.locks.insert(
            address,
            Hold {
                guard: Guard::Exclusive(guard),
                count: 1,
            },
        );
    }

    /// Returns true when this locker holds `address`.
    pub fn holds(&self, address: Address) -> bool {
        self.locks.contains_key(&address)
    }

    /// Returns true when this locker holds `address` exclusively.
    pub fn holds_exclusive(&self, address: Address) -> bool {
        matches!(
            self.locks.get(&address),
            Some(Hold {
                guard: Guard::Exclusive(_),
                ..
            })
        )
    }

    /// Number of holds on `address`.
    pub fn count(&self, address: Address) -> usize {
        self.locks.get(&address).map_or(0, |hold| hold.count)
    }

    /// The locked page at `address`.
    ///
    /// # Panics
    ///
    /// Panics when the page is not held by this locker.
    pub fn page(&self, address: Address) -> &Page {
        self.locks
            .get(&address)
            .map(|hold| hold.guard.page())
            .unwrap_or_else(|| panic!("page {address} not held by this locker"))
    }

    /// Mutable access to an exclusively held page.
    ///
    /// # Panics
    ///
    /// Panics unless the page is held exclusively by this locker.
    pub fn page_mut(&mut self, address: Address) -> &mut Page {
        match self.locks.get_mut(&address) {
            Some(Hold {
                guard: Guard::Exclusive(guard),
                ..
            }) => &mut **guard,
            _ => panic!("page {address} not held exclusively by this locker"),
        }
    }

    /// Verifies every hold was released. Called when an operation ends.
    ///
    /// # Panics
    ///
    /// Panics when holds remain.
    pub fn dispose(self) {
        let outstanding: Vec<Address> = self.locks.keys().copied().collect();
        assert!(
            outstanding.is_empty(),
            "locker disposed with pages still held: {outstanding:?}"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStorage, Storage};
    use crate::tree::{Item, StrataOptions};

    fn sheaf() -> Sheaf {
        let storage = Arc::new(MemoryStorage::new());
        storage
            .write_leaf(&Page::leaf(
                Address(1),
                vec![Item::record(b"a".to_vec(), b"a".to_vec())],
                None,
            ))
            .unwrap();
        Sheaf::new(storage, Order::default(), StrataOptions::default(), Address(1))
    }

    #[test]
    fn lock_loads_and_unlock_releases_pin() {
        let sheaf = sheaf();
        let mut locker = sheaf.locker();
        locker.lock(Address(1), false).unwrap();
        assert!(!locker.holds_exclusive(Address(1)));
        assert_eq!(locker.page(Address(1)).length(), 1);
        assert_eq!(sheaf.cache.lock().references(&Address(1)), Some(1));
        locker.increment(Address(1));
        assert_eq!(locker.count(Address(1)), 2);
        locker.unlock(Address(1));
        locker.unlock(Address(1));
        assert_eq!(sheaf.cache.lock().references(&Address(1)), Some(0));
        locker.dispose();
        assert_eq!(sheaf.stats.page_loads(), 1);
    }

    #[test]
    fn failed_load_leaves_no_pin() {
        let sheaf = sheaf();
        let mut locker = sheaf.locker();
        assert!(matches!(
            locker.lock(Address(9), false),
            Err(StrataError::NotFound(_))
        ));
        assert_eq!(sheaf.cache.lock().references(&Address(9)), Some(0));
        locker.dispose();
    }

    #[test]
    fn exclusive_unlock_publishes_heft() {
        let sheaf = sheaf();
        let mut locker = sheaf.locker();
        locker.lock(Address(1), true).unwrap();
        assert!(locker.holds_exclusive(Address(1)));
        locker
            .page_mut(Address(1))
            .items
            .push(Item::record(b"bb".to_vec(), b"bb".to_vec()));
        locker.unlock(Address(1));
        locker.dispose();
        assert_eq!(sheaf.cache.lock().entry_heft(&Address(1)), Some(2 + 4));
    }

    #[test]
    #[should_panic(expected = "already locked")]
    fn relocking_without_increment_panics() {
        let sheaf = sheaf();
        let mut locker = sheaf.locker();
        locker.lock(Address(1), false).unwrap();
        let _ = locker.lock(Address(1), false);
    }

    #[test]
    #[should_panic(expected = "still held")]
    fn dispose_with_holds_panics() {
        let sheaf = sheaf();
        let mut locker = sheaf.locker();
        locker.lock(Address(1), false).unwrap();
        locker.dispose();
    }
}
