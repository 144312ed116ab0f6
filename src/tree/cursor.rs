use tracing::trace;

use super::descent::{Descent, Direction, Stop};
use super::locker::Locker;
use super::page::{Address, Item, Page};
use super::sheaf::Sheaf;
use crate::error::{Result, StrataError};

/// A lock on one leaf, movable to the right along the leaf chain.
///
/// Shared cursors read; exclusive cursors may also insert and remove
/// records. Every insert or removal records the leaf as a balance candidate
/// and is written to storage before the in-memory page changes. The lock is
/// released when the cursor is dropped.
///
/// A cursor only accepts keys the leaf covers: at or above the leaf's pivot
/// and below the pivot of its right sibling.
pub struct Cursor<'a> {
    sheaf: &'a Sheaf,
    locker: Option<Locker<'a>>,
    page: Address,
    upper: Option<Vec<u8>>,
    exclusive: bool,
    index: usize,
    found: bool,
}

impl<'a> Cursor<'a> {
    /// Opens a cursor on the leaf that covers `key`, or the first leaf.
    pub(crate) fn open(sheaf: &'a Sheaf, key: Option<&[u8]>, exclusive: bool) -> Result<Self> {
        let mut locker = sheaf.locker();
        let mut descent = match Descent::new(&mut locker) {
            Ok(descent) => descent,
            Err(err) => {
                locker.dispose();
                return Err(err);
            }
        };
        let direction = key.map_or(Direction::Leftmost, Direction::Key);
        if let Err(err) = descend_to_leaf(&mut descent, &mut locker, direction, exclusive) {
            descent.release(&mut locker);
            locker.dispose();
            return Err(err);
        }
        let (index, found) = (descent.index(), descent.found());
        let upper = descent.upper().map(<[u8]>::to_vec);
        let page = descent.into_page();
        trace!(%page, exclusive, "cursor.open");
        Ok(Self {
            sheaf,
            locker: Some(locker),
            page,
            upper,
            exclusive,
            index,
            found,
        })
    }

    fn locker(&self) -> &Locker<'a> {
        self.locker.as_ref().unwrap_or_else(|| unreachable!("cursor used after release"))
    }

    fn locker_mut(&mut self) -> &mut Locker<'a> {
        self.locker.as_mut().unwrap_or_else(|| unreachable!("cursor used after release"))
    }

    /// The leaf under the cursor.
    pub fn page(&self) -> &Page {
        self.locker().page(self.page)
    }

    /// Index of the sought key, or its insertion point.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Whether the sought key was present when the cursor opened.
    pub fn found(&self) -> bool {
        self.found
    }

    /// Searches the current leaf for `key`, skipping ghosts. Returns the
    /// index of the record or its insertion point, or `None` when the key
    /// belongs to another leaf.
    pub fn index_of(&self, key: &[u8]) -> Option<std::result::Result<usize, usize>> {
        let found = self.page().find(&self.sheaf.order, key);
        match found {
            Ok(_) => Some(found),
            Err(_) if self.covers(key) => Some(found),
            Err(_) => None,
        }
    }

    /// Whether `key` falls between this leaf's pivot and the next one.
    fn covers(&self, key: &[u8]) -> bool {
        let order = &self.sheaf.order;
        let page = self.page();
        let above_pivot = page.address() == Address::FIRST_LEAF
            || page
                .first_key()
                .map_or(true, |pivot| order.compare(key, pivot).is_ge());
        let below_upper = self
            .upper
            .as_deref()
            .map_or(true, |upper| order.compare(key, upper).is_lt());
        above_pivot && below_upper
    }

    /// Record bytes at `index`, or `None` for ghosts and out-of-range slots.
    pub fn get(&self, index: usize) -> Option<&[u8]> {
        let page = self.page();
        if index < page.ghosts() {
            return None;
        }
        page.items().get(index).and_then(Item::record_bytes)
    }

    /// Inserts or replaces a record in the current leaf. A record whose key
    /// matches the leaf's ghost brings the ghost back to life.
    ///
    /// Returns true when the leaf gained a record. The record's key must
    /// belong to this leaf; keys outside it are rejected.
    pub fn insert(&mut self, record: Vec<u8>) -> Result<bool> {
        self.require_exclusive()?;
        let order = &self.sheaf.order;
        let key = order.extract(&record).to_vec();
        let page = self.page();
        let mut image = page.clone();
        let ghost_match = page.ghosts() > 0
            && page.first_key().is_some_and(|ghost| order.same(ghost, &key));
        let inserted = match page.find(order, &key) {
            Ok(index) => {
                image.items[index] = Item::record(key, record);
                false
            }
            Err(_) if ghost_match => {
                image.items[0] = Item::record(key, record);
                image.ghosts = 0;
                true
            }
            Err(index) => {
                if !self.covers(&key) {
                    return Err(StrataError::InvalidArgument(format!(
                        "key sorts outside leaf {}",
                        page.address()
                    )));
                }
                image.items.insert(index, Item::record(key, record));
                true
            }
        };
        if inserted {
            self.sheaf.unbalanced(page, false);
        }
        self.write(image)?;
        Ok(inserted)
    }

    /// Removes the record at `index` and returns it. Removing the first
    /// record of any leaf but the first turns it into a ghost, so the
    /// leaf's pivot stays valid until the balancer deals with it.
    pub fn remove(&mut self, index: usize) -> Result<Vec<u8>> {
        self.require_exclusive()?;
        let page = self.page();
        if index < page.ghosts() || index >= page.items().len() {
            return Err(StrataError::InvalidArgument(format!(
                "no record at index {index} of leaf {}",
                page.address()
            )));
        }
        self.sheaf.unbalanced(page, false);
        let mut image = page.clone();
        let removed = if index == 0 && page.address() != Address::FIRST_LEAF {
            image.ghosts = 1;
            image.items[0].clone()
        } else {
            image.items.remove(index)
        };
        self.write(image)?;
        Ok(removed.record_bytes().map(<[u8]>::to_vec).unwrap_or_default())
    }

    fn require_exclusive(&self) -> Result<()> {
        if self.exclusive {
            Ok(())
        } else {
            Err(StrataError::InvalidArgument(
                "cursor was opened for reading".into(),
            ))
        }
    }

    fn write(&mut self, image: Page) -> Result<()> {
        self.sheaf.storage.write_leaf(&image)?;
        let address = self.page;
        *self.locker_mut().page_mut(address) = image;
        Ok(())
    }

    /// Moves to the right sibling, locking it before letting go of the
    /// current leaf. Returns false at the last leaf.
    ///
    /// The sibling's own right neighbor is locked briefly to learn the
    /// pivot that bounds the sibling.
    pub fn next(&mut self) -> Result<bool> {
        let Some(right) = self.page().right() else {
            return Ok(false);
        };
        let (exclusive, current) = (self.exclusive, self.page);
        let locker = self.locker_mut();
        locker.lock(right, exclusive)?;
        let upper = match locker.page(right).right() {
            Some(beyond) => match locker.lock(beyond, false) {
                Ok(()) => {
                    let pivot = locker.page(beyond).first_key().map(<[u8]>::to_vec);
                    locker.unlock(beyond);
                    pivot
                }
                Err(err) => {
                    locker.unlock(right);
                    return Err(err);
                }
            },
            None => None,
        };
        locker.unlock(current);
        self.page = right;
        self.upper = upper;
        self.index = self.page().ghosts();
        self.found = false;
        Ok(true)
    }

    /// Releases the leaf lock.
    pub fn release(self) {}
}

impl Drop for Cursor<'_> {
    fn drop(&mut self) {
        if let Some(mut locker) = self.locker.take() {
            locker.unlock(self.page);
            locker.dispose();
            self.sheaf.trim();
        }
    }
}

fn descend_to_leaf(
    descent: &mut Descent,
    locker: &mut Locker<'_>,
    direction: Direction<'_>,
    exclusive: bool,
) -> Result<()> {
    if exclusive {
        descent.descend(locker, direction, Stop::Penultimate)?;
        descent.exclude();
    }
    descent.descend(locker, direction, Stop::Leaf)
}
