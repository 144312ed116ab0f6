use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};

use parking_lot::Mutex;

use super::{Commit, Stage, Storage};
use crate::error::{Result, StrataError};
use crate::tree::{Address, Page};

/// Volatile storage for tests and scratch trees, with fault injection.
#[derive(Default)]
pub struct MemoryStorage {
    pages: Mutex<HashMap<Address, Page>>,
    fail_next_read: AtomicBool,
    fail_next_commit: AtomicBool,
    reads: AtomicU64,
    commits: AtomicU64,
}

impl MemoryStorage {
    /// Creates empty storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next page read fail with an I/O error.
    pub fn fail_next_read(&self) {
        self.fail_next_read.store(true, AtomicOrdering::SeqCst);
    }

    /// Makes the next commit fail with an I/O error, applying nothing.
    pub fn fail_next_commit(&self) {
        self.fail_next_commit.store(true, AtomicOrdering::SeqCst);
    }

    /// Number of page reads served so far.
    pub fn reads(&self) -> u64 {
        self.reads.load(AtomicOrdering::Relaxed)
    }

    /// Number of commits applied so far.
    pub fn commits(&self) -> u64 {
        self.commits.load(AtomicOrdering::Relaxed)
    }

    /// Returns true when a page is stored at `address`.
    pub fn contains(&self, address: Address) -> bool {
        self.pages.lock().contains_key(&address)
    }

    /// Number of stored pages.
    pub fn page_count(&self) -> usize {
        self.pages.lock().len()
    }

    fn read(&self, address: Address) -> Result<Page> {
        if self.fail_next_read.swap(false, AtomicOrdering::SeqCst) {
            return Err(injected("read"));
        }
        self.reads.fetch_add(1, AtomicOrdering::Relaxed);
        self.pages
            .lock()
            .get(&address)
            .cloned()
            .ok_or(StrataError::NotFound(address))
    }
}

fn injected(operation: &str) -> StrataError {
    StrataError::Io(io::Error::new(
        io::ErrorKind::Other,
        format!("injected {operation} failure"),
    ))
}

impl Storage for MemoryStorage {
    fn read_leaf(&self, address: Address) -> Result<Page> {
        self.read(address)
    }

    fn read_branch(&self, address: Address) -> Result<Page> {
        self.read(address)
    }

    fn write_leaf(&self, page: &Page) -> Result<()> {
        self.pages.lock().insert(page.address(), page.clone());
        Ok(())
    }

    fn commit(&self, commit: Commit) -> Result<()> {
        if self.fail_next_commit.swap(false, AtomicOrdering::SeqCst) {
            return Err(injected("commit"));
        }
        let mut pages = self.pages.lock();
        for stage in commit.into_stages() {
            match stage {
                Stage::WriteBranch(page) | Stage::RewriteLeaf(page) => {
                    pages.insert(page.address(), page);
                }
                Stage::Unlink(address) => {
                    pages.remove(&address);
                }
            }
        }
        self.commits.fetch_add(1, AtomicOrdering::Relaxed);
        Ok(())
    }

    fn high_water(&self) -> Result<Option<Address>> {
        Ok(self.pages.lock().keys().copied().max())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::Item;

    #[test]
    fn failed_commit_applies_nothing() {
        let storage = MemoryStorage::new();
        let mut commit = Commit::new();
        commit.write(&Page::leaf(Address(3), vec![Item::record(b"a".to_vec(), b"a".to_vec())], None));
        storage.fail_next_commit();
        assert!(storage.commit(commit.clone()).is_err());
        assert!(!storage.contains(Address(3)));
        storage.commit(commit).unwrap();
        assert!(storage.contains(Address(3)));
        assert_eq!(storage.high_water().unwrap(), Some(Address(3)));
    }

    #[test]
    fn missing_pages_are_not_found() {
        let storage = MemoryStorage::new();
        assert!(matches!(
            storage.read_leaf(Address(5)),
            Err(StrataError::NotFound(Address(5)))
        ));
    }
}
