//! Reference-counted LRU cache with heft accounting.
//!
//! Entries are pinned while their reference count is nonzero. Eviction only
//! happens through [`Cache::purge`], which walks from the least recently used
//! end and skips anything still referenced.

use std::fmt::Debug;
use std::hash::Hash;

use lru::LruCache;
use tracing::trace;

struct Entry<V> {
    value: V,
    references: usize,
    heft: usize,
}

/// Cache mapping keys to shared values with an approximate total size.
pub struct Cache<K: Hash + Eq, V> {
    entries: LruCache<K, Entry<V>>,
    heft: usize,
}

impl<K: Hash + Eq + Clone + Debug, V: Clone> Default for Cache<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Hash + Eq + Clone + Debug, V: Clone> Cache<K, V> {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self {
            entries: LruCache::unbounded(),
            heft: 0,
        }
    }

    /// Holds a reference to the entry for `key`, creating it with
    /// `initializer` when absent. The entry becomes most recently used.
    pub fn hold(&mut self, key: K, initializer: impl FnOnce() -> V) -> V {
        if let Some(entry) = self.entries.get_mut(&key) {
            entry.references += 1;
            return entry.value.clone();
        }
        let value = initializer();
        self.entries.put(
            key,
            Entry {
                value: value.clone(),
                references: 1,
                heft: 0,
            },
        );
        value
    }

    /// Drops one reference. The entry stays cached until purged.
    pub fn release(&mut self, key: &K) {
        let entry = self
            .entries
            .peek_mut(key)
            .unwrap_or_else(|| panic!("release of uncached entry {key:?}"));
        assert!(entry.references > 0, "release of unreferenced entry {key:?}");
        entry.references -= 1;
    }

    /// Removes an entry whose only reference is held by the caller.
    pub fn remove(&mut self, key: &K) -> V {
        let references = self.references(key);
        assert_eq!(
            references,
            Some(1),
            "removal of entry {key:?} with outstanding references"
        );
        let entry = self
            .entries
            .pop(key)
            .unwrap_or_else(|| panic!("removal of uncached entry {key:?}"));
        self.heft -= entry.heft;
        entry.value
    }

    /// Assigns the heft of an entry, adjusting the cache-wide total.
    pub fn set_heft(&mut self, key: &K, heft: usize) {
        let entry = self
            .entries
            .peek_mut(key)
            .unwrap_or_else(|| panic!("heft assigned to uncached entry {key:?}"));
        self.heft = self.heft - entry.heft + heft;
        entry.heft = heft;
    }

    /// Heft of a single entry, if cached.
    pub fn entry_heft(&self, key: &K) -> Option<usize> {
        self.entries.peek(key).map(|entry| entry.heft)
    }

    /// Current reference count of an entry, if cached.
    pub fn references(&self, key: &K) -> Option<usize> {
        self.entries.peek(key).map(|entry| entry.references)
    }

    /// Total heft of all cached entries.
    pub fn heft(&self) -> usize {
        self.heft
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true when nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Evicts unreferenced entries, least recently used first, until the
    /// total heft is at most `target`. Returns the number of evictions.
    pub fn purge(&mut self, target: usize) -> usize {
        if self.heft <= target {
            return 0;
        }
        let mut remaining = self.heft;
        let mut victims = Vec::new();
        for (key, entry) in self.entries.iter().rev() {
            if remaining <= target {
                break;
            }
            if entry.references == 0 {
                remaining -= entry.heft;
                victims.push(key.clone());
            }
        }
        for key in &victims {
            if let Some(entry) = self.entries.pop(key) {
                assert_eq!(entry.references, 0, "purge evicted referenced entry {key:?}");
                self.heft -= entry.heft;
            }
        }
        trace!(evicted = victims.len(), heft = self.heft, target, "cache.purge");
        victims.len()
    }
}
