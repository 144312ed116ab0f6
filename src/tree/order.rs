//! Key ordering and key extraction supplied by the embedding system.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

/// Total order over encoded keys.
pub trait Comparator: Send + Sync {
    /// Compares two keys.
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;
}

impl<F> Comparator for F
where
    F: Fn(&[u8], &[u8]) -> Ordering + Send + Sync,
{
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        self(a, b)
    }
}

/// Derives the key under which a record is stored.
pub trait Extractor: Send + Sync {
    /// Returns the key portion of `record`.
    fn extract<'a>(&self, record: &'a [u8]) -> &'a [u8];
}

/// Lexicographic byte order.
#[derive(Clone, Copy, Debug, Default)]
pub struct Bytewise;

impl Comparator for Bytewise {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }
}

/// The whole record is its own key.
#[derive(Clone, Copy, Debug, Default)]
pub struct Whole;

impl Extractor for Whole {
    fn extract<'a>(&self, record: &'a [u8]) -> &'a [u8] {
        record
    }
}

/// The key is everything before the first occurrence of the delimiter.
#[derive(Clone, Copy, Debug)]
pub struct Delimited(pub u8);

impl Extractor for Delimited {
    fn extract<'a>(&self, record: &'a [u8]) -> &'a [u8] {
        match record.iter().position(|byte| *byte == self.0) {
            Some(end) => &record[..end],
            None => record,
        }
    }
}

/// Comparator and extractor pair carried by a tree.
#[derive(Clone)]
pub struct Order {
    comparator: Arc<dyn Comparator>,
    extractor: Arc<dyn Extractor>,
}

impl Order {
    /// Pairs a comparator with an extractor.
    pub fn new(comparator: Arc<dyn Comparator>, extractor: Arc<dyn Extractor>) -> Self {
        Self {
            comparator,
            extractor,
        }
    }

    /// Compares two keys.
    pub fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        self.comparator.compare(a, b)
    }

    /// Extracts the key of a record.
    pub fn extract<'a>(&self, record: &'a [u8]) -> &'a [u8] {
        self.extractor.extract(record)
    }

    /// True when both keys compare equal.
    pub fn same(&self, a: &[u8], b: &[u8]) -> bool {
        self.compare(a, b) == Ordering::Equal
    }
}

impl Default for Order {
    fn default() -> Self {
        Self::new(Arc::new(Bytewise), Arc::new(Whole))
    }
}

impl fmt::Debug for Order {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Order").finish_non_exhaustive()
    }
}
