//! Low-level building blocks for the tree.

/// Reference-counted page cache.
///
/// Tracks pins and approximate sizes so unreferenced pages can be purged
/// least recently used first.
pub mod cache;
