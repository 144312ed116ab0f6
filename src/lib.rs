//! Strata: a persistent, concurrent B+tree with deferred balancing.
//!
//! Foreground readers and writers lock single leaves and never restructure
//! the tree. Leaves that grow or shrink are recorded, and a balance pass
//! later splits, merges and tidies them while foreground work continues.
//! Pages live in a reference-counted cache and are persisted through a
//! [`storage::Storage`] implementation.

#![warn(missing_docs)]

pub mod error;
pub mod logging;
pub mod primitives;
pub mod storage;
pub mod tree;

pub use error::{Result, StrataError};
pub use storage::{FileStorage, MemoryStorage, Storage};
pub use tree::{Order, Strata, StrataOptions};
