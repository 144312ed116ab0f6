//! Durable page storage behind the tree.
//!
//! Leaves are written one at a time as records change. Structural changes
//! made by the balancer are bundled into a [`Commit`] that must apply
//! atomically: after a crash either every stage is visible or none is.

mod file;
mod memory;

pub use file::FileStorage;
pub use memory::MemoryStorage;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::tree::{Address, Page};

/// Page persistence used by the cache and the balancer.
pub trait Storage: Send + Sync {
    /// Reads a leaf page, including its ghost count and right sibling.
    fn read_leaf(&self, address: Address) -> Result<Page>;

    /// Reads a branch page.
    fn read_branch(&self, address: Address) -> Result<Page>;

    /// Durably replaces a single leaf after a record insert or removal.
    fn write_leaf(&self, page: &Page) -> Result<()>;

    /// Applies a structural change atomically.
    fn commit(&self, commit: Commit) -> Result<()>;

    /// Highest address in use, or `None` for empty storage.
    fn high_water(&self) -> Result<Option<Address>>;
}

/// One step of a structural change.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Stage {
    /// Write a complete branch image.
    WriteBranch(Page),
    /// Write a complete leaf image.
    RewriteLeaf(Page),
    /// Delete a page that was merged away.
    Unlink(Address),
}

/// Ordered set of stages applied as a unit.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Commit {
    stages: Vec<Stage>,
}

impl Commit {
    /// Creates an empty commit.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stages a page image, choosing the branch or leaf stage by address.
    pub fn write(&mut self, page: &Page) {
        if page.is_leaf() {
            self.stages.push(Stage::RewriteLeaf(page.clone()));
        } else {
            self.stages.push(Stage::WriteBranch(page.clone()));
        }
    }

    /// Stages the deletion of a page.
    pub fn unlink(&mut self, address: Address) {
        self.stages.push(Stage::Unlink(address));
    }

    /// The staged steps in order.
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Returns true when nothing is staged.
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Consumes the commit, yielding its stages.
    pub fn into_stages(self) -> Vec<Stage> {
        self.stages
    }
}
