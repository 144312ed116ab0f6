use crate::error::Result;
use crate::storage::Commit;
use crate::tree::descent::{Descent, Direction, Stop};
use crate::tree::locker::Locker;
use crate::tree::page::{Address, Page};
use crate::tree::sheaf::Sheaf;

/// Locks and descents owned by one balance operation.
///
/// Descents are addressed by index so several can be driven against the
/// same locker. Closing the session releases everything in reverse order of
/// acquisition and evicts pages the operation deleted.
pub(super) struct Session<'a> {
    sheaf: &'a Sheaf,
    locker: Locker<'a>,
    descents: Vec<Option<Descent>>,
    created: Vec<Address>,
    deleted: Vec<Address>,
}

impl<'a> Session<'a> {
    pub(super) fn new(sheaf: &'a Sheaf) -> Self {
        Self {
            sheaf,
            locker: sheaf.locker(),
            descents: Vec::new(),
            created: Vec::new(),
            deleted: Vec::new(),
        }
    }

    pub(super) fn sheaf(&self) -> &'a Sheaf {
        self.sheaf
    }

    /// Starts a descent at the meta page.
    pub(super) fn start(&mut self) -> Result<usize> {
        let descent = Descent::new(&mut self.locker)?;
        self.descents.push(Some(descent));
        Ok(self.descents.len() - 1)
    }

    pub(super) fn fork(&mut self, from: usize) -> usize {
        let fork = live(&self.descents, from).fork(&mut self.locker);
        self.descents.push(Some(fork));
        self.descents.len() - 1
    }

    pub(super) fn descent(&mut self, id: usize) -> &mut Descent {
        self.descents[id]
            .as_mut()
            .unwrap_or_else(|| panic!("descent {id} already released"))
    }

    pub(super) fn at(&self, id: usize) -> &Descent {
        live(&self.descents, id)
    }

    pub(super) fn descend(&mut self, id: usize, direction: Direction<'_>, stop: Stop<'_>) -> Result<()> {
        let descent = self.descents[id]
            .as_mut()
            .unwrap_or_else(|| panic!("descent {id} already released"));
        descent.descend(&mut self.locker, direction, stop)
    }

    /// Descends like [`Session::descend`], reporting a missed stop as false.
    pub(super) fn seek(&mut self, id: usize, direction: Direction<'_>, stop: Stop<'_>) -> Result<bool> {
        let descent = self.descents[id]
            .as_mut()
            .unwrap_or_else(|| panic!("descent {id} already released"));
        descent.seek(&mut self.locker, direction, stop)
    }

    pub(super) fn upgrade(&mut self, id: usize) -> Result<()> {
        let descent = self.descents[id]
            .as_mut()
            .unwrap_or_else(|| panic!("descent {id} already released"));
        descent.upgrade(&mut self.locker)
    }

    /// Page under descent `id`.
    pub(super) fn page(&self, id: usize) -> &Page {
        self.locker.page(self.at(id).page())
    }

    /// Any page held by this session.
    pub(super) fn held(&self, address: Address) -> &Page {
        self.locker.page(address)
    }

    pub(super) fn release(&mut self, id: usize) {
        if let Some(descent) = self.descents[id].take() {
            descent.release(&mut self.locker);
        }
    }

    /// Makes new page images durable, then installs them in memory. Pages
    /// not yet held are new and enter the cache locked. Deleted pages are
    /// unlinked in the same commit and emptied in memory.
    ///
    /// Nothing in memory changes when the commit fails.
    pub(super) fn publish(&mut self, images: Vec<Page>, deleted: Vec<Address>) -> Result<()> {
        let mut commit = Commit::new();
        for image in &images {
            commit.write(image);
        }
        for address in &deleted {
            commit.unlink(*address);
        }
        self.sheaf.storage.commit(commit)?;

        for image in images {
            let address = image.address();
            if self.locker.holds(address) {
                *self.locker.page_mut(address) = image;
            } else {
                self.locker.encache(image);
                self.created.push(address);
            }
        }
        for address in deleted {
            let page = self.locker.page_mut(address);
            page.items.clear();
            page.ghosts = 0;
            page.right = None;
            page.deleted = true;
            self.deleted.push(address);
        }
        Ok(())
    }

    pub(super) fn close(self) {
        let Session {
            sheaf,
            mut locker,
            descents,
            created,
            deleted,
        } = self;
        for address in created {
            locker.unlock(address);
        }
        for descent in descents.into_iter().rev().flatten() {
            descent.release(&mut locker);
        }
        locker.dispose();
        for address in deleted {
            sheaf.evict(address);
        }
    }
}

fn live(descents: &[Option<Descent>], id: usize) -> &Descent {
    descents[id]
        .as_ref()
        .unwrap_or_else(|| panic!("descent {id} already released"))
}
