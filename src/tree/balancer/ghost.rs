use tracing::debug;

use super::abandon;
use super::session::Session;
use crate::error::{Result, StrataError};
use crate::tree::descent::{Direction, Stop};
use crate::tree::sheaf::Sheaf;

/// Drops the ghost at the head of the leaf whose pivot is `key` and
/// promotes the next record's key to be the pivot. Returns the new pivot,
/// or `None` when there was nothing to do.
pub(super) fn delete_ghost(sheaf: &Sheaf, key: &[u8]) -> Result<Option<Vec<u8>>> {
    let mut session = Session::new(sheaf);
    let outcome = delete_ghost_in(&mut session, key);
    session.close();
    outcome
}

fn delete_ghost_in(session: &mut Session<'_>, key: &[u8]) -> Result<Option<Vec<u8>>> {
    let sheaf = session.sheaf();
    let keys = [key.to_vec()];

    let pivot = session.start()?;
    if !session.seek(pivot, Direction::Key(key), Stop::Found(&keys))? {
        abandon(sheaf, "ghost pivot vanished", &[]);
        return Ok(None);
    }
    session.upgrade(pivot)?;
    let leaf = session.fork(pivot);
    session.descend(leaf, Direction::Key(key), Stop::Leaf)?;

    let page = session.page(leaf);
    if page.ghosts() == 0 {
        return Ok(None);
    }
    if page.length() == 0 {
        sheaf.mark(page.address());
        return Ok(None);
    }

    let mut image = page.clone();
    image.items.remove(0);
    image.ghosts = 0;
    let promoted = image
        .first_key()
        .ok_or_else(|| StrataError::Corruption(format!("leaf {} lost its records", image.address())))?
        .to_vec();

    let mut branch = session.page(pivot).clone();
    let index = session.at(pivot).index();
    branch.items[index].set_key(Some(promoted.clone()));

    let address = image.address();
    session.publish(vec![image, branch], Vec::new())?;
    sheaf.stats.inc_ghost_deletions();
    debug!(%address, "balancer.delete_ghost");
    Ok(Some(promoted))
}
