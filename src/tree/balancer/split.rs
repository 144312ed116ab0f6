use tracing::debug;

use super::session::Session;
use super::{abandon, ghost, partition, Operation};
use crate::error::{Result, StrataError};
use crate::tree::descent::{Direction, Stop};
use crate::tree::page::{Address, Item, Page};
use crate::tree::sheaf::Sheaf;

pub(super) fn split_leaf(
    sheaf: &Sheaf,
    address: Address,
    key: Option<Vec<u8>>,
    had_ghost: bool,
) -> Result<Option<Operation>> {
    let mut key = key;
    if had_ghost {
        if let Some(ghost_key) = key.as_deref() {
            if let Some(promoted) = ghost::delete_ghost(sheaf, ghost_key)? {
                key = Some(promoted);
            }
        }
    }
    let mut session = Session::new(sheaf);
    let outcome = split_leaf_in(&mut session, address, key.as_deref());
    session.close();
    outcome
}

fn split_leaf_in(
    session: &mut Session<'_>,
    address: Address,
    key: Option<&[u8]>,
) -> Result<Option<Operation>> {
    let sheaf = session.sheaf();
    let leaf_size = sheaf.options.leaf_size;
    let direction = key.map_or(Direction::Leftmost, Direction::Key);

    let parent = session.start()?;
    session.descend(parent, direction, Stop::Penultimate)?;
    session.upgrade(parent)?;
    let leaf = session.fork(parent);
    session.descend(leaf, direction, Stop::Leaf)?;

    let page = session.page(leaf);
    if page.address() != address {
        abandon(sheaf, "split target moved", &[address]);
        return Ok(None);
    }
    if page.length() <= leaf_size {
        return Ok(None);
    }

    let mut original = page.clone();
    let tail_right = original.right;
    let sizes = partition(original.items.len(), leaf_size);
    let mut rest = original.items.split_off(sizes[0]);
    let mut pages = Vec::with_capacity(sizes.len() - 1);
    for &size in &sizes[1..] {
        let remainder = rest.split_off(size);
        pages.push(Page::leaf(sheaf.allocate(true), rest, None));
        rest = remainder;
    }
    original.right = pages.first().map(Page::address).or(tail_right);
    let addresses: Vec<Address> = pages.iter().map(Page::address).collect();
    for (index, page) in pages.iter_mut().enumerate() {
        page.right = addresses.get(index + 1).copied().or(tail_right);
    }

    let mut branch = session.page(parent).clone();
    let at = session.at(parent).index() + 1;
    for (offset, page) in pages.iter().enumerate() {
        let pivot = page
            .first_key()
            .ok_or_else(|| StrataError::Corruption(format!("split leaf {} is empty", page.address())))?
            .to_vec();
        branch
            .items
            .insert(at + offset, Item::child(Some(pivot), page.address()));
    }
    let first_pivot = branch.items[at]
        .key()
        .map(<[u8]>::to_vec)
        .unwrap_or_default();
    let overflow = branch.items.len() > sheaf.options.branch_size;
    let branch_address = branch.address();
    let last = addresses.last().copied();

    let mut images = vec![original, branch];
    images.extend(pages);
    session.publish(images, Vec::new())?;

    sheaf.mark(address);
    if let Some(last) = last {
        sheaf.mark(last);
    }
    sheaf.stats.inc_leaf_splits();
    debug!(%address, created = ?addresses, parent = %branch_address, "balancer.split_leaf");

    Ok(overflow.then(|| split_follow_up(branch_address, first_pivot)))
}

fn split_follow_up(address: Address, key: Vec<u8>) -> Operation {
    if address == Address::ROOT {
        Operation::DrainRoot
    } else {
        Operation::SplitBranch { address, key }
    }
}

pub(super) fn split_branch(sheaf: &Sheaf, address: Address, key: &[u8]) -> Result<Option<Operation>> {
    let mut session = Session::new(sheaf);
    let outcome = split_branch_in(&mut session, address, key);
    session.close();
    outcome
}

fn split_branch_in(
    session: &mut Session<'_>,
    address: Address,
    key: &[u8],
) -> Result<Option<Operation>> {
    let sheaf = session.sheaf();
    let branch_size = sheaf.options.branch_size;

    let parent = session.start()?;
    session.descend(parent, Direction::Key(key), Stop::Child(address))?;
    session.upgrade(parent)?;
    let full = session.fork(parent);
    let depth = session.at(parent).depth() + 1;
    session.descend(full, Direction::Key(key), Stop::Level(depth))?;

    let page = session.page(full);
    if page.address() != address || page.items.len() <= branch_size {
        return Ok(None);
    }

    let mut original = page.clone();
    let sizes = partition(original.items.len(), branch_size);
    let mut rest = original.items.split_off(sizes[0]);
    let mut pages = Vec::with_capacity(sizes.len() - 1);
    let mut branch = session.page(parent).clone();
    let at = session.at(parent).index() + 1;
    for (offset, &size) in sizes[1..].iter().enumerate() {
        let remainder = rest.split_off(size);
        let pivot = rest[0].set_key(None);
        let created = sheaf.allocate(false);
        branch.items.insert(at + offset, Item::child(pivot, created));
        pages.push(Page::branch(created, rest));
        rest = remainder;
    }
    let first_pivot = branch.items[at]
        .key()
        .map(<[u8]>::to_vec)
        .unwrap_or_default();
    let overflow = branch.items.len() > branch_size;
    let branch_address = branch.address();
    let created: Vec<Address> = pages.iter().map(Page::address).collect();

    let mut images = vec![original, branch];
    images.extend(pages);
    session.publish(images, Vec::new())?;

    sheaf.stats.inc_branch_splits();
    debug!(%address, ?created, parent = %branch_address, "balancer.split_branch");

    Ok(overflow.then(|| split_follow_up(branch_address, first_pivot)))
}

pub(super) fn drain_root(sheaf: &Sheaf) -> Result<Option<Operation>> {
    let mut session = Session::new(sheaf);
    let outcome = drain_root_in(&mut session);
    session.close();
    outcome
}

/// Moves the root's items into new branches so the root keeps its address
/// while the tree grows a level.
fn drain_root_in(session: &mut Session<'_>) -> Result<Option<Operation>> {
    let sheaf = session.sheaf();
    let branch_size = sheaf.options.branch_size;

    let root = session.start()?;
    session.descent(root).exclude();
    session.descend(root, Direction::Leftmost, Stop::Level(0))?;

    let page = session.page(root);
    if page.items.len() <= branch_size {
        return Ok(None);
    }

    let mut items = page.items.clone();
    let sizes = partition(items.len(), branch_size);
    let mut children = Vec::with_capacity(sizes.len());
    let mut pages = Vec::with_capacity(sizes.len());
    for &size in &sizes {
        let rest = items.split_off(size);
        let pivot = items[0].set_key(None);
        let created = sheaf.allocate(false);
        children.push(Item::child(pivot, created));
        pages.push(Page::branch(created, items));
        items = rest;
    }
    let overflow = children.len() > branch_size;
    let created: Vec<Address> = pages.iter().map(Page::address).collect();

    let mut images = vec![Page::branch(Address::ROOT, children)];
    images.extend(pages);
    session.publish(images, Vec::new())?;

    sheaf.stats.inc_root_drains();
    debug!(?created, "balancer.drain_root");

    Ok(overflow.then_some(Operation::DrainRoot))
}
