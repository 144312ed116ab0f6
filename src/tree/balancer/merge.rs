//! Merging adjacent pages and shrinking the tree from the top.
//!
//! A merge finds the lowest common ancestor of the pair by descending to the
//! pivot of the right page, forks from there down both sides while keeping
//! every page on the way locked, and rewrites the left page to hold both
//! pages' items. The right page disappears from its parent; when that parent
//! is left with no items the removal continues up the chain of single-item
//! branches to the first page that can give up an item.

use std::collections::BTreeMap;

use tracing::debug;

use super::session::Session;
use super::{abandon, Operation};
use crate::error::{Result, StrataError};
use crate::tree::descent::{Direction, Stop};
use crate::tree::page::{Address, Page};
use crate::tree::sheaf::Sheaf;

struct Target<'k> {
    left: Option<Address>,
    right: Address,
    right_key: &'k [u8],
    left_ghost_key: Option<&'k [u8]>,
    stop: Stop<'k>,
}

pub(super) fn merge_leaves(
    sheaf: &Sheaf,
    left: Address,
    right: Address,
    left_key: Option<Vec<u8>>,
    right_key: &[u8],
    left_ghost: bool,
) -> Result<Option<Operation>> {
    let target = Target {
        left: Some(left),
        right,
        right_key,
        left_ghost_key: left_key.as_deref().filter(|_| left_ghost),
        stop: Stop::Leaf,
    };
    let mut session = Session::new(sheaf);
    let outcome = merge_in(&mut session, &target);
    session.close();
    outcome
}

pub(super) fn merge_branches(
    sheaf: &Sheaf,
    address: Address,
    depth: i32,
    key: &[u8],
) -> Result<Option<Operation>> {
    let target = Target {
        left: None,
        right: address,
        right_key: key,
        left_ghost_key: None,
        stop: Stop::Level(depth),
    };
    let mut session = Session::new(sheaf);
    let outcome = merge_in(&mut session, &target);
    session.close();
    outcome
}

fn corrupt(message: String) -> StrataError {
    StrataError::Corruption(message)
}

/// Copy-on-write image of a held page, created on first modification.
fn image<'m>(
    images: &'m mut BTreeMap<Address, Page>,
    session: &Session<'_>,
    address: Address,
) -> &'m mut Page {
    images
        .entry(address)
        .or_insert_with(|| session.held(address).clone())
}

fn merge_in(session: &mut Session<'_>, target: &Target<'_>) -> Result<Option<Operation>> {
    let sheaf = session.sheaf();
    let order = &sheaf.order;
    let leaves = target.right.is_leaf();

    let mut keys = vec![target.right_key.to_vec()];
    if let Some(ghost_key) = target.left_ghost_key {
        keys.push(ghost_key.to_vec());
    }

    let marks: Vec<Address> = if leaves {
        target.left.into_iter().chain([target.right]).collect()
    } else {
        Vec::new()
    };

    // Walk to the first pivot naming either page. If it names the left
    // page's ghost, remember where and continue to the common ancestor.
    let pivot = session.start()?;
    if !session.seek(pivot, Direction::Key(target.right_key), Stop::Found(&keys))? {
        abandon(sheaf, "merge pivot vanished", &marks);
        return Ok(None);
    }
    session.upgrade(pivot)?;
    let pivot_page = session.at(pivot).page();
    let pivot_index = session.at(pivot).index();
    let names_right = session.page(pivot).items()[pivot_index]
        .key()
        .is_some_and(|key| order.same(key, target.right_key));
    let (common, ghost_pivot) = if names_right {
        (pivot, None)
    } else {
        let common = session.fork(pivot);
        if !session.seek(common, Direction::Key(target.right_key), Stop::Found(&keys[..1]))? {
            abandon(sheaf, "merge pivot vanished", &marks);
            return Ok(None);
        }
        (common, Some((pivot_page, pivot_index)))
    };
    let common_page = session.at(common).page();
    let common_index = session.at(common).index();

    let left = session.fork(common);
    session.descent(left).set_index(common_index - 1);
    session.descent(left).retain();
    session.descend(left, Direction::Rightmost, target.stop)?;
    let right = session.fork(common);
    session.descent(right).retain();
    session.descend(right, Direction::Leftmost, target.stop)?;

    let left_page = session.page(left);
    let right_page = session.page(right);
    let moved = right_page.address() != target.right
        || target.left.is_some_and(|address| address != left_page.address())
        || (leaves && left_page.right() != Some(right_page.address()));
    if moved {
        abandon(sheaf, "merge pair moved", &marks);
        return Ok(None);
    }
    let fits = if leaves {
        left_page.length() + right_page.length() <= sheaf.options.leaf_size
    } else {
        left_page.items().len() + right_page.items().len() <= sheaf.options.branch_size
    };
    if !fits {
        abandon(sheaf, "merge pair outgrew a page", &marks);
        return Ok(None);
    }

    let mut branches: BTreeMap<Address, Page> = BTreeMap::new();
    let mut merged = left_page.clone();
    if leaves {
        merged.items.extend(right_page.records().cloned());
        merged.right = right_page.right();
    } else {
        let separator = session.held(common_page).items()[common_index]
            .key()
            .map(<[u8]>::to_vec);
        let mut adopted = right_page.items().to_vec();
        if let Some(first) = adopted.first_mut() {
            first.set_key(separator);
        }
        merged.items.extend(adopted);
    }
    let right_address = right_page.address();

    let mut promoted = None;
    if target.left_ghost_key.is_some() && merged.ghosts() > 0 && merged.length() > 0 {
        merged.items.remove(0);
        merged.ghosts = 0;
        let key = merged
            .first_key()
            .ok_or_else(|| corrupt(format!("merged leaf {} is empty", merged.address())))?
            .to_vec();
        let path = session.at(left);
        let located = path
            .ancestors()
            .iter()
            .rev()
            .find_map(|address| match path.indexes().get(address) {
                Some(&index) if index != 0 => Some((*address, index)),
                _ => None,
            });
        let (page, index) = located
            .or(ghost_pivot)
            .ok_or_else(|| corrupt(format!("no pivot for leaf {}", merged.address())))?;
        image(&mut branches, session, page).items[index].set_key(Some(key.clone()));
        promoted = Some(key);
    }

    let chain = session.at(right).ancestors();
    debug_assert_eq!(chain.first(), Some(&common_page));
    let mut deleted = vec![right_address];
    let mut holder = None;
    for &address in chain[1..].iter().rev() {
        if session.held(address).items().len() > 1 {
            holder = Some(address);
            break;
        }
        deleted.push(address);
    }
    let route_key = match holder {
        Some(holder) => {
            let page = image(&mut branches, session, holder);
            page.items.remove(0);
            let lifted = page.items[0].set_key(None);
            let route_key = lifted.clone().unwrap_or_default();
            image(&mut branches, session, common_page).items[common_index].set_key(lifted);
            route_key
        }
        None => {
            image(&mut branches, session, common_page)
                .items
                .remove(common_index);
            // A promoted pivot above the common ancestor now sorts past the
            // old right key, which would route to the left of it.
            match promoted {
                Some(key) if order.compare(&key, target.right_key).is_gt() => key,
                _ => target.right_key.to_vec(),
            }
        }
    };

    let shrunk = holder.unwrap_or(common_page);
    let collapse = shrunk == Address::ROOT
        && branches.get(&Address::ROOT).is_some_and(|root| {
            root.items().len() == 1
                && root.items()[0]
                    .child_address()
                    .is_some_and(Address::is_branch)
        });
    let left_address = merged.address();
    let mut images = vec![merged];
    images.extend(branches.into_values());
    session.publish(images, deleted.clone())?;

    if leaves {
        sheaf.forget(right_address);
        sheaf.mark(left_address);
        sheaf.stats.inc_leaf_merges();
    } else {
        sheaf.stats.inc_branch_merges();
    }
    debug!(left = %left_address, right = %right_address, ?deleted, "balancer.merge");

    if shrunk == Address::ROOT {
        Ok(collapse.then_some(Operation::FillRoot))
    } else {
        Ok(Some(Operation::ChooseBranchesToMerge {
            address: shrunk,
            key: route_key,
        }))
    }
}

/// Looks for a sibling of the branch at `address` that it can merge with,
/// preferring the left sibling.
pub(super) fn choose_branches_to_merge(
    sheaf: &Sheaf,
    address: Address,
    key: &[u8],
) -> Result<Option<Operation>> {
    let mut session = Session::new(sheaf);
    let outcome = choose_in(&mut session, address, key);
    session.close();
    outcome
}

fn choose_in(session: &mut Session<'_>, address: Address, key: &[u8]) -> Result<Option<Operation>> {
    let branch_size = session.sheaf().options.branch_size;

    let center = session.start()?;
    if !session.seek(center, Direction::Key(key), Stop::Address(address))? {
        abandon(session.sheaf(), "branch left the route", &[]);
        return Ok(None);
    }
    let depth = session.at(center).depth();
    let length = session.page(center).items().len();
    let lesser = session.at(center).lesser();
    let greater = session.at(center).greater();

    if let Some(lesser) = lesser {
        let left = sibling(session, key, lesser, depth, true)?;
        if session.page(left).items().len() + length <= branch_size {
            let designator = leftmost_key(session, center)?;
            return Ok(Some(Operation::MergeBranches {
                address,
                depth,
                key: designator,
            }));
        }
        session.release(left);
    }
    if let Some(greater) = greater {
        let right = sibling(session, key, greater, depth, false)?;
        if session.page(right).items().len() + length <= branch_size {
            let designator = leftmost_key(session, right)?;
            return Ok(Some(Operation::MergeBranches {
                address: session.at(right).page(),
                depth,
                key: designator,
            }));
        }
    }
    Ok(None)
}

/// Descends to the neighbor of the path through `ancestor` at `depth`.
fn sibling(
    session: &mut Session<'_>,
    key: &[u8],
    ancestor: Address,
    depth: i32,
    left: bool,
) -> Result<usize> {
    let id = session.start()?;
    session.descend(id, Direction::Key(key), Stop::Address(ancestor))?;
    let index = session.at(id).index();
    if left {
        session.descent(id).set_index(index - 1);
        session.descend(id, Direction::Rightmost, Stop::Level(depth))?;
    } else {
        session.descent(id).set_index(index + 1);
        session.descend(id, Direction::Leftmost, Stop::Level(depth))?;
    }
    Ok(id)
}

/// First key of the leftmost leaf below the page held by descent `id`.
fn leftmost_key(session: &mut Session<'_>, id: usize) -> Result<Vec<u8>> {
    let fork = session.fork(id);
    session.descent(fork).set_index(0);
    session.descend(fork, Direction::Leftmost, Stop::Leaf)?;
    let key = session
        .page(fork)
        .first_key()
        .map(<[u8]>::to_vec)
        .ok_or_else(|| corrupt(format!("leaf {} is empty", session.at(fork).page())))?;
    session.release(fork);
    Ok(key)
}

/// Collapses a root left with a single branch child into that child.
pub(super) fn fill_root(sheaf: &Sheaf) -> Result<Option<Operation>> {
    let mut session = Session::new(sheaf);
    let outcome = fill_root_in(&mut session);
    session.close();
    outcome
}

fn fill_root_in(session: &mut Session<'_>) -> Result<Option<Operation>> {
    let sheaf = session.sheaf();
    let root = session.start()?;
    session.descent(root).exclude();
    session.descend(root, Direction::Leftmost, Stop::Level(0))?;

    let page = session.page(root);
    let child = match page.items() {
        [only] => only.child_address().filter(|child| child.is_branch()),
        _ => None,
    };
    let Some(child) = child else {
        return Ok(None);
    };

    let fork = session.fork(root);
    session.descend(fork, Direction::Leftmost, Stop::Level(1))?;
    let items = session.page(fork).items().to_vec();
    let again = match items.as_slice() {
        [only] => only.child_address().is_some_and(Address::is_branch),
        _ => false,
    };
    session.publish(vec![Page::branch(Address::ROOT, items)], vec![child])?;

    sheaf.stats.inc_root_fills();
    debug!(%child, "balancer.fill_root");
    Ok(again.then_some(Operation::FillRoot))
}
