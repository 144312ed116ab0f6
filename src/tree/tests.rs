use std::sync::Arc;

use super::*;
use crate::error::{Result, StrataError};
use crate::storage::{Commit, MemoryStorage, Storage};

fn options(leaf_size: usize, branch_size: usize) -> StrataOptions {
    StrataOptions {
        leaf_size,
        branch_size,
        ..StrataOptions::default()
    }
}

fn tree(leaf_size: usize, branch_size: usize) -> Result<Strata> {
    Strata::create(
        Arc::new(MemoryStorage::new()),
        Order::default(),
        options(leaf_size, branch_size),
    )
}

fn fill(tree: &Strata, keys: &str) -> Result<()> {
    for key in keys.chars() {
        tree.insert(key.to_string().into_bytes())?;
    }
    Ok(())
}

fn leaves(shape: &Shape) -> Vec<String> {
    shape
        .leaves
        .iter()
        .map(|keys| {
            keys.iter()
                .map(|key| String::from_utf8_lossy(key).into_owned())
                .collect()
        })
        .collect()
}

#[test]
fn fresh_tree_has_one_empty_leaf() -> Result<()> {
    let tree = tree(3, 3)?;
    let shape = tree.check()?;
    assert_eq!(shape.depth, 1);
    assert_eq!(shape.branches, 1);
    assert_eq!(leaves(&shape), vec![String::new()]);
    assert!(!tree.needs_balance());
    assert!(!tree.balance()?);
    Ok(())
}

#[test]
fn insert_replace_and_remove() -> Result<()> {
    let tree = tree(16, 16)?;
    assert!(tree.insert(b"b".to_vec())?);
    assert!(tree.insert(b"a".to_vec())?);
    assert!(!tree.insert(b"b".to_vec())?);
    assert_eq!(tree.get(b"a")?, Some(b"a".to_vec()));
    assert_eq!(tree.get(b"z")?, None);
    assert_eq!(tree.remove(b"a")?, Some(b"a".to_vec()));
    assert_eq!(tree.remove(b"a")?, None);
    assert_eq!(tree.records()?, vec![b"b".to_vec()]);
    Ok(())
}

#[test]
fn oversized_leaf_splits_at_the_middle() -> Result<()> {
    let tree = tree(3, 16)?;
    fill(&tree, "abcdef")?;
    assert!(tree.needs_balance());
    tree.balance_fully()?;

    let shape = tree.check()?;
    assert_eq!(shape.depth, 1);
    assert_eq!(leaves(&shape), vec!["abc", "def"]);
    assert_eq!(tree.stats().leaf_splits, 1);

    let mut locker = tree.locker();
    locker.lock(Address::ROOT, false)?;
    let pivot = locker.page(Address::ROOT).items()[1].key().map(<[u8]>::to_vec);
    locker.unlock(Address::ROOT);
    locker.dispose();
    assert_eq!(pivot, Some(b"d".to_vec()));
    Ok(())
}

#[test]
fn full_root_drains_into_a_new_level() -> Result<()> {
    let tree = tree(2, 2)?;
    fill(&tree, "abcde")?;
    tree.balance_fully()?;

    let shape = tree.check()?;
    assert_eq!(shape.depth, 2);
    assert_eq!(leaves(&shape), vec!["ab", "cd", "e"]);
    assert_eq!(shape.fanout, vec![2, 2, 1]);
    assert_eq!(tree.stats().root_drains, 1);
    assert_eq!(tree.records()?.len(), 5);
    Ok(())
}

#[test]
fn removing_a_first_record_leaves_a_ghost() -> Result<()> {
    let tree = tree(3, 16)?;
    fill(&tree, "abcdef")?;
    tree.balance_fully()?;

    assert_eq!(tree.remove(b"d")?, Some(b"d".to_vec()));
    assert_eq!(tree.get(b"d")?, None);
    let shape = tree.check()?;
    assert_eq!(leaves(&shape), vec!["abc", "ef"]);
    assert_eq!(shape.ghosts, vec![0, 1]);

    assert!(tree.insert(b"d".to_vec())?);
    let shape = tree.check()?;
    assert_eq!(leaves(&shape), vec!["abc", "def"]);
    assert_eq!(shape.ghosts, vec![0, 0]);
    Ok(())
}

#[test]
fn balancer_deletes_ghosts_and_moves_the_pivot() -> Result<()> {
    let tree = tree(3, 16)?;
    fill(&tree, "abcdef")?;
    tree.balance_fully()?;

    tree.remove(b"d")?;
    tree.balance_fully()?;
    let shape = tree.check()?;
    assert_eq!(leaves(&shape), vec!["abc", "ef"]);
    assert_eq!(shape.ghosts, vec![0, 0]);
    assert_eq!(tree.stats().ghost_deletions, 1);

    // Keys between the old and new pivot now belong to the left leaf.
    assert!(tree.insert(b"d".to_vec())?);
    assert_eq!(leaves(&tree.check()?), vec!["abcd", "ef"]);
    Ok(())
}

#[test]
fn shrunken_neighbors_merge() -> Result<()> {
    let tree = tree(3, 16)?;
    fill(&tree, "abcdef")?;
    tree.balance_fully()?;

    for key in ["b", "c", "e", "f"] {
        tree.remove(key.as_bytes())?;
    }
    tree.balance_fully()?;

    let shape = tree.check()?;
    assert_eq!(shape.depth, 1);
    assert_eq!(leaves(&shape), vec!["ad"]);
    assert_eq!(tree.stats().leaf_merges, 1);
    Ok(())
}

#[test]
fn emptied_right_leaf_merges_away_with_its_ghost() -> Result<()> {
    let tree = tree(3, 16)?;
    fill(&tree, "abcde")?;
    tree.balance_fully()?;
    assert_eq!(leaves(&tree.check()?), vec!["abc", "de"]);

    tree.remove(b"d")?;
    tree.remove(b"e")?;
    tree.balance()?;

    let shape = tree.check()?;
    assert_eq!(leaves(&shape), vec!["abc"]);
    assert_eq!(shape.ghosts, vec![0]);
    let mut locker = tree.locker();
    locker.lock(Address::ROOT, false)?;
    assert_eq!(locker.page(Address::ROOT).items().len(), 1);
    locker.unlock(Address::ROOT);
    locker.dispose();
    Ok(())
}

#[test]
fn emptied_subtree_collapses_back_into_the_root() -> Result<()> {
    let tree = tree(2, 2)?;
    fill(&tree, "abcde")?;
    tree.balance_fully()?;
    assert_eq!(tree.check()?.depth, 2);

    for key in ["c", "d", "e"] {
        tree.remove(key.as_bytes())?;
    }
    tree.balance_fully()?;

    let shape = tree.check()?;
    assert_eq!(shape.depth, 1);
    assert_eq!(leaves(&shape), vec!["ab"]);
    let stats = tree.stats();
    assert_eq!(stats.root_fills, 1);
    assert!(stats.leaf_merges >= 2);
    Ok(())
}

#[test]
fn merge_below_a_ghost_pivot_in_the_root_completes() -> Result<()> {
    let tree = tree(2, 2)?;
    fill(&tree, "abcde")?;
    tree.balance_fully()?;
    fill(&tree, "fgh")?;
    tree.balance_fully()?;
    let shape = tree.check()?;
    assert_eq!(shape.depth, 2);
    assert_eq!(leaves(&shape), vec!["ab", "cd", "ef", "gh"]);
    let aborted = tree.stats().aborted_operations;

    // The root holds the pivot "e" of the emptied leaf, while the pivot "g"
    // of its ghosted neighbor lives in the branch below. Merging them moves
    // the root pivot up to "h".
    for key in ["b", "d", "e", "f", "g"] {
        tree.remove(key.as_bytes())?;
    }
    assert!(tree.balance()?);

    let shape = tree.check()?;
    assert_eq!(shape.depth, 1);
    assert_eq!(leaves(&shape), vec!["ac", "h"]);
    assert_eq!(shape.ghosts, vec![0, 0]);
    let stats = tree.stats();
    assert_eq!(stats.leaf_merges, 2);
    assert_eq!(stats.branch_merges, 1);
    assert_eq!(stats.root_fills, 1);
    assert_eq!(stats.aborted_operations, aborted);
    assert_eq!(tree.get(b"h")?, Some(b"h".to_vec()));

    tree.balance_fully()?;
    assert_eq!(leaves(&tree.check()?), vec!["ac", "h"]);
    Ok(())
}

#[test]
fn check_rejects_an_overfull_branch() -> Result<()> {
    let storage = Arc::new(MemoryStorage::new());
    let leaf = |address: i64, key: &str, right: Option<i64>| {
        let key = key.as_bytes().to_vec();
        Page::leaf(
            Address(address),
            vec![Item::record(key.clone(), key)],
            right.map(Address),
        )
    };
    let mut commit = Commit::new();
    commit.write(&Page::branch(Address::ROOT, vec![Item::child(None, Address(2))]));
    commit.write(&Page::branch(
        Address(2),
        vec![
            Item::child(None, Address(1)),
            Item::child(Some(b"b".to_vec()), Address(3)),
            Item::child(Some(b"c".to_vec()), Address(5)),
        ],
    ));
    commit.write(&leaf(1, "a", Some(3)));
    commit.write(&leaf(3, "b", Some(5)));
    commit.write(&leaf(5, "c", None));
    storage.commit(commit)?;

    let tree = Strata::open(storage.clone(), Order::default(), options(2, 3))?;
    assert_eq!(tree.check()?.fanout, vec![1, 3]);
    let tree = Strata::open(storage, Order::default(), options(2, 2))?;
    assert!(matches!(tree.check(), Err(StrataError::Corruption(_))));
    Ok(())
}

#[test]
fn purge_keeps_the_meta_page() -> Result<()> {
    let storage = Arc::new(MemoryStorage::new());
    let tree = Strata::create(storage.clone(), Order::default(), options(2, 4))?;
    fill(&tree, "abcdefgh")?;
    tree.balance_fully()?;
    assert!(tree.cached() > 1);
    assert!(tree.heft() > 0);

    let evicted = tree.purge(0);
    assert!(evicted > 0);
    assert_eq!(tree.cached(), 1);

    let reads = storage.reads();
    assert_eq!(tree.get(b"g")?, Some(b"g".to_vec()));
    assert!(storage.reads() > reads);
    Ok(())
}

#[test]
fn cursor_walks_the_leaf_chain() -> Result<()> {
    let tree = tree(2, 16)?;
    fill(&tree, "abcdef")?;
    tree.balance_fully()?;

    let mut cursor = tree.first(false)?;
    let mut seen = Vec::new();
    loop {
        seen.extend(
            cursor
                .page()
                .records()
                .filter_map(Item::key)
                .map(<[u8]>::to_vec),
        );
        if !cursor.next()? {
            break;
        }
    }
    cursor.release();
    assert_eq!(seen.concat(), b"abcdef".to_vec());
    Ok(())
}

#[test]
fn shared_cursor_refuses_writes() -> Result<()> {
    let tree = tree(4, 4)?;
    let mut cursor = tree.cursor(b"a", false)?;
    assert!(matches!(
        cursor.insert(b"a".to_vec()),
        Err(StrataError::InvalidArgument(_))
    ));
    Ok(())
}

#[test]
fn exclusive_cursor_rejects_keys_below_its_leaf() -> Result<()> {
    let tree = tree(3, 16)?;
    fill(&tree, "bcdefg")?;
    tree.balance_fully()?;

    let mut cursor = tree.cursor(b"f", true)?;
    assert_ne!(cursor.page().address(), Address::FIRST_LEAF);
    assert!(cursor.found());
    assert!(matches!(
        cursor.insert(b"a".to_vec()),
        Err(StrataError::InvalidArgument(_))
    ));
    Ok(())
}

#[test]
fn exclusive_cursor_rejects_keys_past_its_right_sibling() -> Result<()> {
    let tree = tree(3, 16)?;
    fill(&tree, "abcdef")?;
    tree.balance_fully()?;

    let mut cursor = tree.cursor(b"a", true)?;
    assert_eq!(cursor.index_of(b"b"), Some(Ok(1)));
    assert_eq!(cursor.index_of(b"bb"), Some(Err(2)));
    assert_eq!(cursor.index_of(b"d"), None);
    assert_eq!(cursor.index_of(b"zz"), None);
    assert!(matches!(
        cursor.insert(b"zz".to_vec()),
        Err(StrataError::InvalidArgument(_))
    ));
    assert!(cursor.insert(b"cc".to_vec())?);
    cursor.release();

    assert_eq!(leaves(&tree.check()?), vec!["abccc", "def"]);
    assert_eq!(tree.get(b"zz")?, None);
    Ok(())
}

#[test]
fn cursor_moved_right_takes_the_bounds_of_its_new_leaf() -> Result<()> {
    let tree = tree(2, 16)?;
    fill(&tree, "abcdef")?;
    tree.balance_fully()?;

    let mut cursor = tree.first(true)?;
    assert!(cursor.next()?);
    assert_eq!(cursor.page().first_key(), Some(&b"c"[..]));
    assert_eq!(cursor.index_of(b"a"), None);
    assert_eq!(cursor.index_of(b"e"), None);
    assert!(matches!(
        cursor.insert(b"e0".to_vec()),
        Err(StrataError::InvalidArgument(_))
    ));
    assert!(cursor.insert(b"cc".to_vec())?);

    assert!(cursor.next()?);
    assert_eq!(cursor.index_of(b"zz"), Some(Err(2)));
    assert!(!cursor.next()?);
    cursor.release();

    let shape = tree.check()?;
    assert_eq!(shape.records(), 7);
    assert_eq!(leaves(&shape), vec!["ab", "ccd", "ef"]);
    Ok(())
}

#[test]
fn descent_stops_at_the_penultimate_level() -> Result<()> {
    let tree = tree(2, 16)?;
    fill(&tree, "abcdef")?;
    tree.balance_fully()?;

    let mut locker = tree.locker();
    let mut descent = Descent::new(&mut locker)?;
    descent.descend(&mut locker, Direction::Key(b"e"), Stop::Penultimate)?;
    assert_eq!(descent.page(), Address::ROOT);
    assert_eq!(descent.depth(), 0);
    assert_eq!(descent.index(), 2);

    descent.descend(&mut locker, Direction::Key(b"e"), Stop::Leaf)?;
    assert!(descent.page().is_leaf());
    assert!(descent.found());
    assert_eq!(locker.page(descent.page()).items()[descent.index()].key(), Some(&b"e"[..]));
    descent.release(&mut locker);
    locker.dispose();
    Ok(())
}

#[test]
fn delimited_keys_replace_by_key() -> Result<()> {
    let order = Order::new(Arc::new(Bytewise), Arc::new(Delimited(b'=')));
    let tree = Strata::create(Arc::new(MemoryStorage::new()), order, options(4, 4))?;
    assert!(tree.insert(b"a=1".to_vec())?);
    assert!(!tree.insert(b"a=2".to_vec())?);
    assert_eq!(tree.get(b"a")?, Some(b"a=2".to_vec()));
    Ok(())
}

#[test]
fn create_refuses_used_storage() -> Result<()> {
    let storage = Arc::new(MemoryStorage::new());
    Strata::create(storage.clone(), Order::default(), options(4, 4))?;
    let again = Strata::create(storage, Order::default(), options(4, 4));
    assert!(matches!(again, Err(StrataError::InvalidArgument(_))));
    Ok(())
}
