#![allow(missing_docs)]

use std::sync::Arc;

use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use strata::{MemoryStorage, Order, Result, Strata, StrataOptions};

fn open(leaf_size: usize, branch_size: usize) -> Result<Strata> {
    let options = StrataOptions {
        leaf_size,
        branch_size,
        ..StrataOptions::default()
    };
    Strata::create(Arc::new(MemoryStorage::new()), Order::default(), options)
}

fn key(n: u32) -> Vec<u8> {
    format!("{n:05}").into_bytes()
}

#[test]
fn ascending_inserts_build_a_deep_tree() -> Result<()> {
    let tree = open(4, 4)?;
    for n in 0..200 {
        tree.insert(key(n))?;
        if n % 10 == 9 {
            tree.balance_fully()?;
        }
    }
    tree.balance_fully()?;

    let shape = tree.check()?;
    assert!(shape.depth >= 3, "depth {}", shape.depth);
    assert_eq!(shape.records(), 200);
    assert!(shape.leaves.iter().all(|leaf| leaf.len() <= 4));
    let stats = tree.stats();
    assert!(stats.root_drains >= 2);
    assert!(stats.branch_splits > 0);
    Ok(())
}

#[test]
fn shuffled_inserts_then_deletes_shrink_back() -> Result<()> {
    let tree = open(4, 4)?;
    let mut keys: Vec<u32> = (0..300).collect();
    let mut rng = ChaCha8Rng::seed_from_u64(7);
    keys.shuffle(&mut rng);

    for (i, n) in keys.iter().enumerate() {
        tree.insert(key(*n))?;
        if i % 25 == 24 {
            tree.balance_fully()?;
        }
    }
    tree.balance_fully()?;
    let grown = tree.check()?;
    assert_eq!(grown.records(), 300);

    keys.shuffle(&mut rng);
    let (gone, kept) = keys.split_at(290);
    for (i, n) in gone.iter().enumerate() {
        assert_eq!(tree.remove(&key(*n))?, Some(key(*n)));
        if i % 25 == 24 {
            tree.balance_fully()?;
        }
    }
    tree.balance_fully()?;

    let shrunk = tree.check()?;
    let mut expected: Vec<Vec<u8>> = kept.iter().map(|n| key(*n)).collect();
    expected.sort();
    assert_eq!(tree.records()?, expected);
    assert!(shrunk.depth <= grown.depth);
    assert!(shrunk.leaves.len() < grown.leaves.len());
    assert!(tree.stats().leaf_merges > 0);
    Ok(())
}

#[test]
fn draining_every_record_leaves_one_empty_leaf() -> Result<()> {
    let tree = open(3, 3)?;
    for n in 0..60 {
        tree.insert(key(n))?;
    }
    tree.balance_fully()?;
    for n in 0..60 {
        tree.remove(&key(n))?;
    }
    tree.balance_fully()?;

    let shape = tree.check()?;
    assert_eq!(shape.records(), 0);
    assert_eq!(shape.depth, 1);
    assert_eq!(shape.leaves.len(), 1);
    Ok(())
}

#[test]
fn balance_without_candidates_does_nothing() -> Result<()> {
    let tree = open(4, 4)?;
    assert!(!tree.balance()?);
    tree.insert(key(1))?;
    assert!(tree.needs_balance());
    assert!(tree.balance()?);
    assert!(!tree.needs_balance());
    assert_eq!(tree.stats().leaf_splits, 0);
    Ok(())
}
