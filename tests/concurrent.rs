#![allow(missing_docs)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use strata::{MemoryStorage, Order, Result, Strata, StrataError, StrataOptions};

const WRITERS: usize = 4;
const KEYS_PER_WRITER: usize = 150;

fn key(writer: usize, n: usize) -> Vec<u8> {
    format!("{n:04}-{writer}").into_bytes()
}

fn open() -> Result<Arc<Strata>> {
    let options = StrataOptions {
        leaf_size: 4,
        branch_size: 4,
        ..StrataOptions::default()
    };
    Ok(Arc::new(Strata::create(
        Arc::new(MemoryStorage::new()),
        Order::default(),
        options,
    )?))
}

/// Balances until told to stop, tolerating overlap with another balancer.
fn spawn_balancer(tree: Arc<Strata>, stop: Arc<AtomicBool>) -> thread::JoinHandle<Result<usize>> {
    thread::spawn(move || -> Result<usize> {
        let mut passes = 0;
        while !stop.load(Ordering::Acquire) {
            match tree.balance() {
                Ok(true) => passes += 1,
                Ok(false) => thread::yield_now(),
                Err(StrataError::Balancing) => thread::yield_now(),
                Err(err) => return Err(err),
            }
        }
        Ok(passes)
    })
}

#[test]
fn writers_and_balancer_run_together() -> Result<()> {
    let tree = open()?;
    let stop = Arc::new(AtomicBool::new(false));
    let balancer = spawn_balancer(Arc::clone(&tree), Arc::clone(&stop));
    let barrier = Arc::new(Barrier::new(WRITERS));

    let writers: Vec<_> = (0..WRITERS)
        .map(|writer| {
            let tree = Arc::clone(&tree);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || -> Result<()> {
                barrier.wait();
                for n in 0..KEYS_PER_WRITER {
                    tree.insert(key(writer, n))?;
                }
                for n in (0..KEYS_PER_WRITER).step_by(2) {
                    assert_eq!(tree.remove(&key(writer, n))?, Some(key(writer, n)));
                }
                Ok(())
            })
        })
        .collect();
    for writer in writers {
        writer.join().expect("writer panicked")?;
    }
    stop.store(true, Ordering::Release);
    balancer.join().expect("balancer panicked")?;

    tree.balance_fully()?;
    let shape = tree.check()?;
    assert_eq!(shape.records(), WRITERS * KEYS_PER_WRITER / 2);
    for writer in 0..WRITERS {
        assert_eq!(tree.get(&key(writer, 1))?, Some(key(writer, 1)));
        assert_eq!(tree.get(&key(writer, 2))?, None);
    }
    Ok(())
}

#[test]
fn readers_see_every_committed_record() -> Result<()> {
    let tree = open()?;
    for n in 0..200 {
        tree.insert(key(0, n))?;
    }
    tree.balance_fully()?;

    let stop = Arc::new(AtomicBool::new(false));
    let balancer = spawn_balancer(Arc::clone(&tree), Arc::clone(&stop));
    let writer = {
        let tree = Arc::clone(&tree);
        thread::spawn(move || -> Result<()> {
            for n in 0..200 {
                tree.insert(key(1, n))?;
                if n % 3 == 0 {
                    tree.remove(&key(1, n))?;
                }
            }
            Ok(())
        })
    };
    let readers: Vec<_> = (0..3)
        .map(|_| {
            let tree = Arc::clone(&tree);
            thread::spawn(move || -> Result<()> {
                for round in 0..20 {
                    let n = (round * 37) % 200;
                    assert_eq!(tree.get(&key(0, n))?, Some(key(0, n)));
                    let records = tree.records()?;
                    assert!(records.windows(2).all(|pair| pair[0] < pair[1]));
                    assert!(records.len() >= 200);
                }
                Ok(())
            })
        })
        .collect();

    writer.join().expect("writer panicked")?;
    for reader in readers {
        reader.join().expect("reader panicked")?;
    }
    stop.store(true, Ordering::Release);
    balancer.join().expect("balancer panicked")?;

    tree.balance_fully()?;
    assert_eq!(tree.check()?.records(), 200 + 200 - 67);
    Ok(())
}

#[test]
fn second_balancer_is_turned_away_or_finds_nothing() -> Result<()> {
    let tree = open()?;
    for n in 0..400 {
        tree.insert(key(0, n))?;
    }
    let outcomes: Vec<_> = (0..2)
        .map(|_| {
            let tree = Arc::clone(&tree);
            thread::spawn(move || tree.balance())
        })
        .collect();
    for outcome in outcomes {
        match outcome.join().expect("balancer panicked") {
            Ok(_) | Err(StrataError::Balancing) => {}
            Err(err) => return Err(err),
        }
    }
    tree.balance_fully()?;
    assert_eq!(tree.check()?.records(), 400);
    Ok(())
}
