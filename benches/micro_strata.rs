//! Micro benchmarks for tree writes, lookups and balance passes.
#![forbid(unsafe_code)]
#![allow(missing_docs)]

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use strata::{MemoryStorage, Order, Strata, StrataOptions};

const INSERT_COUNT: u64 = 8_192;
const LOOKUP_SAMPLES: usize = 2_048;
const BALANCE_EVERY: u64 = 64;

fn fresh() -> Strata {
    let options = StrataOptions {
        leaf_size: 32,
        branch_size: 32,
        ..StrataOptions::default()
    };
    Strata::create(Arc::new(MemoryStorage::new()), Order::default(), options)
        .expect("create tree")
}

fn key(n: u64) -> Vec<u8> {
    n.to_be_bytes().to_vec()
}

fn load(tree: &Strata, keys: &[u64]) {
    for (i, n) in keys.iter().enumerate() {
        tree.insert(key(*n)).expect("insert");
        if i as u64 % BALANCE_EVERY == BALANCE_EVERY - 1 {
            tree.balance_fully().expect("balance");
        }
    }
    tree.balance_fully().expect("balance");
}

fn micro_strata(c: &mut Criterion) {
    let mut group = c.benchmark_group("micro/strata");
    group.sample_size(20);

    let sequential: Vec<u64> = (0..INSERT_COUNT).collect();
    group.throughput(Throughput::Elements(INSERT_COUNT));
    group.bench_function("sequential_insert", |b| {
        b.iter_batched(
            fresh,
            |tree| {
                load(&tree, &sequential);
                black_box(tree.cached());
            },
            BatchSize::SmallInput,
        );
    });

    let mut shuffled = sequential.clone();
    shuffled.shuffle(&mut ChaCha8Rng::seed_from_u64(0xBEEF_F00D));
    group.bench_function("random_insert", |b| {
        b.iter_batched(
            fresh,
            |tree| {
                load(&tree, &shuffled);
                black_box(tree.cached());
            },
            BatchSize::SmallInput,
        );
    });

    group.bench_function("delete_and_merge", |b| {
        b.iter_batched(
            || {
                let tree = fresh();
                load(&tree, &sequential);
                tree
            },
            |tree| {
                for n in &shuffled {
                    tree.remove(&key(*n)).expect("remove");
                }
                tree.balance_fully().expect("balance");
                black_box(tree.cached());
            },
            BatchSize::SmallInput,
        );
    });

    let tree = fresh();
    load(&tree, &sequential);
    let mut rng = ChaCha8Rng::seed_from_u64(7);
    let probes: Vec<Vec<u8>> = (0..LOOKUP_SAMPLES)
        .map(|_| key(rng.gen_range(0..INSERT_COUNT)))
        .collect();
    group.throughput(Throughput::Elements(LOOKUP_SAMPLES as u64));
    group.bench_function("point_lookup", |b| {
        b.iter(|| {
            for probe in &probes {
                black_box(tree.get(probe).expect("get"));
            }
        });
    });

    group.bench_function("cold_lookup", |b| {
        b.iter(|| {
            tree.purge(0);
            for probe in probes.iter().take(64) {
                black_box(tree.get(probe).expect("get"));
            }
        });
    });

    group.finish();
}

criterion_group!(benches, micro_strata);
criterion_main!(benches);
