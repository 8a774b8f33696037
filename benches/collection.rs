//! # Hash Collection Benchmarks
//!
//! Measures the hot paths of the collection over an anonymous arena:
//!
//! - Point insert of fresh keys
//! - Lock-free point read
//! - Same-key overwrite (version-chain growth plus cleaner hand-off)
//! - Overwrite with an interleaved reclamation sweep
//!
//! ## Running Benchmarks
//!
//! ```bash
//! cargo bench --bench collection
//! cargo bench --bench collection -- put       # Only insert benchmarks
//! cargo bench --bench collection -- get       # Only read benchmarks
//! ```

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use burrowdb::config::{EDGE_LOCK_TABLE_SIZE, MAX_ACCESS_THREADS};
use burrowdb::{
    Allocator, Arena, HashCollection, HashIndex, LockTable, OldDataRecord, OldRecordsCleaner,
    ThreadRegistry, VersionController,
};

struct Bench {
    version: Arc<VersionController>,
    cleaner: Arc<OldRecordsCleaner>,
    registry: Arc<ThreadRegistry>,
    hash: HashCollection,
}

fn bench_stack(arena_bytes: u64, index_slots: usize) -> Bench {
    let allocator = Arc::new(Allocator::new(Arena::anonymous(arena_bytes).unwrap()));
    let index = Arc::new(HashIndex::new(index_slots, Arc::clone(&allocator)));
    let locks = Arc::new(LockTable::new(EDGE_LOCK_TABLE_SIZE));
    let version = Arc::new(VersionController::new());
    let cleaner = Arc::new(OldRecordsCleaner::new(
        Arc::clone(&allocator),
        Arc::clone(&index),
        Arc::clone(&locks),
        Arc::clone(&version),
        MAX_ACCESS_THREADS,
    ));
    let hash = HashCollection::create(
        b"bench",
        1,
        Arc::clone(&allocator),
        index,
        locks,
        version.fetch_timestamp(),
    )
    .unwrap();
    Bench {
        version,
        cleaner,
        registry: ThreadRegistry::new(MAX_ACCESS_THREADS),
        hash,
    }
}

fn bench_put_fresh_keys(c: &mut Criterion) {
    let mut group = c.benchmark_group("put");
    group.throughput(Throughput::Elements(1));
    group.bench_function("fresh_key", |b| {
        let bench = bench_stack(1 << 30, 1 << 20);
        let mut i: u64 = 0;
        b.iter(|| {
            let key = i.to_le_bytes();
            let ts = bench.version.fetch_timestamp();
            bench.hash.put(black_box(&key), b"value-payload", ts).unwrap();
            i += 1;
        });
    });
    group.finish();
}

fn bench_get(c: &mut Criterion) {
    let mut group = c.benchmark_group("get");
    group.throughput(Throughput::Elements(1));
    group.bench_function("hit", |b| {
        let bench = bench_stack(1 << 26, 1 << 16);
        for i in 0u64..10_000 {
            let ts = bench.version.fetch_timestamp();
            bench.hash.put(&i.to_le_bytes(), b"value-payload", ts).unwrap();
        }
        let mut i: u64 = 0;
        b.iter(|| {
            let key = (i % 10_000).to_le_bytes();
            let value = bench.hash.get(black_box(&key));
            debug_assert!(value.is_some());
            i += 1;
            value
        });
    });
    group.bench_function("miss", |b| {
        let bench = bench_stack(1 << 22, 1 << 12);
        b.iter(|| bench.hash.get(black_box(b"never-written")));
    });
    group.finish();
}

fn bench_overwrite(c: &mut Criterion) {
    let mut group = c.benchmark_group("overwrite");
    group.throughput(Throughput::Elements(1));
    group.bench_function("same_key", |b| {
        let bench = bench_stack(1 << 30, 1 << 12);
        let thread = bench.registry.register().unwrap();
        let ts = bench.version.fetch_timestamp();
        bench.hash.put(b"hot", b"0", ts).unwrap();
        b.iter(|| {
            let ts = bench.version.fetch_timestamp();
            let result = bench.hash.put(b"hot", black_box(b"value-payload"), ts).unwrap();
            if let Some(old) = result.existing {
                bench.cleaner.push_data(
                    &thread,
                    OldDataRecord {
                        record: old,
                        newer_version_ts: ts,
                    },
                );
            }
        });
    });
    group.bench_function("same_key_with_sweep", |b| {
        let bench = bench_stack(1 << 26, 1 << 12);
        let thread = bench.registry.register().unwrap();
        let ts = bench.version.fetch_timestamp();
        bench.hash.put(b"hot", b"0", ts).unwrap();
        let mut round: u64 = 0;
        b.iter(|| {
            let ts = bench.version.fetch_timestamp();
            let result = bench.hash.put(b"hot", black_box(b"value-payload"), ts).unwrap();
            if let Some(old) = result.existing {
                bench.cleaner.push_data(
                    &thread,
                    OldDataRecord {
                        record: old,
                        newer_version_ts: ts,
                    },
                );
            }
            round += 1;
            if round % 1024 == 0 {
                bench.cleaner.try_clean_all();
            }
        });
    });
    group.finish();
}

criterion_group!(benches, bench_put_fresh_keys, bench_get, bench_overwrite);
criterion_main!(benches);
