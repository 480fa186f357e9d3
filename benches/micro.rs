//! Micro-benchmarks for shardkv core operations.
//!
//! Uses Criterion for statistically rigorous measurement with regression
//! detection and HTML reports.
//!
//! # Running
//!
//! ```bash
//! cargo bench --bench micro              # run all micro-benchmarks
//! cargo bench --bench micro -- set       # filter by name
//! ```
//!
//! Reports are generated in `target/criterion/report/index.html`.

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use shardkv::{IndexBackend, RawCodec, Store, StoreConfig};
use tempfile::TempDir;

// ------------------------------------------------------------------------------------------------
// Helpers
// ------------------------------------------------------------------------------------------------

type RawStore = Store<Vec<u8>, RawCodec>;

/// Default value payload for benchmarks (128 bytes).
const VALUE_128B: &[u8; 128] = &[0xAB; 128];

/// Larger value payload (1 KiB).
const VALUE_1K: &[u8; 1024] = &[0xCD; 1024];

fn make_key(i: u64) -> String {
    format!("key-{i:012}")
}

fn create(dir: &std::path::Path, index: IndexBackend) -> RawStore {
    Store::create(
        dir,
        StoreConfig {
            index,
            shard_size: 64 * 1024 * 1024,
            ..StoreConfig::default()
        },
    )
    .expect("create")
}

// ================================================================================================
// Write benchmarks
// ================================================================================================

/// Benchmark group for `set`.
///
/// ## `append/<size>`
///
/// **Scenario:** Every iteration writes a fresh string key through the
/// resolver-backed in-memory index.
///
/// **What it measures:** Serialization, one append to the write shard and one
/// resolver insert. No fsync happens on this path.
///
/// ## `overwrite_same_length`
///
/// **Scenario:** Rewrites 1,000 existing keys with values of identical size.
///
/// **What it measures:** The in-place patch path: index lookup, shard mapping
/// and a `memcpy`. Shards never grow.
///
/// ## `durable_str`
///
/// **Scenario:** Fresh keys through the WAL-backed string index.
///
/// **What it measures:** The cost of logging every index update.
fn bench_set(c: &mut Criterion) {
    let mut group = c.benchmark_group("set");

    for &(label, value) in &[("128B", VALUE_128B.as_slice()), ("1K", VALUE_1K.as_slice())] {
        group.throughput(Throughput::Bytes(value.len() as u64));
        group.bench_function(BenchmarkId::new("append", label), |b| {
            let dir = TempDir::new().unwrap();
            let mut store = create(dir.path(), IndexBackend::default());
            let value = value.to_vec();
            let mut seq = 0u64;

            b.iter(|| {
                store.set(make_key(seq), black_box(&value)).unwrap();
                seq += 1;
            });

            store.close().unwrap();
        });
    }

    group.bench_function("overwrite_same_length", |b| {
        let dir = TempDir::new().unwrap();
        let mut store = create(dir.path(), IndexBackend::default());
        let value = VALUE_128B.to_vec();
        for i in 0..1_000 {
            store.set(make_key(i), &value).unwrap();
        }
        let mut seq = 0u64;

        b.iter(|| {
            store.set(make_key(seq % 1_000), black_box(&value)).unwrap();
            seq += 1;
        });

        store.close().unwrap();
    });

    group.bench_function("durable_str", |b| {
        let dir = TempDir::new().unwrap();
        let mut store = create(dir.path(), IndexBackend::DurableStr);
        let value = VALUE_128B.to_vec();
        let mut seq = 0u64;

        b.iter(|| {
            store.set(make_key(seq), black_box(&value)).unwrap();
            seq += 1;
        });

        store.close().unwrap();
    });

    group.finish();
}

// ================================================================================================
// Read benchmarks
// ================================================================================================

/// Benchmark group for `get`.
///
/// ## `resolver_hit` / `direct_hit`
///
/// **Scenario:** Random reads over 10,000 keys after a reload, so shards are
/// mapped lazily on first touch.
///
/// **What it measures:** Key resolution plus one slice of a mapping. The
/// direct index skips the hash lookup.
///
/// ## `miss`
///
/// **Scenario:** Keys that were never written.
fn bench_get(c: &mut Criterion) {
    let mut group = c.benchmark_group("get");
    let n = 10_000u64;

    {
        let dir = TempDir::new().unwrap();
        let mut store = create(dir.path(), IndexBackend::default());
        for i in 0..n {
            store.set(make_key(i), &VALUE_128B.to_vec()).unwrap();
        }
        store.close().unwrap();
        let mut store: RawStore = Store::load(dir.path()).unwrap();

        group.bench_function("resolver_hit", |b| {
            let mut i = 0u64;
            b.iter(|| {
                let _ = black_box(store.get(make_key(i % n)).unwrap());
                i += 1;
            });
        });

        group.bench_function("miss", |b| {
            let mut i = 0u64;
            b.iter(|| {
                let _ = black_box(store.get(make_key(n + i)).is_err());
                i += 1;
            });
        });
    }

    {
        let dir = TempDir::new().unwrap();
        let mut store = create(dir.path(), IndexBackend::InMemory { direct: true });
        for i in 0..n {
            store.set(i as i64, &VALUE_128B.to_vec()).unwrap();
        }

        group.bench_function("direct_hit", |b| {
            let mut i = 0u64;
            b.iter(|| {
                let _ = black_box(store.get((i % n) as i64).unwrap());
                i += 1;
            });
        });
    }

    group.finish();
}

// ================================================================================================
// Persistence benchmarks
// ================================================================================================

/// Benchmark group for `save` and `load` of a 50,000-key resolver store.
fn bench_persistence(c: &mut Criterion) {
    let mut group = c.benchmark_group("persistence");
    let dir = TempDir::new().unwrap();
    let mut store = create(dir.path(), IndexBackend::default());
    for i in 0..50_000u64 {
        store.set(make_key(i), &VALUE_128B[..16].to_vec()).unwrap();
    }

    group.bench_function("save", |b| {
        b.iter(|| store.save().unwrap());
    });
    store.close().unwrap();

    group.bench_function("load", |b| {
        b.iter(|| {
            let store: RawStore = Store::load(dir.path()).unwrap();
            black_box(store.len().unwrap())
        });
    });

    group.finish();
}

// ================================================================================================
// Group registration
// ================================================================================================

criterion_group!(benches, bench_set, bench_get, bench_persistence);

criterion_main!(benches);
