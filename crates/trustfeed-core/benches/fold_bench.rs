//! Benchmarks for change log folding
//!
//! Run with: cargo bench -p trustfeed-core
//!
//! Baselines for replaying a whole log into fresh projections, and for a
//! node's append-and-wait write path.

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tokio::runtime::Runtime;
use trustfeed_core::content::ObjectStore;
use trustfeed_core::kv::MemoryStore;
use trustfeed_core::log::MemoryLog;
use trustfeed_core::node::fold_all;
use trustfeed_core::{Ed25519Protocol, LogStore, Node, NodeConfig, NodeKeys, NodeOptions, Object};

/// A node log holding `count` created objects, plus the content they reference
fn seeded_log(rt: &Runtime, count: usize) -> (Arc<dyn LogStore>, ObjectStore) {
    rt.block_on(async {
        let log: Arc<dyn LogStore> = Arc::new(MemoryLog::new());
        let kv = MemoryStore::shared();
        let mut options = NodeOptions::memory(NodeKeys::generate().unwrap());
        options.log = log.clone();
        options.kv = kv.clone();
        let node = Node::open(options).await.unwrap();

        for i in 0..count {
            node.create(Object::new("thang").with("i", i as u64))
                .await
                .unwrap();
        }
        node.close();

        (log, ObjectStore::new(kv, Arc::new(Ed25519Protocol)))
    })
}

// ============================================================================
// Replay Benchmarks
// ============================================================================

fn bench_replay(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let config = NodeConfig::default();
    let mut group = c.benchmark_group("replay");

    for size in [100, 1_000] {
        let (log, content) = seeded_log(&rt, size);
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| {
                black_box(
                    fold_all(log.clone(), content.clone(), MemoryStore::shared(), &config)
                        .unwrap(),
                )
            })
        });
    }

    group.finish();
}

// ============================================================================
// Write Path Benchmarks
// ============================================================================

fn bench_create(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let node = rt.block_on(async {
        Node::open(NodeOptions::memory(NodeKeys::generate().unwrap()))
            .await
            .unwrap()
    });
    let mut i = 0u64;

    c.bench_function("create_object", |b| {
        b.to_async(&rt).iter(|| {
            i += 1;
            let object = Object::new("thang").with("i", i);
            let node = &node;
            async move { black_box(node.create(object).await.unwrap()) }
        })
    });
}

criterion_group!(benches, bench_replay, bench_create);
criterion_main!(benches);
