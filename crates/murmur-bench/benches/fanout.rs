//! Fan-out benchmarks for Murmur.
//!
//! These benchmarks measure a broadcast through the hub's dispatch task and
//! the cost of presence bookkeeping.

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use murmur_core::{BroadcastHub, ClientHandle, ConnectionRegistry, PresenceTracker};
use murmur_protocol::{codec, ChatMessage};
use std::sync::Arc;
use tokio::runtime::Runtime;
use tokio::sync::mpsc;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap()
}

fn attach_clients(hub: &BroadcastHub, count: usize) -> Vec<mpsc::Receiver<Bytes>> {
    (0..count)
        .map(|i| {
            let (handle, rx) = ClientHandle::new(format!("user-{}", i), 256);
            hub.registry().register(handle);
            rx
        })
        .collect()
}

/// Benchmark one payload delivered to every client.
fn bench_fanout(c: &mut Criterion) {
    let rt = runtime();
    let _guard = rt.enter();

    let payload = codec::encode(&ChatMessage::new("alice", "x".repeat(64))).unwrap();
    let mut group = c.benchmark_group("fanout");

    for size in [10, 100, 1000, 10000].iter() {
        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let hub = BroadcastHub::spawn(Arc::new(ConnectionRegistry::new()));
            let mut rxs = attach_clients(&hub, size);

            b.iter(|| {
                hub.broadcast(black_box(payload.clone()));
                rt.block_on(hub.flush());
                for rx in &mut rxs {
                    let _ = rx.try_recv();
                }
            });
        });
    }

    group.finish();
}

/// Benchmark registry churn.
fn bench_registry(c: &mut Criterion) {
    let mut group = c.benchmark_group("registry");

    group.bench_function("register_unregister", |b| {
        let registry = ConnectionRegistry::new();
        b.iter(|| {
            let (handle, _rx) = ClientHandle::new("bench", 1);
            let id = handle.id();
            registry.register(handle);
            registry.unregister(black_box(id))
        });
    });

    group.bench_function("active_handles_1000", |b| {
        let registry = ConnectionRegistry::new();
        let _rxs: Vec<_> = (0..1000)
            .map(|i| {
                let (handle, rx) = ClientHandle::new(format!("user-{}", i), 1);
                registry.register(handle);
                rx
            })
            .collect();

        b.iter(|| registry.active_handles());
    });

    group.finish();
}

/// Benchmark presence mutations and snapshots.
fn bench_presence(c: &mut Criterion) {
    let mut group = c.benchmark_group("presence");

    group.bench_function("online_offline", |b| {
        let tracker = PresenceTracker::new();
        b.iter(|| {
            tracker.mark_online(black_box("alice"));
            tracker.mark_offline(black_box("alice"))
        });
    });

    group.bench_function("snapshot_1000_users", |b| {
        let tracker = PresenceTracker::new();
        for i in 0..1000 {
            tracker.mark_online(&format!("user-{}", i));
        }
        b.iter(|| tracker.snapshot());
    });

    group.finish();
}

criterion_group!(benches, bench_fanout, bench_registry, bench_presence);
criterion_main!(benches);
