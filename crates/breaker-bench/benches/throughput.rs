//! Throughput benchmarks for Breaker.
//!
//! These benchmarks measure hub fan-out over in-memory connections, so the
//! numbers exclude any network I/O.

use breaker_bench::Fixture;
use breaker_core::{HubConfig, Message, SlowConsumerPolicy};
use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tokio::runtime::Runtime;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("tokio runtime")
}

/// Benchmark message construction.
fn bench_message(c: &mut Criterion) {
    let mut group = c.benchmark_group("message");

    let payload = Bytes::from(vec![0u8; 64]);
    group.throughput(Throughput::Bytes(64));
    group.bench_function("64B", |b| {
        b.iter(|| Message::new(black_box(payload.clone())))
    });

    let payload = Bytes::from(vec![0u8; 65536]);
    group.throughput(Throughput::Bytes(65536));
    group.bench_function("64KB", |b| {
        b.iter(|| Message::new(black_box(payload.clone())))
    });

    group.finish();
}

/// Benchmark one broadcast reaching every client.
fn bench_fanout(c: &mut Criterion) {
    let mut group = c.benchmark_group("fanout");
    let rt = runtime();
    let payload = Bytes::from(vec![b'x'; 64]);

    for clients in [1usize, 100, 1000] {
        let mut fixture = rt
            .block_on(Fixture::new(HubConfig::default(), clients))
            .expect("fixture");

        group.throughput(Throughput::Elements(clients as u64));
        group.bench_with_input(BenchmarkId::new("block", clients), &clients, |b, _| {
            b.iter(|| {
                rt.block_on(fixture.round_trip(payload.clone()))
                    .expect("broadcast")
            });
        });

        rt.block_on(fixture.hub.shutdown());
    }

    group.finish();
}

/// Benchmark a burst of broadcasts with the non-blocking policy.
fn bench_burst(c: &mut Criterion) {
    let mut group = c.benchmark_group("burst");
    let rt = runtime();
    let payload = Bytes::from(vec![b'x'; 64]);
    const BURST: usize = 100;

    let config = HubConfig {
        slow_consumer: SlowConsumerPolicy::DropNewest,
        outbound_capacity: BURST,
        ..HubConfig::default()
    };
    let mut fixture = rt.block_on(Fixture::new(config, 10)).expect("fixture");

    group.throughput(Throughput::Elements(BURST as u64));
    group.bench_function("drop_newest_100x10", |b| {
        b.iter(|| {
            rt.block_on(async {
                for _ in 0..BURST {
                    fixture
                        .hub
                        .broadcast(payload.clone())
                        .await
                        .expect("broadcast");
                }
                for peer in &mut fixture.peers {
                    for _ in 0..BURST {
                        black_box(peer.recv_data().await);
                    }
                }
            });
        });
    });

    rt.block_on(fixture.hub.shutdown());
    group.finish();
}

criterion_group!(benches, bench_message, bench_fanout, bench_burst);
criterion_main!(benches);
