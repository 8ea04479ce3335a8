//! # Selection Benchmarks
//!
//! Connection selection is on the path of every call, so it must stay cheap
//! whether the cluster is healthy or half of it is banned.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tonic::Status;

use cluster_balancer::conn::{ClientStream, ConnState, Connection, PooledConnection, StreamDesc, Transport};
use cluster_balancer::load_balancing::{ConnectionsState, Preference, SelectionStrategy};
use cluster_balancer::{Context, Endpoint};

#[derive(Debug)]
struct NullTransport;

#[async_trait]
impl Transport for NullTransport {
    async fn unary(&self, _ctx: &Context, _method: &str, _request: Bytes) -> Result<Bytes, Status> {
        Ok(Bytes::new())
    }

    async fn stream(&self, _ctx: &Context, _desc: &StreamDesc, _method: &str) -> Result<ClientStream, Status> {
        Err(Status::unimplemented("streams"))
    }
}

fn cluster(size: usize, banned: usize) -> Vec<Arc<dyn Connection>> {
    (0..size)
        .map(|i| {
            let location = if i % 3 == 0 { "sas" } else { "vla" };
            let endpoint = Endpoint::new(format!("10.0.0.{}:2135", i))
                .with_node_id(i as u32 + 1)
                .with_location(location);
            let conn: Arc<dyn Connection> = Arc::new(PooledConnection::new(endpoint, Arc::new(NullTransport)));
            conn.set_state(if i < banned { ConnState::Banned } else { ConnState::Allowed });
            conn
        })
        .collect()
}

fn benchmark_get_connection(c: &mut Criterion) {
    let mut group = c.benchmark_group("get_connection");
    let ctx = Context::background();

    for size in [3usize, 30, 300] {
        for (label, strategy) in [("round_robin", SelectionStrategy::RoundRobin), ("random", SelectionStrategy::Random)] {
            let state = ConnectionsState::new(cluster(size, 0), &Preference::SelfLocation, "vla", true, strategy);
            group.bench_with_input(BenchmarkId::new(label, size), &state, |b, state| {
                b.iter(|| black_box(state.get_connection(&ctx)))
            });
        }

        let degraded = ConnectionsState::new(
            cluster(size, size / 2),
            &Preference::All,
            "",
            true,
            SelectionStrategy::RoundRobin,
        );
        group.bench_with_input(BenchmarkId::new("half_banned", size), &degraded, |b, state| {
            b.iter(|| black_box(state.get_connection(&ctx)))
        });
    }

    group.finish();
}

fn benchmark_node_routing(c: &mut Criterion) {
    let state = ConnectionsState::new(cluster(300, 0), &Preference::All, "", false, SelectionStrategy::RoundRobin);
    let ctx = Context::background().with_node_id(150);

    c.bench_function("get_connection_by_node_id", |b| {
        b.iter(|| black_box(state.get_connection(&ctx)))
    });
}

criterion_group!(benches, benchmark_get_connection, benchmark_node_routing);
criterion_main!(benches);
