//! Pending-request table throughput.
//!
//! Measures register + quorum resolution for a single thread and with
//! several threads resolving disjoint requests against one table.

use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::json;
use tokio::sync::oneshot;
use tokio::time::Instant;

use don_gateway::aggregation::{MatchingPayloadAggregator, Quorum};
use don_gateway::pending::{PendingLimits, PendingRequests, RequestKey};
use don_gateway::Message;

fn table(members: usize, f: usize) -> PendingRequests {
    PendingRequests::new(
        Quorum::new(members, f),
        Arc::new(MatchingPayloadAggregator),
        PendingLimits::default(),
    )
}

fn resolve_one(table: &PendingRequests, sender: &str, id: u64, threshold: usize) {
    let key = RequestKey::new(sender, id.to_string());
    let (tx, rx) = oneshot::channel();
    let deadline = Instant::now() + Duration::from_secs(30);
    table.register(key.clone(), tx, deadline).unwrap();
    let response = Message::new(id.to_string(), "secrets_list", "don", json!({"ok": true}));
    for node in 0..threshold {
        black_box(table.record_response(&key, &format!("node{node}"), response.clone()));
    }
    drop(black_box(rx));
}

fn benchmark_single_thread(c: &mut Criterion) {
    let mut group = c.benchmark_group("pending_resolve");
    for (members, f) in [(4, 1), (16, 5), (31, 10)] {
        let table = table(members, f);
        let mut id = 0u64;
        group.bench_with_input(BenchmarkId::from_parameter(members), &f, |b, &f| {
            b.iter(|| {
                id += 1;
                resolve_one(&table, "0xab", id, f + 1);
            });
        });
    }
    group.finish();
}

fn benchmark_contended(c: &mut Criterion) {
    let mut group = c.benchmark_group("pending_contended");
    group.measurement_time(Duration::from_secs(10));

    for threads in [2usize, 4, 8] {
        group.bench_with_input(BenchmarkId::from_parameter(threads), &threads, |b, &threads| {
            b.iter(|| {
                let table = Arc::new(table(4, 1));
                let handles: Vec<_> = (0..threads)
                    .map(|t| {
                        let table = Arc::clone(&table);
                        std::thread::spawn(move || {
                            let sender = format!("0x{t:02x}");
                            for id in 0..200 {
                                resolve_one(&table, &sender, id, 2);
                            }
                        })
                    })
                    .collect();
                for handle in handles {
                    handle.join().unwrap();
                }
                assert!(table.is_empty());
            });
        });
    }
    group.finish();
}

criterion_group!(benches, benchmark_single_thread, benchmark_contended);
criterion_main!(benches);
