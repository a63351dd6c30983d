//! Performance benchmarks for a3s-session
//!
//! Run with: cargo bench

use a3s_session::{ClientSession, LoopbackTransport, Pollable, ServerSession};
use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use std::sync::Arc;

const PORT: u16 = 27020;
const ADDRESS: &str = "127.0.0.1:27020";

/// Server with `count` connected clients over one loopback transport
fn setup(count: usize) -> (Arc<LoopbackTransport>, ServerSession, Vec<ClientSession>) {
    let transport = Arc::new(LoopbackTransport::new());
    let mut server = ServerSession::new(transport.clone());
    server.set_message_handler(|_, bytes| {
        criterion::black_box(bytes);
    });
    server.initialize(PORT).unwrap();

    let mut clients: Vec<ClientSession> = (0..count)
        .map(|_| {
            let mut client = ClientSession::new(transport.clone());
            client.set_message_handler(|bytes| {
                criterion::black_box(bytes);
            });
            client.connect(ADDRESS).unwrap();
            client
        })
        .collect();

    for _ in 0..3 {
        server.poll();
        for client in clients.iter_mut() {
            client.poll();
        }
    }
    assert_eq!(server.client_count(), count);
    (transport, server, clients)
}

fn bench_handshake(c: &mut Criterion) {
    c.bench_function("connect + accept", |b| {
        b.iter_batched(
            || {
                let transport = Arc::new(LoopbackTransport::new());
                let mut server = ServerSession::new(transport.clone());
                server.initialize(PORT).unwrap();
                let client = ClientSession::new(transport);
                (server, client)
            },
            |(mut server, mut client)| {
                client.connect(ADDRESS).unwrap();
                while !client.is_connected() {
                    server.poll();
                    client.poll();
                }
                (server, client)
            },
            BatchSize::SmallInput,
        );
    });
}

fn bench_broadcast(c: &mut Criterion) {
    let payload = vec![0u8; 256];

    let mut group = c.benchmark_group("broadcast_reliable");
    for count in [1, 10, 100] {
        let (_transport, server, mut clients) = setup(count);
        group.bench_function(format!("{} clients", count), |b| {
            b.iter(|| {
                let summary = server.broadcast_reliable_message(&payload);
                for client in clients.iter_mut() {
                    client.receive_messages();
                }
                summary
            });
        });
    }
    group.finish();

    let (_transport, server, mut clients) = setup(10);
    c.bench_function("broadcast_unreliable (10 clients)", |b| {
        b.iter(|| {
            let summary = server.broadcast_unreliable_message(&payload);
            for client in clients.iter_mut() {
                client.receive_messages();
            }
            summary
        });
    });
}

fn bench_receive(c: &mut Criterion) {
    let (_transport, mut server, clients) = setup(10);

    c.bench_function("server receive (10 clients x 16 messages)", |b| {
        b.iter(|| {
            for client in &clients {
                for _ in 0..16 {
                    client.send_reliable_to_server(b"position update").unwrap();
                }
            }
            server.receive_messages()
        });
    });
}

fn bench_idle_poll(c: &mut Criterion) {
    let (_transport, mut server, _clients) = setup(10);

    c.bench_function("idle poll", |b| {
        b.iter(|| server.poll());
    });
}

criterion_group!(
    benches,
    bench_handshake,
    bench_broadcast,
    bench_receive,
    bench_idle_poll,
);
criterion_main!(benches);
