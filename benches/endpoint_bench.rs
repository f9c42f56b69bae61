use std::sync::Arc;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use sockpoint::{Endpoint, MemorySink, SocketKind};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

const CLIENTS: usize = 8;

async fn setup() -> (Arc<Endpoint>, Vec<JoinHandle<()>>) {
    let server = Arc::new(Endpoint::with_sink(
        SocketKind::TcpServer,
        Arc::new(MemorySink::new()),
    ));
    server.create(0, "").await.expect("bench server create");
    let port = server.local_addr().await.unwrap().port();

    // Each client drains its socket so broadcast writes never back up
    let mut drains = Vec::new();
    for _ in 0..CLIENTS {
        let mut client = TcpStream::connect(("127.0.0.1", port))
            .await
            .expect("bench client connect");
        drains.push(tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            while client.read(&mut buf).await.unwrap_or(0) > 0 {}
        }));
    }

    while server.connection_count().await < CLIENTS {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    (server, drains)
}

fn broadcast_benchmark(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let (server, _drains) = rt.block_on(setup());
    let payload = vec![0xA5u8; 512];

    c.bench_function("broadcast_512B_8_clients", |b| {
        b.to_async(&rt).iter(|| {
            let server = server.clone();
            let payload = payload.clone();
            async move {
                let _ = server.broadcast_send(black_box(&payload)).await;
            }
        })
    });
}

criterion_group!(benches, broadcast_benchmark);
criterion_main!(benches);
