//! Fan-out benchmarks for courier-core.

use bytes::Bytes;
use courier_core::{ChatHub, ConnectionHandle, Outbound};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tokio::sync::mpsc;

fn populated_hub(size: usize) -> (ChatHub, Vec<mpsc::Receiver<Outbound>>) {
    let hub = ChatHub::new();
    let mut receivers = Vec::with_capacity(size);
    for i in 0..size {
        let (handle, rx) = ConnectionHandle::channel(1024);
        hub.add(&format!("user{i}"), handle);
        receivers.push(rx);
    }
    (hub, receivers)
}

fn drain(receivers: &mut [mpsc::Receiver<Outbound>]) {
    for rx in receivers {
        while rx.try_recv().is_ok() {}
    }
}

fn bench_broadcast(c: &mut Criterion) {
    let frame = Bytes::from_static(
        br#"{"type":"STATUS_UPDATE","chat_id":"r1","status":"read","message_ids":[1],"username":"a"}"#,
    );

    let mut group = c.benchmark_group("broadcast");
    for size in [10usize, 100, 1000] {
        let (hub, mut receivers) = populated_hub(size);
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| {
                let sent = hub.broadcast(black_box(&frame));
                drain(&mut receivers);
                sent
            })
        });
    }
    group.finish();
}

fn bench_send_to(c: &mut Criterion) {
    let (hub, mut receivers) = populated_hub(1000);
    let frame = Bytes::from_static(b"{}");

    c.bench_function("send_to_1000", |b| {
        b.iter(|| {
            let delivered = hub.send_to(black_box("user500"), &frame);
            drain(&mut receivers[500..501]);
            delivered
        })
    });
}

criterion_group!(benches, bench_broadcast, bench_send_to);
criterion_main!(benches);
