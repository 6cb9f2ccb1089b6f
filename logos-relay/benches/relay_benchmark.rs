use criterion::{criterion_group, criterion_main, Criterion};
use logos_relay::broker::RelayBroker;
use logos_relay::protocol::RelayMessage;
use logos_relay::registry::ConnectionHandle;
use std::hint::black_box;

fn bench_doc_encode(c: &mut Criterion) {
    let msg = RelayMessage::doc("demo", vec![0u8; 64], "peer_bench");

    c.bench_function("doc_encode_64B", |b| {
        b.iter(|| black_box(black_box(&msg).encode().unwrap()))
    });
}

fn bench_doc_decode(c: &mut Criterion) {
    let encoded = RelayMessage::doc("demo", vec![0u8; 64], "peer_bench")
        .encode()
        .unwrap();

    c.bench_function("doc_decode_64B", |b| {
        b.iter(|| black_box(RelayMessage::decode(black_box(&encoded)).unwrap()))
    });
}

fn bench_large_doc_decode(c: &mut Criterion) {
    let encoded = RelayMessage::doc("demo", vec![42u8; 64 * 1024], "peer_bench")
        .encode()
        .unwrap();

    c.bench_function("doc_decode_64KB", |b| {
        b.iter(|| black_box(RelayMessage::decode(black_box(&encoded)).unwrap()))
    });
}

fn bench_fanout_100_peers(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let broker = RelayBroker::default();

    let (sender, receivers) = rt.block_on(async {
        let mut receivers = Vec::new();
        let mut sender = 0;
        for i in 0..101 {
            let (handle, rx) = ConnectionHandle::channel();
            let id = broker.on_open(handle, format!("bench{i}")).await;
            if i == 0 {
                sender = id;
            }
            receivers.push(rx);
        }
        (sender, receivers)
    });

    let frame = RelayMessage::doc("demo", vec![7u8; 64], "peer_bench")
        .encode()
        .unwrap();

    let mut receivers = receivers;
    c.bench_function("fanout_64B_to_100_peers", |b| {
        b.iter(|| {
            rt.block_on(broker.on_frame(sender, black_box(&frame)));
            // Keep queues from growing across iterations.
            for rx in receivers.iter_mut() {
                while rx.try_recv().is_ok() {}
            }
        })
    });
}

criterion_group!(
    benches,
    bench_doc_encode,
    bench_doc_decode,
    bench_large_doc_decode,
    bench_fanout_100_peers,
);
criterion_main!(benches);
