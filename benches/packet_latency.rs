use bytes::Bytes;
use causalcast::config::TransportConfig;
use causalcast::substrate::test_support::LoopbackSubstrate;
use causalcast::transport::CausalTransport;
use causalcast::wire::{Body, DepVec, Packet};
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use std::time::Duration;

/// Connect on a mocked clock and fast-forward past the join deadlines —
/// real time never actually elapses inside a benchmark's setup closure.
fn connected_node() -> CausalTransport<LoopbackSubstrate> {
    let (mut t, mock) = CausalTransport::new_with_mock_clock(
        LoopbackSubstrate::new(1200),
        "bench",
        TransportConfig::default(),
    );
    t.connect().unwrap();
    mock.increment(Duration::from_millis(t.config_passive_join_ms() + 1));
    t.poll_timers();
    for _ in 0..t.config_join_requests() {
        mock.increment(Duration::from_millis(t.config_active_join_interval_ms() + 1));
        t.poll_timers();
    }
    t.drain_events();
    t.substrate_mut().outbound.clear();
    t
}

/// Benchmark the codec hot path: encode + decode a DATA packet.
fn bench_wire_codec(c: &mut Criterion) {
    let payload = Bytes::from(vec![0xABu8; 1100]);
    let packet = Packet {
        sender_id: 7,
        packet_id: Some(42),
        deps: DepVec::new(),
        body: Body::Data {
            part: 0,
            total: 1,
            stream_id: 0,
            payload,
        },
    };

    let mut group = c.benchmark_group("wire");
    group.throughput(Throughput::Elements(1));

    group.bench_function("encode", |b| {
        b.iter(|| black_box(packet.encode(1200).unwrap()));
    });

    let encoded = packet.encode(1200).unwrap();
    group.bench_function("decode", |b| {
        b.iter(|| black_box(Packet::decode(black_box(&encoded))));
    });

    group.finish();
}

/// Benchmark the transport's outbound hot path: send() for a single
/// MTU-sized payload on an already-connected node.
fn bench_transport_send(c: &mut Criterion) {
    let payload = vec![0xABu8; 1100];

    let mut group = c.benchmark_group("transport");
    group.throughput(Throughput::Elements(1));

    group.bench_function("send_single_packet", |b| {
        let mut t = connected_node();
        b.iter(|| {
            t.send(0, black_box(&payload)).unwrap();
            t.substrate_mut().outbound.clear();
        });
    });

    group.finish();
}

/// Benchmark the full send -> on_datagram round trip between two
/// connected nodes (in-process, no network).
fn bench_send_receive_roundtrip(c: &mut Criterion) {
    let payload = vec![0xABu8; 1100];

    let mut group = c.benchmark_group("roundtrip");
    group.throughput(Throughput::Elements(1));

    group.bench_function("send_then_receive", |b| {
        let mut sender = connected_node();
        let mut receiver = connected_node();
        b.iter(|| {
            sender.send(0, black_box(&payload)).unwrap();
            for bytes in sender.substrate_mut().outbound.drain(..) {
                receiver.on_datagram(&bytes);
            }
            for event in receiver.drain_events() {
                black_box(event);
            }
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_wire_codec,
    bench_transport_send,
    bench_send_receive_roundtrip
);
criterion_main!(benches);
