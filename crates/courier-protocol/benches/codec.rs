//! Codec benchmarks for courier-protocol.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use courier_protocol::{codec, Command, Message};

const BUS_MESSAGE: &[u8] = br#"{"command":{"command":"message","users":"u1, u2, u3","page":"/feed"},"message":{"event":"comment","data":{"id":12345,"internal_url":"app://c/12345","message":"hello there"}}}"#;

fn bench_decode_envelope(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Bytes(BUS_MESSAGE.len() as u64));
    group.bench_function("bus_message", |b| {
        b.iter(|| codec::decode_envelope(black_box(BUS_MESSAGE)))
    });
    group.finish();
}

fn bench_parse_command(c: &mut Criterion) {
    let envelope = codec::decode_envelope(BUS_MESSAGE).unwrap();

    c.bench_function("parse_command", |b| {
        b.iter(|| Command::parse(black_box(&envelope)))
    });
}

fn bench_format_and_encode(c: &mut Criterion) {
    let envelope = codec::decode_envelope(BUS_MESSAGE).unwrap();

    c.bench_function("format_encode_message", |b| {
        b.iter(|| {
            let message = Message::format(black_box(&envelope.message), 1_700_000_000).unwrap();
            codec::encode_message(&message).unwrap()
        })
    });
}

criterion_group!(
    benches,
    bench_decode_envelope,
    bench_parse_command,
    bench_format_and_encode
);
criterion_main!(benches);
