use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use tagwire::core::numeric::{decode_sectorized, encode_sectorized, pack_booleans};
use tagwire::core::packet::Packet;
use tagwire::core::schema::PacketSchema;
use tagwire::core::types::PacketType;
use tagwire::core::value::Value;
use tagwire::core::varint::{unvarint, varint};
use tagwire::protocol::batcher::{unravel_batch, Batcher};
use tagwire::protocol::handshake::{encode_handshake, parse_handshake};
use tagwire::protocol::registry::PacketRegistry;

#[allow(clippy::unwrap_used)]
fn bench_primitives(c: &mut Criterion) {
    let mut group = c.benchmark_group("primitives");
    group.bench_function("varint_roundtrip", |b| {
        b.iter(|| {
            let bytes = varint(black_box(1_234_567)).unwrap();
            unvarint(&bytes).unwrap()
        })
    });
    group.bench_function("sectors_roundtrip", |b| {
        b.iter(|| {
            let bytes = encode_sectorized(black_box(-9_876_543), 4).unwrap();
            decode_sectorized(&bytes).unwrap()
        })
    });
    let flags: Vec<bool> = (0..256).map(|i| i % 3 == 0).collect();
    group.bench_function("pack_256_booleans", |b| b.iter(|| pack_booleans(black_box(&flags))));
    group.finish();
}

#[allow(clippy::unwrap_used)]
fn bench_payloads(c: &mut Criterion) {
    let mut group = c.benchmark_group("payloads");
    let sizes = [8usize, 64, 512];

    for &count in &sizes {
        let schema = PacketSchema::single(PacketType::IntsDynamic, 0, count as u32).unwrap();
        let packet = Packet::new("ints", schema).unwrap();
        let values: Vec<Value> = (0..count as i64).map(|n| Value::Int(n * 977 - 40_000)).collect();
        let encoded = packet.encode(&values).unwrap();

        group.throughput(Throughput::Elements(count as u64));
        group.bench_function(format!("encode_{count}_ints"), |b| {
            b.iter(|| packet.encode(black_box(&values)).unwrap())
        });
        group.bench_function(format!("decode_{count}_ints"), |b| {
            b.iter(|| packet.decode(black_box(&encoded)).unwrap())
        });
    }

    let schema = PacketSchema::single(PacketType::Strings, 0, 16).unwrap();
    let packet = Packet::new("words", schema).unwrap();
    let words: Vec<Value> = (0..16).map(|i| Value::Str(format!("word number {i}"))).collect();
    let encoded = packet.encode(&words).unwrap();
    group.bench_function("decode_16_strings", |b| {
        b.iter(|| packet.decode(black_box(&encoded)).unwrap())
    });
    group.finish();
}

#[allow(clippy::unwrap_used)]
fn bench_batching(c: &mut Criterion) {
    let mut group = c.benchmark_group("batching");
    let payload = vec![0xABu8; 32];
    group.bench_function("batch_and_unravel_100", |b| {
        b.iter_batched(
            || Batcher::new(1, 0),
            |mut batcher| {
                for _ in 0..100 {
                    batcher.batch_packet(&payload).unwrap();
                }
                let message = batcher.flush().unwrap();
                unravel_batch("bench", &message[1..], 0).unwrap().len()
            },
            BatchSize::SmallInput,
        )
    });
    group.finish();
}

#[allow(clippy::unwrap_used)]
fn bench_handshake(c: &mut Criterion) {
    let packets = (0..64)
        .map(|i| {
            let schema = PacketSchema::single(PacketType::Strings, 0, 4)
                .unwrap()
                .with_rate_limit(10);
            Packet::new(format!("packet-{i}"), schema).unwrap()
        })
        .collect();
    let registry = PacketRegistry::register(packets).unwrap();
    let bytes = encode_handshake(&registry, &registry, 1).unwrap();

    let mut group = c.benchmark_group("handshake");
    group.throughput(Throughput::Bytes(bytes.len() as u64));
    group.bench_function("encode_64_packets", |b| {
        b.iter(|| encode_handshake(&registry, &registry, 1).unwrap())
    });
    group.bench_function("parse_64_packets", |b| {
        b.iter(|| parse_handshake(black_box(&bytes)).unwrap())
    });
    group.finish();
}

criterion_group!(benches, bench_primitives, bench_payloads, bench_batching, bench_handshake);
criterion_main!(benches);
