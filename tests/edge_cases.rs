#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! Edge-case tests: boundary values, malformed input and resource limits

use std::sync::Arc;

use tagwire::config::{MAGIC_BYTES, MAX_PACKETS, PROTOCOL_VERSION};
use tagwire::core::numeric::{decode_float32, decode_sectorized, encode_float32, FLOAT32_NAN};
use tagwire::core::packet::Packet;
use tagwire::core::schema::PacketSchema;
use tagwire::core::types::{PacketType, FIXED_INT_MAX};
use tagwire::core::value::{EnumPackage, Value};
use tagwire::core::varint::{unvarint, varint, MAX_VARINT};
use tagwire::error::ProtocolError;
use tagwire::protocol::batcher::{unravel_batch, Batcher};
use tagwire::protocol::handshake::{encode_handshake, parse_handshake};
use tagwire::protocol::rate_limit::{DeferredQueue, RateLimiter};
use tagwire::protocol::registry::PacketRegistry;

fn strings(tag: &str) -> Packet {
    Packet::new(tag, PacketSchema::single(PacketType::Strings, 0, 4).unwrap()).unwrap()
}

// ============================================================================
// NUMERIC EDGE CASES
// ============================================================================

#[test]
fn test_varint_bounds() {
    assert_eq!(varint(0).unwrap(), vec![0]);
    assert_eq!(varint(127).unwrap(), vec![0x7F]);
    assert_eq!(varint(128).unwrap(), vec![0x80, 0x01]);

    let top = varint(MAX_VARINT - 1).unwrap();
    assert_eq!(top.len(), 7);
    assert_eq!(unvarint(&top).unwrap(), (MAX_VARINT - 1, 7));
    assert!(varint(MAX_VARINT).is_err());

    // Eight continuation bytes never terminate within the unit cap
    assert!(unvarint(&[0xFF; 8]).is_err());
    // Truncated chain
    assert!(unvarint(&[0x80]).is_err());
}

#[test]
fn test_sectors_reject_mixed_sign() {
    assert_eq!(decode_sectorized(&[0x81, 0x00]).unwrap(), -128);
    assert!(decode_sectorized(&[0x81, 0x05]).is_err());
    assert!(decode_sectorized(&[]).is_err());
    assert!(decode_sectorized(&[0x7F; 11]).is_err());
}

#[test]
fn test_float32_specials() {
    assert_eq!(u32::from_be_bytes(encode_float32(f32::NAN)), FLOAT32_NAN);
    assert!(decode_float32(encode_float32(f32::NAN)).is_nan());
    assert_eq!(decode_float32(encode_float32(f32::INFINITY)), f32::INFINITY);
    assert_eq!(decode_float32(encode_float32(f32::NEG_INFINITY)), f32::NEG_INFINITY);
    assert_eq!(encode_float32(-0.0), [0x80, 0, 0, 0]);
    assert_eq!(decode_float32(encode_float32(f32::MIN_POSITIVE)), f32::MIN_POSITIVE);
    let tiny = f32::from_bits(1);
    assert_eq!(decode_float32(encode_float32(tiny)), tiny);
}

// ============================================================================
// PAYLOAD EDGE CASES
// ============================================================================

#[test]
fn test_fixed_ints_range() {
    let ty = PacketType::IntsFixed;
    let bytes = ty
        .encode(&[Value::Int(FIXED_INT_MAX), Value::Int(-FIXED_INT_MAX)])
        .unwrap();
    assert_eq!(bytes.len(), 4);
    assert_eq!(
        ty.decode(&bytes, 2).unwrap(),
        vec![Value::Int(FIXED_INT_MAX), Value::Int(-FIXED_INT_MAX)]
    );
    assert!(ty.encode(&[Value::Int(FIXED_INT_MAX + 1)]).is_err());
}

#[test]
fn test_dynamic_ints_extremes() {
    let ty = PacketType::IntsDynamic;
    let values = vec![Value::Int(i64::MIN), Value::Int(0), Value::Int(i64::MAX)];
    let bytes = ty.encode(&values).unwrap();
    assert_eq!(ty.decode(&bytes, 3).unwrap(), values);
    // Capacity is enforced on decode
    assert!(ty.decode(&bytes, 2).is_err());
}

#[test]
fn test_raw_arity_counts_characters() {
    let schema = PacketSchema::single(PacketType::Raw, 0, 3).unwrap();
    let packet = Packet::new("raw", schema).unwrap();
    let bytes = packet.encode(&[Value::from("日本語")]).unwrap();
    assert_eq!(bytes.len(), 9);
    assert_eq!(packet.decode(&bytes).unwrap(), vec![Value::from("日本語")]);
    assert!(matches!(
        packet.encode(&[Value::from("four")]),
        Err(ProtocolError::ArityViolation { actual: 4, .. })
    ));
}

#[test]
fn test_strings_reject_bad_utf8_and_overruns() {
    let packet = strings("s");
    assert!(packet.decode(&[2, 0xC3, 0x28]).is_err());
    assert!(packet.decode(&[5, b'a']).is_err());
    assert_eq!(
        packet.decode(&[0, 1, 0]).unwrap(),
        vec![Value::from(""), Value::from("\0")]
    );
}

#[test]
fn test_booleans_truncate_to_capacity() {
    let ty = PacketType::Booleans;
    let flags: Vec<Value> = (0..10).map(|i| Value::Bool(i % 3 == 0)).collect();
    let bytes = ty.encode(&flags).unwrap();
    assert_eq!(bytes.len(), 2);
    assert_eq!(ty.decode(&bytes, 10).unwrap(), flags);
    assert!(ty.decode(&bytes, 7).is_err());
}

#[test]
fn test_enum_index_out_of_range() {
    let package = Arc::new(
        EnumPackage::new("dir", vec!["n".into(), "e".into(), "s".into(), "w".into()]).unwrap(),
    );
    let ty = PacketType::Enum(package);
    assert_eq!(ty.encode(&[Value::from("s")]).unwrap(), vec![2]);
    assert!(ty.encode(&[Value::from("up")]).is_err());
    assert!(ty.decode(&[4], 1).is_err());
}

#[test]
fn test_object_schema_auto_flatten() {
    let schema = PacketSchema::object(
        vec![PacketType::Strings, PacketType::IntsDynamic],
        vec![0, 0],
        vec![8, 8],
    )
    .unwrap()
    .with_auto_flatten(true)
    .unwrap();
    let packet = Packet::new("rows", schema).unwrap();

    let rows = vec![
        Value::List(vec!["a".into(), Value::Int(1)]),
        Value::List(vec!["b".into(), Value::Int(-2)]),
    ];
    let bytes = packet.encode(&rows).unwrap();
    assert_eq!(packet.decode(&bytes).unwrap(), rows);

    let ragged = vec![
        Value::List(vec!["a".into(), Value::Int(1)]),
        Value::List(vec!["b".into()]),
    ];
    assert!(packet.encode(&ragged).is_err());
}

#[test]
fn test_object_section_overrun() {
    let schema = PacketSchema::object(
        vec![PacketType::Strings, PacketType::Booleans],
        vec![0, 0],
        vec![4, 4],
    )
    .unwrap();
    let packet = Packet::new("obj", schema).unwrap();
    assert!(packet.decode(&[9, 1, b'x']).is_err());
    // Trailing bytes after the last section
    assert!(packet.decode(&[0, 0, 7]).is_err());
}

// ============================================================================
// REGISTRY AND HANDSHAKE EDGE CASES
// ============================================================================

#[test]
fn test_registry_capacity() {
    let packets: Vec<Packet> = (0..MAX_PACKETS).map(|i| strings(&format!("p{i}"))).collect();
    let registry = PacketRegistry::register(packets).unwrap();
    assert_eq!(registry.get_key("p254").unwrap(), 255);

    let packets: Vec<Packet> = (0..=MAX_PACKETS).map(|i| strings(&format!("p{i}"))).collect();
    assert!(matches!(
        PacketRegistry::register(packets),
        Err(ProtocolError::RegistryFull(_))
    ));
}

#[test]
fn test_registry_rejects_bad_tags() {
    assert!(matches!(
        PacketRegistry::register(vec![strings("a"), strings("a")]),
        Err(ProtocolError::DuplicateTag(_))
    ));
    assert!(Packet::new("", PacketSchema::single(PacketType::None, 0, 0).unwrap()).is_err());
    assert!(Packet::new("a\0b", PacketSchema::single(PacketType::None, 0, 0).unwrap()).is_err());
    let long = "x".repeat(256);
    assert!(Packet::new(long, PacketSchema::single(PacketType::None, 0, 0).unwrap()).is_err());
}

#[test]
fn test_registry_key_zero_is_never_valid() {
    let registry = PacketRegistry::register(vec![strings("a")]).unwrap();
    assert!(matches!(
        registry.packet_by_key(0),
        Err(ProtocolError::UnknownKey(0))
    ));
    assert!(registry.packet_by_key(2).is_err());
}

#[test]
fn test_empty_registries_handshake() {
    let empty = PacketRegistry::new();
    let bytes = encode_handshake(&empty, &empty, 0).unwrap();
    let mut expected = MAGIC_BYTES.to_vec();
    expected.extend_from_slice(&[PROTOCOL_VERSION, 0x00, 0x00, 0x00]);
    assert_eq!(bytes, expected);

    let parsed = parse_handshake(&bytes).unwrap();
    assert!(parsed.client.is_empty());
    assert_eq!(parsed.rate_window_secs, 0);
}

#[test]
fn test_truncated_handshakes_are_not_protocol() {
    let registry = PacketRegistry::register(vec![strings("a"), strings("b")]).unwrap();
    let bytes = encode_handshake(&registry, &registry, 1).unwrap();
    for len in 0..bytes.len() {
        let err = parse_handshake(&bytes[..len]).unwrap_err();
        assert!(
            matches!(err, ProtocolError::NotProtocol),
            "prefix of {len} bytes gave {err:?}"
        );
    }
    let mut long = bytes.clone();
    long.push(0);
    assert!(parse_handshake(&long).is_err());
}

// ============================================================================
// BATCH AND RATE LIMIT EDGE CASES
// ============================================================================

#[test]
fn test_unravel_rejects_bad_batches() {
    assert!(unravel_batch("b", &[], 0).is_err());
    assert!(unravel_batch("b", &[3, b'x'], 0).is_err());
    assert!(unravel_batch("b", &[0, 0, 0], 2).is_err());
    let empty: &[u8] = &[];
    assert_eq!(unravel_batch("b", &[0, 0], 2).unwrap(), vec![empty, empty]);
}

#[test]
fn test_batcher_overflow_leaves_accumulator() {
    let mut batcher = Batcher::new(9, 1);
    assert!(batcher.batch_packet(b"x").unwrap().is_none());
    assert_eq!(batcher.batch_packet(b"yz").unwrap(), Some(vec![9, 2, b'y', b'z']));
    assert_eq!(batcher.flush(), Some(vec![9, 1, b'x']));
}

#[test]
fn test_rate_limiter_window() {
    let registry = PacketRegistry::register(vec![
        Packet::new(
            "capped",
            PacketSchema::single(PacketType::None, 0, 0)
                .unwrap()
                .with_rate_limit(2),
        )
        .unwrap(),
        strings("free"),
    ])
    .unwrap();
    let mut limiter = RateLimiter::new(&registry);
    assert!(limiter.hit(1));
    assert!(limiter.hit(1));
    assert!(!limiter.hit(1));
    assert!((0..1000).all(|_| limiter.hit(2)));
    assert_eq!(limiter.remaining(2), None);

    limiter.reset();
    assert_eq!(limiter.remaining(1), Some(2));
}

#[test]
fn test_deferred_queue_fifo_per_key() {
    let registry = PacketRegistry::register(vec![Packet::new(
        "capped",
        PacketSchema::single(PacketType::None, 0, 0)
            .unwrap()
            .with_rate_limit(1),
    )
    .unwrap()])
    .unwrap();
    let mut limiter = RateLimiter::new(&registry);
    let mut queue = DeferredQueue::new(2);
    queue.push(1, vec![1]).unwrap();
    queue.push(1, vec![2]).unwrap();
    assert_eq!(queue.push(1, vec![3]), Err(vec![3]));

    assert_eq!(queue.drain_admitted(&mut limiter), vec![(1, vec![1])]);
    limiter.reset();
    assert_eq!(queue.drain_admitted(&mut limiter), vec![(1, vec![2])]);
    assert!(queue.is_empty());
}
