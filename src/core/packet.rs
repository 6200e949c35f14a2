//! Packet definitions and their self-describing registry record.
//!
//! ## Record Format
//! ```text
//! [flags(1)] [slots(varint), object only] [min(varint) max(varint)]*slots
//! [type(1) enum-def?]*slots [batch_ms(varint)] [max_batch(varint)]
//! [rate(varint)] [tag_len(1)] [tag]
//! ```
//! The flags byte always has its high bit set, so a record can never start
//! with the registry delimiter.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::DELIMITER;
use crate::core::schema::PacketSchema;
use crate::core::types::PacketType;
use crate::core::value::Value;
use crate::core::varint::{write_varint, Reader};
use crate::error::{constants, ProtocolError, Result};

/// Longest tag in bytes (its length prefix is one byte)
pub const MAX_TAG_LEN: usize = u8::MAX as usize;

const FLAG_RECORD: u8 = 0x80;
const FLAG_SPREAD: u8 = 0x01;
const FLAG_FLATTEN: u8 = 0x02;
const FLAG_OBJECT: u8 = 0x04;
const FLAG_ENABLED: u8 = 0x08;
const FLAG_KNOWN: u8 = FLAG_RECORD | FLAG_SPREAD | FLAG_FLATTEN | FLAG_OBJECT | FLAG_ENABLED;

/// Post-decode payload check; `false` is treated like a malformed payload.
pub type Validator = Arc<dyn Fn(&[Value]) -> bool + Send + Sync + 'static>;

/// One named message kind.
pub struct Packet {
    tag: String,
    schema: PacketSchema,
    validator: Option<Validator>,
    enabled: AtomicBool,
}

impl Packet {
    pub fn new(tag: impl Into<String>, schema: PacketSchema) -> Result<Self> {
        let tag = tag.into();
        validate_tag(&tag)?;
        Ok(Self {
            tag,
            schema,
            validator: None,
            enabled: AtomicBool::new(true),
        })
    }

    /// Run `validator` on every decoded payload of this packet
    pub fn with_validator<F>(mut self, validator: F) -> Self
    where
        F: Fn(&[Value]) -> bool + Send + Sync + 'static,
    {
        self.validator = Some(Arc::new(validator));
        self
    }

    /// Start out disabled
    pub fn disabled(self) -> Self {
        self.enabled.store(false, Ordering::Relaxed);
        self
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn schema(&self) -> &PacketSchema {
        &self.schema
    }

    pub fn has_validator(&self) -> bool {
        self.validator.is_some()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// The only mutation allowed after registration.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /// Encode values for sending.
    pub fn encode(&self, values: &[Value]) -> Result<Vec<u8>> {
        self.schema.encode(&self.tag, values)
    }

    /// Validate, decode and run the validator over a received payload.
    pub fn decode(&self, bytes: &[u8]) -> Result<Vec<Value>> {
        if !self.schema.validate(bytes) {
            return Err(ProtocolError::MalformedPayload {
                tag: self.tag.clone(),
                reason: constants::ERR_CAPACITY.to_string(),
            });
        }
        let decoded = self
            .schema
            .decode(bytes)
            .map_err(|e| ProtocolError::malformed(&self.tag, e))?;
        if let Some(validator) = &self.validator {
            if !validator(decoded.as_slice()) {
                return Err(ProtocolError::MalformedPayload {
                    tag: self.tag.clone(),
                    reason: constants::ERR_VALIDATOR_REJECTED.to_string(),
                });
            }
        }
        Ok(decoded)
    }

    /// Append this packet's record.
    pub fn serialize_into(&self, out: &mut Vec<u8>) -> Result<()> {
        let schema = &self.schema;
        let mut flags = FLAG_RECORD;
        if schema.spread() {
            flags |= FLAG_SPREAD;
        }
        if schema.auto_flatten() {
            flags |= FLAG_FLATTEN;
        }
        if schema.is_object() {
            flags |= FLAG_OBJECT;
        }
        if self.is_enabled() {
            flags |= FLAG_ENABLED;
        }
        out.push(flags);

        let slots = schema.slots();
        if schema.is_object() {
            write_varint(out, slots.len() as u64)?;
        }
        for slot in slots {
            write_varint(out, u64::from(slot.min))?;
            write_varint(out, u64::from(slot.max))?;
        }
        for slot in slots {
            slot.ty.serialize_into(out)?;
        }
        write_varint(out, u64::from(schema.batching_ms()))?;
        write_varint(out, u64::from(schema.max_batch_size()))?;
        write_varint(out, u64::from(schema.rate_limit()))?;
        out.push(self.tag.len() as u8);
        out.extend_from_slice(self.tag.as_bytes());
        Ok(())
    }

    /// Parse one record. Validators never travel; rebuilt packets have none.
    pub fn deserialize_from(reader: &mut Reader<'_>) -> Result<Self> {
        let flags = reader.read_u8()?;
        if flags & FLAG_RECORD == 0 || flags & !FLAG_KNOWN != 0 {
            return Err(ProtocolError::Decode(constants::ERR_NOT_PROTOCOL));
        }

        let object = flags & FLAG_OBJECT != 0;
        let slot_count = if object { read_u32(reader)? as usize } else { 1 };
        if slot_count == 0 || slot_count > u8::MAX as usize {
            return Err(ProtocolError::Decode(constants::ERR_NOT_PROTOCOL));
        }
        let mut mins = Vec::with_capacity(slot_count);
        let mut maxs = Vec::with_capacity(slot_count);
        for _ in 0..slot_count {
            mins.push(read_u32(reader)?);
            maxs.push(read_u32(reader)?);
        }
        let types = (0..slot_count)
            .map(|_| PacketType::deserialize_from(reader))
            .collect::<Result<Vec<_>>>()?;

        let batching_ms = read_u32(reader)?;
        let max_batch_size = read_u32(reader)?;
        let rate_limit = read_u32(reader)?;
        let tag_len = reader.read_u8()? as usize;
        let tag = crate::core::numeric::decode_utf8(reader.read_bytes(tag_len)?)?;

        let shape = if object {
            PacketSchema::object(types, mins, maxs)
        } else {
            let ty = types
                .into_iter()
                .next()
                .ok_or(ProtocolError::Decode(constants::ERR_NOT_PROTOCOL))?;
            PacketSchema::single(ty, mins[0], maxs[0])
        };
        let schema = shape
            .and_then(|schema| schema.with_auto_flatten(flags & FLAG_FLATTEN != 0))
            .map_err(|_| ProtocolError::Decode(constants::ERR_NOT_PROTOCOL))?
            .with_spread(flags & FLAG_SPREAD != 0)
            .with_batching(batching_ms, max_batch_size)
            .with_rate_limit(rate_limit);

        let packet = Packet::new(tag, schema)
            .map_err(|_| ProtocolError::Decode(constants::ERR_NOT_PROTOCOL))?;
        packet.set_enabled(flags & FLAG_ENABLED != 0);
        Ok(packet)
    }
}

fn read_u32(reader: &mut Reader<'_>) -> Result<u32> {
    u32::try_from(reader.read_varint()?)
        .map_err(|_| ProtocolError::Decode(constants::ERR_VARINT_RANGE))
}

/// Tags are 1..=255 bytes and never contain the registry delimiter.
pub fn validate_tag(tag: &str) -> Result<()> {
    if tag.is_empty() || tag.len() > MAX_TAG_LEN || tag.bytes().any(|b| b == DELIMITER) {
        return Err(ProtocolError::InvalidTag(tag.to_string()));
    }
    Ok(())
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("tag", &self.tag)
            .field("schema", &self.schema)
            .field("validator", &self.validator.is_some())
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

/// Definitions compare by tag, schema and enabled bit; validators are
/// opaque and ignored.
impl PartialEq for Packet {
    fn eq(&self, other: &Self) -> bool {
        self.tag == other.tag
            && self.schema == other.schema
            && self.is_enabled() == other.is_enabled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::value::EnumPackage;

    fn roundtrip(packet: &Packet) -> Packet {
        let mut out = Vec::new();
        packet.serialize_into(&mut out).unwrap();
        assert_ne!(out[0], DELIMITER);
        let mut reader = Reader::new(&out);
        let rebuilt = Packet::deserialize_from(&mut reader).unwrap();
        assert!(reader.is_empty());
        rebuilt
    }

    #[test]
    fn test_tag_rules() {
        assert!(validate_tag("chat").is_ok());
        assert!(validate_tag("").is_err());
        assert!(validate_tag("bad\0tag").is_err());
        assert!(validate_tag(&"t".repeat(MAX_TAG_LEN + 1)).is_err());
    }

    #[test]
    fn test_single_record_roundtrip() {
        let schema = PacketSchema::single(PacketType::Strings, 1, 3)
            .unwrap()
            .with_spread(false)
            .with_batching(50, 10)
            .with_rate_limit(20);
        let packet = Packet::new("chat", schema).unwrap();
        assert_eq!(roundtrip(&packet), packet);
    }

    #[test]
    fn test_object_record_roundtrip_with_enum() {
        let package = Arc::new(
            EnumPackage::new("weapon", vec!["sword".into(), "bow".into()]).unwrap(),
        );
        let schema = PacketSchema::object(
            vec![PacketType::Enum(package), PacketType::Decimals],
            vec![1, 0],
            vec![1, 2],
        )
        .unwrap()
        .with_auto_flatten(true)
        .unwrap();
        let packet = Packet::new("attack", schema).unwrap().disabled();
        let rebuilt = roundtrip(&packet);
        assert_eq!(rebuilt, packet);
        assert!(!rebuilt.is_enabled());
        assert!(rebuilt.schema().auto_flatten());
    }

    #[test]
    fn test_record_rejects_unknown_flags() {
        let mut reader = Reader::new(&[0x40]);
        assert!(Packet::deserialize_from(&mut reader).is_err());
        let mut reader = Reader::new(&[0x00]);
        assert!(Packet::deserialize_from(&mut reader).is_err());
    }

    #[test]
    fn test_validator_rejection_is_malformed() {
        let schema = PacketSchema::single(PacketType::IntsFixed, 1, 1).unwrap();
        let packet = Packet::new("level", schema)
            .unwrap()
            .with_validator(|values| values[0].as_i64().is_some_and(|n| n >= 0));
        let ok = packet.encode(&[Value::Int(3)]).unwrap();
        assert_eq!(packet.decode(&ok).unwrap(), vec![Value::Int(3)]);

        let negative = packet.encode(&[Value::Int(-3)]).unwrap();
        assert!(matches!(
            packet.decode(&negative),
            Err(ProtocolError::MalformedPayload { .. })
        ));
    }

    #[test]
    fn test_decode_errors_carry_tag() {
        let schema = PacketSchema::single(PacketType::Strings, 1, 1).unwrap();
        let packet = Packet::new("chat", schema).unwrap();
        match packet.decode(&[9, b'x']) {
            Err(ProtocolError::MalformedPayload { tag, .. }) => assert_eq!(tag, "chat"),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
