//! Tag/key registry ("holder") for one traffic direction.
//!
//! Keys are assigned 1, 2, 3, ... in registration order; key 0 is never
//! handed out. A registry serializes to the concatenation of its packets'
//! records, so two registries built from the same ordered list produce
//! identical bytes.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::config::{DELIMITER, MAX_PACKETS};
use crate::core::packet::Packet;
use crate::core::varint::Reader;
use crate::error::{constants, ProtocolError, Result};

/// Bidirectional tag/key map plus the packet definitions.
#[derive(Debug, Default)]
pub struct PacketRegistry {
    // index = key - 1
    packets: Vec<Arc<Packet>>,
    keys: HashMap<String, u8>,
}

impl PacketRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from an ordered packet list.
    pub fn register(packets: Vec<Packet>) -> Result<Self> {
        let mut registry = Self::new();
        for packet in packets {
            registry.insert(packet)?;
        }
        Ok(registry)
    }

    fn insert(&mut self, packet: Packet) -> Result<u8> {
        if self.keys.contains_key(packet.tag()) {
            return Err(ProtocolError::DuplicateTag(packet.tag().to_string()));
        }
        if self.packets.len() >= MAX_PACKETS {
            return Err(ProtocolError::RegistryFull(MAX_PACKETS));
        }
        let key = (self.packets.len() + 1) as u8;
        self.keys.insert(packet.tag().to_string(), key);
        self.packets.push(Arc::new(packet));
        Ok(key)
    }

    /// Records of every packet in key order.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.serialize_into(&mut out)?;
        Ok(out)
    }

    pub(crate) fn serialize_into(&self, out: &mut Vec<u8>) -> Result<()> {
        for packet in &self.packets {
            packet.serialize_into(out)?;
        }
        Ok(())
    }

    /// Rebuild a registry from [`serialize`](Self::serialize) output, keys
    /// assigned by record order.
    pub fn deserialize_all(bytes: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(bytes);
        let mut registry = Self::new();
        while !reader.is_empty() {
            registry.insert_decoded(Packet::deserialize_from(&mut reader)?)?;
        }
        Ok(registry)
    }

    /// Read records up to and including the next delimiter.
    pub(crate) fn read_section(reader: &mut Reader<'_>) -> Result<Self> {
        let mut registry = Self::new();
        loop {
            match reader.peek() {
                Some(DELIMITER) => {
                    reader.read_u8()?;
                    return Ok(registry);
                }
                Some(_) => registry.insert_decoded(Packet::deserialize_from(reader)?)?,
                None => return Err(ProtocolError::Decode(constants::ERR_HANDSHAKE_TRUNCATED)),
            }
        }
    }

    fn insert_decoded(&mut self, packet: Packet) -> Result<()> {
        let tag = packet.tag().to_string();
        let key = self
            .insert(packet)
            .map_err(|_| ProtocolError::Decode(constants::ERR_NOT_PROTOCOL))?;
        debug!(tag = %tag, key, "Registered remote packet");
        Ok(())
    }

    pub fn get_key(&self, tag: &str) -> Result<u8> {
        self.keys
            .get(tag)
            .copied()
            .ok_or_else(|| ProtocolError::UnknownTag(tag.to_string()))
    }

    pub fn get_tag(&self, key: u8) -> Result<&str> {
        self.packet_by_key(key).map(|packet| packet.tag())
    }

    pub fn get_packet(&self, tag: &str) -> Result<&Arc<Packet>> {
        let key = self.get_key(tag)?;
        self.packet_by_key(key)
    }

    pub fn packet_by_key(&self, key: u8) -> Result<&Arc<Packet>> {
        (key as usize)
            .checked_sub(1)
            .and_then(|index| self.packets.get(index))
            .ok_or(ProtocolError::UnknownKey(key))
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.keys.contains_key(tag)
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    /// `(key, packet)` pairs in key order.
    pub fn iter(&self) -> impl Iterator<Item = (u8, &Arc<Packet>)> {
        self.packets
            .iter()
            .enumerate()
            .map(|(index, packet)| ((index + 1) as u8, packet))
    }

    /// Same tags under the same keys with equal definitions.
    pub fn same_layout(&self, other: &PacketRegistry) -> bool {
        self.packets.len() == other.packets.len()
            && self
                .packets
                .iter()
                .zip(&other.packets)
                .all(|(a, b)| **a == **b)
    }
}
