//! Shared, read-only description of a protocol: both registries, the enum
//! packages they use, and the server's negotiation settings.
//!
//! Built once at startup and handed to every server connection behind an
//! `Arc`; no connection can mutate it beyond the per-packet enabled bit.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::config::ServerConfig;
use crate::core::packet::Packet;
use crate::core::value::{EnumPackage, EnumRegistry, Value};
use crate::error::{ProtocolError, Result};
use crate::protocol::handshake::encode_handshake;
use crate::protocol::registry::PacketRegistry;

#[derive(Debug)]
pub struct ProtocolDefinition {
    client: Arc<PacketRegistry>,
    server: Arc<PacketRegistry>,
    enums: EnumRegistry,
    config: ServerConfig,
    handshake: Vec<u8>,
}

impl ProtocolDefinition {
    pub fn builder() -> ProtocolBuilder {
        ProtocolBuilder::default()
    }

    /// Packets clients send to the server
    pub fn client_packets(&self) -> &Arc<PacketRegistry> {
        &self.client
    }

    /// Packets the server sends to clients
    pub fn server_packets(&self) -> &Arc<PacketRegistry> {
        &self.server
    }

    pub fn enums(&self) -> &EnumRegistry {
        &self.enums
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn rate_window(&self) -> Option<Duration> {
        self.config.rate_window()
    }

    pub fn handshake_packet(&self) -> Option<&str> {
        self.config.handshake_packet.as_deref()
    }

    pub fn handshake_timeout(&self) -> Duration {
        self.config.handshake_timeout
    }

    /// Precomputed handshake message sent on every accept.
    pub fn handshake_message(&self) -> &[u8] {
        &self.handshake
    }
}

/// Collects definitions; [`build`](Self::build) assigns keys and checks
/// everything.
#[derive(Default)]
pub struct ProtocolBuilder {
    client: Vec<Packet>,
    server: Vec<Packet>,
    enums: EnumRegistry,
    config: ServerConfig,
}

impl ProtocolBuilder {
    /// Define an enum package, usable in `PacketType::Enum`.
    pub fn define_enum(&mut self, tag: &str, values: Vec<Value>) -> Result<Arc<EnumPackage>> {
        self.enums.define(tag, values)
    }

    pub fn define_client_packets(&mut self, packets: Vec<Packet>) -> &mut Self {
        self.client.extend(packets);
        self
    }

    pub fn define_server_packets(&mut self, packets: Vec<Packet>) -> &mut Self {
        self.server.extend(packets);
        self
    }

    /// Replace the server settings wholesale.
    pub fn config(&mut self, config: ServerConfig) -> &mut Self {
        self.config = config;
        self
    }

    pub fn rate_window_secs(&mut self, secs: u8) -> &mut Self {
        self.config.rate_window_secs = secs;
        self
    }

    /// Require this client packet before any other.
    pub fn handshake_packet(&mut self, tag: &str, timeout: Duration) -> &mut Self {
        self.config.handshake_packet = Some(tag.to_string());
        self.config.handshake_timeout = timeout;
        self
    }

    pub fn build(self) -> Result<ProtocolDefinition> {
        let client = PacketRegistry::register(self.client)?;
        let server = PacketRegistry::register(self.server)?;
        if let Some(tag) = &self.config.handshake_packet {
            if !client.contains(tag) {
                return Err(ProtocolError::UnknownTag(tag.clone()));
            }
        }
        let handshake = encode_handshake(&client, &server, self.config.rate_window_secs)?;
        info!(
            client_packets = client.len(),
            server_packets = server.len(),
            enums = self.enums.len(),
            handshake_bytes = handshake.len(),
            "Protocol defined"
        );
        Ok(ProtocolDefinition {
            client: Arc::new(client),
            server: Arc::new(server),
            enums: self.enums,
            config: self.config,
            handshake,
        })
    }
}
