//! Connection handshake: version check and registry exchange.
//!
//! The server pushes a single message as soon as a connection is accepted:
//!
//! ```text
//! [magic(4)] [version(1)] [client records] [0x00] [server records] [0x00] [rate_window(1)]
//! ```
//!
//! The client treats its first inbound message as this payload, checks the
//! magic and version, and rebuilds both registries from it.

use std::fmt;

use tracing::{debug, instrument, warn};

use crate::config::{DELIMITER, MAGIC_BYTES, PROTOCOL_VERSION};
use crate::core::varint::Reader;
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::registry::PacketRegistry;

/// Lifecycle of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Transport not yet open
    Connecting,
    /// Open, waiting for the server's handshake (client only)
    AwaitingSchema,
    /// Normal traffic
    Ready,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::AwaitingSchema => "awaiting-schema",
            ConnectionState::Ready => "ready",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// A parsed handshake message.
#[derive(Debug)]
pub struct Handshake {
    pub version: u8,
    /// Packets the client sends
    pub client: PacketRegistry,
    /// Packets the server sends
    pub server: PacketRegistry,
    /// Rate-limit window in seconds; 0 disables rate limiting
    pub rate_window_secs: u8,
}

/// Build the handshake message the server sends on accept.
pub fn encode_handshake(
    client: &PacketRegistry,
    server: &PacketRegistry,
    rate_window_secs: u8,
) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(MAGIC_BYTES.len() + 4);
    out.extend_from_slice(&MAGIC_BYTES);
    out.push(PROTOCOL_VERSION);
    client.serialize_into(&mut out)?;
    out.push(DELIMITER);
    server.serialize_into(&mut out)?;
    out.push(DELIMITER);
    out.push(rate_window_secs);
    Ok(out)
}

/// Parse the first message a client receives.
///
/// Wrong magic or any structural problem is [`ProtocolError::NotProtocol`];
/// a different version byte is [`ProtocolError::VersionMismatch`].
#[instrument(skip(bytes), fields(len = bytes.len()))]
pub fn parse_handshake(bytes: &[u8]) -> Result<Handshake> {
    let mut reader = Reader::new(bytes);
    match reader.read_array::<4>() {
        Ok(magic) if magic == MAGIC_BYTES => {}
        _ => {
            warn!("Handshake magic mismatch");
            return Err(ProtocolError::NotProtocol);
        }
    }

    let version = reader.read_u8().map_err(|_| ProtocolError::NotProtocol)?;
    if version != PROTOCOL_VERSION {
        warn!(local = PROTOCOL_VERSION, remote = version, "Protocol version mismatch");
        return Err(ProtocolError::VersionMismatch {
            local: PROTOCOL_VERSION,
            remote: version,
        });
    }

    let handshake = parse_body(&mut reader, version).map_err(|e| {
        warn!(error = %e, "Malformed handshake");
        ProtocolError::NotProtocol
    })?;
    debug!(
        client_packets = handshake.client.len(),
        server_packets = handshake.server.len(),
        rate_window_secs = handshake.rate_window_secs,
        "Handshake parsed"
    );
    Ok(handshake)
}

fn parse_body(reader: &mut Reader<'_>, version: u8) -> Result<Handshake> {
    let client = PacketRegistry::read_section(reader)?;
    let server = PacketRegistry::read_section(reader)?;
    let rate_window_secs = reader
        .read_u8()
        .map_err(|_| ProtocolError::Decode(constants::ERR_HANDSHAKE_TRUNCATED))?;
    reader.finish()?;
    Ok(Handshake {
        version,
        client,
        server,
        rate_window_secs,
    })
}

/// Close reason for a version mismatch, seen from the side holding `local`.
pub fn outdated_reason(local: u8, remote: u8, local_is_client: bool) -> &'static str {
    let client_older = if local_is_client {
        local < remote
    } else {
        remote < local
    };
    if client_older {
        constants::ERR_CLIENT_OUTDATED
    } else {
        constants::ERR_SERVER_OUTDATED
    }
}
