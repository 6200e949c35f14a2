//! # Error Types
//!
//! Error handling for the packet protocol.
//!
//! This module defines every error variant that can occur while defining
//! packets, encoding or decoding payloads, negotiating a connection and
//! enforcing limits on it.
//!
//! ## Error Categories
//! - **Protocol Errors**: bad magic marker, version skew, out-of-order handshake
//! - **Schema Errors**: unknown tags or keys, arity violations, duplicate tags
//! - **Payload Errors**: malformed bytes, rejected validators, corrupt batches
//! - **Resource Errors**: rate limits and deferral queue limits
//! - **Configuration Errors**: invalid or unreadable configuration
//!
//! Errors that terminate a connection map to a stable [`CloseCode`] through
//! [`ProtocolError::close_code`].
//!
//! ## Example Usage
//! ```rust
//! use tagwire::error::{CloseCode, ProtocolError};
//!
//! let err = ProtocolError::VersionMismatch { local: 1, remote: 2 };
//! assert_eq!(err.close_code(), CloseCode::VersionMismatch);
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Codec errors
    pub const ERR_UNEXPECTED_END: &str = "Unexpected end of payload";
    pub const ERR_VARINT_TOO_LONG: &str = "Varint exceeds maximum unit count";
    pub const ERR_VARINT_RANGE: &str = "Value outside varint range";
    pub const ERR_SECTOR_OVERFLOW: &str = "Sectorized integer overflows 64 bits";
    pub const ERR_SECTOR_MIXED_SIGN: &str = "Sectorized integer mixes sign regions";
    pub const ERR_INVALID_UTF8: &str = "Invalid or unterminated UTF-8 sequence";
    pub const ERR_TRAILING_BYTES: &str = "Trailing bytes after payload";
    pub const ERR_CAPACITY: &str = "Payload does not fit the declared capacity";
    pub const ERR_ENUM_INDEX: &str = "Enum index out of range";
    pub const ERR_SECTION_LENGTH: &str = "Section length exceeds payload";
    pub const ERR_RAGGED_COLUMNS: &str = "Flattened columns differ in length";

    /// Handshake errors
    pub const ERR_NOT_PROTOCOL: &str = "Peer does not speak this protocol";
    pub const ERR_CLIENT_OUTDATED: &str = "Client is outdated";
    pub const ERR_SERVER_OUTDATED: &str = "Server is outdated";
    pub const ERR_HANDSHAKE_TRUNCATED: &str = "Handshake message is truncated";

    /// Connection errors
    pub const ERR_NOT_READY: &str = "Connection has not completed the handshake";
    pub const ERR_CONNECTION_CLOSED: &str = "Connection closed";
    pub const ERR_HANDSHAKE_REQUIRED: &str = "Handshake packet required first";
    pub const ERR_HANDSHAKE_DUPLICATE: &str = "Handshake packet already received";
    pub const ERR_HANDSHAKE_TIMEOUT: &str = "Handshake did not complete in time";
    pub const ERR_RATE_LIMITED: &str = "Rate limit exceeded";
    pub const ERR_VALIDATOR_REJECTED: &str = "Validator rejected payload";
}

/// Close codes sent to the transport when this layer terminates a connection.
///
/// The numeric values are part of the protocol and never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum CloseCode {
    Normal = 1000,
    NotProtocol = 4000,
    VersionMismatch = 4001,
    MalformedPayload = 4002,
    RateLimitExceeded = 4003,
    HandshakeRequired = 4004,
    HandshakeDuplicate = 4005,
    HandshakeTimeout = 4006,
}

impl CloseCode {
    /// Numeric value placed on the wire
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Recover a close code from its numeric value
    pub fn from_u16(code: u16) -> Option<Self> {
        match code {
            1000 => Some(CloseCode::Normal),
            4000 => Some(CloseCode::NotProtocol),
            4001 => Some(CloseCode::VersionMismatch),
            4002 => Some(CloseCode::MalformedPayload),
            4003 => Some(CloseCode::RateLimitExceeded),
            4004 => Some(CloseCode::HandshakeRequired),
            4005 => Some(CloseCode::HandshakeDuplicate),
            4006 => Some(CloseCode::HandshakeTimeout),
            _ => None,
        }
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, self.as_u16())
    }
}

// ProtocolError is the primary error type for all protocol operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Decode error: {0}")]
    Decode(&'static str),

    #[error("Encode error: {0}")]
    Encode(String),

    #[error("Peer does not speak this protocol")]
    NotProtocol,

    #[error("Protocol version mismatch (local {local}, remote {remote})")]
    VersionMismatch { local: u8, remote: u8 },

    #[error("Unknown packet tag: {0}")]
    UnknownTag(String),

    #[error("Unknown packet key: {0}")]
    UnknownKey(u8),

    #[error("Duplicate packet tag: {0}")]
    DuplicateTag(String),

    #[error("Invalid packet tag: {0}")]
    InvalidTag(String),

    #[error("Duplicate enum tag: {0}")]
    DuplicateEnum(String),

    #[error("Packet '{tag}' expects between {min} and {max} values, got {actual}")]
    ArityViolation {
        tag: String,
        min: u32,
        max: u32,
        actual: usize,
    },

    #[error("Invalid schema: {0}")]
    InvalidSchema(String),

    #[error("Packet '{0}' is disabled")]
    PacketDisabled(String),

    #[error("Too many packets in registry: {0}")]
    RegistryFull(usize),

    #[error("Malformed payload for '{tag}': {reason}")]
    MalformedPayload { tag: String, reason: String },

    #[error("Batch corrupt for '{tag}': {reason}")]
    BatchCorrupt { tag: String, reason: String },

    #[error("Rate limit exceeded for '{0}'")]
    RateLimited(String),

    #[error("Deferred queue full for '{0}'")]
    QueueFull(String),

    #[error("Handshake packet required first")]
    HandshakeRequired,

    #[error("Handshake packet already received")]
    HandshakeDuplicate,

    #[error("Handshake did not complete in time")]
    HandshakeTimeout,

    #[error("Connection has not completed the handshake")]
    NotReady,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Connection limit reached: {0}")]
    ConnectionLimit(usize),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Listener error: {0}")]
    Listener(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl ProtocolError {
    /// Close code used when this error terminates a connection
    pub fn close_code(&self) -> CloseCode {
        match self {
            ProtocolError::NotProtocol => CloseCode::NotProtocol,
            ProtocolError::VersionMismatch { .. } => CloseCode::VersionMismatch,
            ProtocolError::RateLimited(_) => CloseCode::RateLimitExceeded,
            ProtocolError::HandshakeRequired => CloseCode::HandshakeRequired,
            ProtocolError::HandshakeDuplicate => CloseCode::HandshakeDuplicate,
            ProtocolError::HandshakeTimeout => CloseCode::HandshakeTimeout,
            ProtocolError::Decode(_)
            | ProtocolError::UnknownKey(_)
            | ProtocolError::MalformedPayload { .. }
            | ProtocolError::BatchCorrupt { .. }
            | ProtocolError::PacketDisabled(_) => CloseCode::MalformedPayload,
            _ => CloseCode::Normal,
        }
    }

    /// Attach a packet tag to a bare decode error
    pub(crate) fn malformed(tag: &str, err: ProtocolError) -> Self {
        match err {
            ProtocolError::Decode(reason) => ProtocolError::MalformedPayload {
                tag: tag.to_string(),
                reason: reason.to_string(),
            },
            other => other,
        }
    }
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_codes_are_distinct() {
        let codes = [
            CloseCode::Normal,
            CloseCode::NotProtocol,
            CloseCode::VersionMismatch,
            CloseCode::MalformedPayload,
            CloseCode::RateLimitExceeded,
            CloseCode::HandshakeRequired,
            CloseCode::HandshakeDuplicate,
            CloseCode::HandshakeTimeout,
        ];
        for (i, a) in codes.iter().enumerate() {
            assert_eq!(CloseCode::from_u16(a.as_u16()), Some(*a));
            for b in &codes[i + 1..] {
                assert_ne!(a.as_u16(), b.as_u16());
            }
        }
    }

    #[test]
    fn test_abuse_errors_map_to_malformed() {
        let err = ProtocolError::malformed("chat", ProtocolError::Decode("bad"));
        assert_eq!(err.close_code(), CloseCode::MalformedPayload);
        assert!(err.to_string().contains("chat"));

        let batch = ProtocolError::BatchCorrupt {
            tag: "pos".into(),
            reason: "overrun".into(),
        };
        assert_eq!(batch.close_code(), CloseCode::MalformedPayload);
    }
}
