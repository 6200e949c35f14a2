//! # tagwire
//!
//! Compact, schema-negotiated packet protocol for bidirectional byte-stream
//! transports.
//!
//! A server declares named packets with typed payload schemas. On connect it
//! sends the whole schema in one handshake message, so clients never
//! hard-code packet definitions. After that every message is a one-byte key
//! followed by a compactly encoded payload.
//!
//! ## Features
//! - **Compact codec**: sectorized integers, bit-packed booleans, float32,
//!   enum indices and length-prefixed strings
//! - **Self-describing handshake**: both registries and the rate window in
//!   one message, with version negotiation
//! - **Rate limiting**: per-packet caps; abusive peers are closed, local
//!   sends are deferred to the next window
//! - **Batching**: many sends of one packet coalesced into one message
//! - **Sans-IO engine**: connections are driven by inbound events, with a
//!   tokio driver for framed streams included
//!
//! ## Example
//! ```rust
//! use std::sync::Arc;
//! use tagwire::core::{packet::Packet, schema::PacketSchema, types::PacketType};
//! use tagwire::protocol::definition::ProtocolDefinition;
//!
//! let mut builder = ProtocolDefinition::builder();
//! builder
//!     .define_client_packets(vec![Packet::new(
//!         "say",
//!         PacketSchema::single(PacketType::Strings, 1, 1).unwrap(),
//!     )
//!     .unwrap()])
//!     .define_server_packets(vec![Packet::new(
//!         "said",
//!         PacketSchema::single(PacketType::Strings, 2, 2).unwrap(),
//!     )
//!     .unwrap()]);
//! let definition = Arc::new(builder.build().unwrap());
//! assert_eq!(definition.client_packets().get_key("say").unwrap(), 1);
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod transport;
pub mod utils;

pub use crate::core::packet::Packet;
pub use crate::core::schema::PacketSchema;
pub use crate::core::types::PacketType;
pub use crate::core::value::Value;
pub use crate::error::{CloseCode, ProtocolError, Result};
pub use crate::protocol::client::ClientConnection;
pub use crate::protocol::definition::{ProtocolBuilder, ProtocolDefinition};
pub use crate::protocol::server::{ConnectionId, ServerConnection, ServerHub};
pub use crate::protocol::session::Endpoint;
