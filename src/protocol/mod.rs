//! # Protocol Layer
//!
//! Registries, handshake negotiation and the connection engine.
//!
//! ## Components
//! - **Registry**: ordered tag/key mapping of one side's packets
//! - **Definition**: both registries plus the server's negotiation settings
//! - **Handshake**: the first server message carrying the whole schema
//! - **Rate Limit**: per-packet window counters and the send deferral queue
//! - **Batcher**: accumulation of batched sends into one message
//! - **Dispatcher**: listener routing by tag
//! - **Client / Server**: the two roles built on a shared session engine
//!
//! ## Connection Lifecycle
//! ```text
//! client: Connecting -> AwaitingSchema -> Ready -> Closed
//! server: Ready (handshake sent on accept) -> Closed
//! ```

pub mod batcher;
pub mod client;
pub mod definition;
pub mod dispatcher;
pub mod handshake;
pub mod rate_limit;
pub mod registry;
pub mod server;
pub mod session;
