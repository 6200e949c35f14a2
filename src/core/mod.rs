//! # Core Codec Components
//!
//! Low-level encodings, payload types and packet definitions.
//!
//! This module provides the foundation for the protocol: turning typed
//! values into compact byte sequences and back, and describing the shape
//! of every packet.
//!
//! ## Components
//! - **Numeric**: sectorized integers, float32 assembly, boolean packing
//! - **Varint**: continuation-bit varints, zigzag folding, bounded reader
//! - **Value**: dynamic payload values and enum packages
//! - **Types**: the closed set of payload encodings
//! - **Schema**: single/object layouts, arity bounds, flatten
//! - **Packet**: named definitions and their registry records
//!
//! ## Wire Format
//! ```text
//! ordinary message: [key(1)] [payload(N)]
//! batched message:  [key(1)] ([len(varint)] [fragment])*
//! ```

pub mod numeric;
pub mod packet;
pub mod schema;
pub mod types;
pub mod value;
pub mod varint;
