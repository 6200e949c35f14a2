//! Continuation-bit varints and zigzag sign folding.
//!
//! A varint carries 7 bits of magnitude per byte, least significant group
//! first; the high bit of each byte says whether another byte follows.
//! Chains are capped at [`MAX_VARINT_UNITS`] bytes, which bounds the
//! representable range to `0..MAX_VARINT`.

use crate::error::{constants, ProtocolError, Result};

/// Longest varint chain accepted on the wire
pub const MAX_VARINT_UNITS: usize = 7;

/// Exclusive upper bound for varint values (2^49)
pub const MAX_VARINT: u64 = 1 << (7 * MAX_VARINT_UNITS);

/// Exclusive bound on the magnitude of a zigzag-folded signed varint
pub const MAX_SIGNED_VARINT: i64 = (MAX_VARINT >> 1) as i64;

const CONTINUATION: u8 = 0x80;
const PAYLOAD_MASK: u8 = 0x7F;

/// Append the varint encoding of `n` to `out`.
pub fn write_varint(out: &mut Vec<u8>, mut n: u64) -> Result<()> {
    if n >= MAX_VARINT {
        return Err(ProtocolError::Encode(format!(
            "{} ({n} >= {MAX_VARINT})",
            constants::ERR_VARINT_RANGE
        )));
    }
    loop {
        let group = (n as u8) & PAYLOAD_MASK;
        n >>= 7;
        if n == 0 {
            out.push(group);
            return Ok(());
        }
        out.push(group | CONTINUATION);
    }
}

/// Varint encoding of `n` as a fresh buffer.
pub fn varint(n: u64) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(2);
    write_varint(&mut out, n)?;
    Ok(out)
}

/// Decode a varint from the start of `bytes`, returning the value and the
/// number of bytes consumed.
pub fn unvarint(bytes: &[u8]) -> Result<(u64, usize)> {
    let mut value = 0u64;
    for (i, byte) in bytes.iter().take(MAX_VARINT_UNITS).enumerate() {
        value |= u64::from(byte & PAYLOAD_MASK) << (7 * i);
        if byte & CONTINUATION == 0 {
            return Ok((value, i + 1));
        }
    }
    if bytes.len() >= MAX_VARINT_UNITS {
        Err(ProtocolError::Decode(constants::ERR_VARINT_TOO_LONG))
    } else {
        Err(ProtocolError::Decode(constants::ERR_UNEXPECTED_END))
    }
}

/// Fold a signed value onto the unsigned range: 0, -1, 1, -2, 2, ...
#[inline]
pub fn zigzag(n: i64) -> u64 {
    ((n << 1) ^ (n >> 63)) as u64
}

/// Exact inverse of [`zigzag`].
#[inline]
pub fn unzigzag(n: u64) -> i64 {
    ((n >> 1) as i64) ^ -((n & 1) as i64)
}

/// Append a zigzag varint.
pub fn write_signed_varint(out: &mut Vec<u8>, n: i64) -> Result<()> {
    if n.unsigned_abs() >= MAX_SIGNED_VARINT as u64 {
        return Err(ProtocolError::Encode(format!(
            "{} (|{n}| >= {MAX_SIGNED_VARINT})",
            constants::ERR_VARINT_RANGE
        )));
    }
    write_varint(out, zigzag(n))
}

/// Bounds-checked forward reader over a payload.
///
/// Every read either returns data or a decode error; it never panics on
/// short input.
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Bytes not yet consumed
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Current offset into the underlying slice
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Look at the next byte without consuming it
    pub fn peek(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        let byte = self
            .peek()
            .ok_or(ProtocolError::Decode(constants::ERR_UNEXPECTED_END))?;
        self.pos += 1;
        Ok(byte)
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if len > self.remaining() {
            return Err(ProtocolError::Decode(constants::ERR_UNEXPECTED_END));
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    pub fn read_varint(&mut self) -> Result<u64> {
        let (value, used) = unvarint(&self.data[self.pos..])?;
        self.pos += used;
        Ok(value)
    }

    pub fn read_signed_varint(&mut self) -> Result<i64> {
        Ok(unzigzag(self.read_varint()?))
    }

    /// Read a varint that must fit a `usize` length
    pub fn read_len(&mut self) -> Result<usize> {
        let len = self.read_varint()?;
        usize::try_from(len).map_err(|_| ProtocolError::Decode(constants::ERR_VARINT_RANGE))
    }

    /// Everything left in the buffer
    pub fn rest(&mut self) -> &'a [u8] {
        let slice = &self.data[self.pos..];
        self.pos = self.data.len();
        slice
    }

    /// Error unless every byte was consumed
    pub fn finish(&self) -> Result<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::Decode(constants::ERR_TRAILING_BYTES))
        }
    }
}
