//! Numeric and bit-level primitives.
//!
//! ## Sectors
//! Integers are written as most-significant-first digits in base
//! [`SECTOR_BASE`]. Each byte is split in half: `0..=127` holds the digits of
//! non-negative numbers, `129..=255` holds the non-zero digits of negative
//! numbers shifted by [`NEGATIVE_OFFSET`]. A zero digit is always `0x00`,
//! whatever the sign, so `0x00` stays available as a delimiter.
//!
//! ```text
//!    300 -> [0x02, 0x2C]
//!   -300 -> [0x82, 0xAC]
//!   -128 -> [0x81, 0x00]
//! ```
//!
//! ## Float32
//! IEEE-754 single precision is assembled arithmetically from sign, biased
//! exponent and fraction, and written big-endian.
//!
//! ## Booleans
//! Eight flags per byte, most significant bit first.

use crate::error::{constants, ProtocolError, Result};

/// Digit base of the sector encoding
pub const SECTOR_BASE: u64 = 128;

/// Shift applied to non-zero digits of negative numbers
pub const NEGATIVE_OFFSET: u8 = 128;

/// Sectors needed for the largest magnitude (`2^63`)
pub const MAX_SECTORS: usize = 10;

/// Canonical quiet NaN pattern
pub const FLOAT32_NAN: u32 = 0x7FC0_0000;

const FLOAT32_EXP_MASK: u32 = 0xFF;
const FLOAT32_FRACTION_BITS: i32 = 23;
const FLOAT32_BIAS: i32 = 127;
// exponent of the least significant subnormal bit: 1 - bias - fraction bits
const FLOAT32_MIN_EXP: i32 = 1 - FLOAT32_BIAS - FLOAT32_FRACTION_BITS;

/// Number of sectors needed for `|n|`; zero needs one.
pub fn sector_size(n: i64) -> usize {
    let mut magnitude = n.unsigned_abs();
    let mut size = 1;
    while magnitude >= SECTOR_BASE {
        magnitude /= SECTOR_BASE;
        size += 1;
    }
    size
}

/// Encode `n` into exactly `digits` sectors, left padded with zero digits.
pub fn encode_sectorized(n: i64, digits: usize) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(digits);
    write_sectorized(&mut out, n, digits)?;
    Ok(out)
}

/// Append `n` as exactly `digits` sectors.
pub fn write_sectorized(out: &mut Vec<u8>, n: i64, digits: usize) -> Result<()> {
    let needed = sector_size(n);
    if digits < needed || digits > MAX_SECTORS {
        return Err(ProtocolError::Encode(format!(
            "{n} needs {needed} sectors, slot holds {digits}"
        )));
    }

    let start = out.len();
    out.resize(start + digits, 0);
    let mut magnitude = n.unsigned_abs();
    for slot in out[start..].iter_mut().rev() {
        if magnitude == 0 {
            break;
        }
        let digit = (magnitude % SECTOR_BASE) as u8;
        magnitude /= SECTOR_BASE;
        *slot = if n < 0 && digit != 0 {
            digit + NEGATIVE_OFFSET
        } else {
            digit
        };
    }
    Ok(())
}

/// Decode a sectorized integer. The sign is a property of the whole unit
/// sequence: it is negative iff any unit lies in the upper half.
pub fn decode_sectorized(units: &[u8]) -> Result<i64> {
    if units.is_empty() || units.len() > MAX_SECTORS {
        return Err(ProtocolError::Decode(constants::ERR_UNEXPECTED_END));
    }

    let negative = units.iter().any(|&unit| unit >= NEGATIVE_OFFSET);
    let mut magnitude = 0u64;
    for &unit in units {
        let digit = match (negative, unit) {
            (_, 0) => 0,
            (false, unit) => unit,
            (true, unit) if unit > NEGATIVE_OFFSET => unit - NEGATIVE_OFFSET,
            (true, _) => return Err(ProtocolError::Decode(constants::ERR_SECTOR_MIXED_SIGN)),
        };
        magnitude = magnitude
            .checked_mul(SECTOR_BASE)
            .and_then(|m| m.checked_add(u64::from(digit)))
            .ok_or(ProtocolError::Decode(constants::ERR_SECTOR_OVERFLOW))?;
    }

    if negative {
        if magnitude > i64::MIN.unsigned_abs() {
            return Err(ProtocolError::Decode(constants::ERR_SECTOR_OVERFLOW));
        }
        Ok(0u64.wrapping_sub(magnitude) as i64)
    } else {
        i64::try_from(magnitude).map_err(|_| ProtocolError::Decode(constants::ERR_SECTOR_OVERFLOW))
    }
}

#[inline]
fn pow2(exp: i32) -> f64 {
    2f64.powi(exp)
}

/// Encode a single-precision float as four big-endian bytes.
pub fn encode_float32(value: f32) -> [u8; 4] {
    if value.is_nan() {
        return FLOAT32_NAN.to_be_bytes();
    }

    let sign = if value.is_sign_negative() { 1u32 << 31 } else { 0 };
    let magnitude = f64::from(value.abs());
    let infinity = sign | (FLOAT32_EXP_MASK << FLOAT32_FRACTION_BITS);

    let bits = if magnitude == 0.0 {
        sign
    } else if magnitude.is_infinite() {
        infinity
    } else {
        let mut exponent = magnitude.log2().floor() as i32;
        while magnitude < pow2(exponent) {
            exponent -= 1;
        }
        while magnitude >= pow2(exponent + 1) {
            exponent += 1;
        }

        let biased = exponent + FLOAT32_BIAS;
        if biased >= FLOAT32_EXP_MASK as i32 {
            infinity
        } else if biased <= 0 {
            // subnormal: exponent field stays zero, no implicit bit
            sign | (magnitude / pow2(FLOAT32_MIN_EXP)) as u32
        } else {
            let fraction = ((magnitude / pow2(exponent) - 1.0) * pow2(FLOAT32_FRACTION_BITS)) as u32;
            sign | ((biased as u32) << FLOAT32_FRACTION_BITS) | fraction
        }
    };
    bits.to_be_bytes()
}

/// Inverse of [`encode_float32`].
pub fn decode_float32(bytes: [u8; 4]) -> f32 {
    let bits = u32::from_be_bytes(bytes);
    let sign = if bits >> 31 == 1 { -1.0 } else { 1.0 };
    let exponent = ((bits >> FLOAT32_FRACTION_BITS) & FLOAT32_EXP_MASK) as i32;
    let mantissa = bits & ((1 << FLOAT32_FRACTION_BITS) - 1);

    let magnitude = match exponent {
        0xFF if mantissa == 0 => f64::INFINITY,
        0xFF => return f32::NAN,
        0 => f64::from(mantissa) * pow2(FLOAT32_MIN_EXP),
        _ => {
            f64::from(mantissa | (1 << FLOAT32_FRACTION_BITS))
                * pow2(exponent - FLOAT32_BIAS - FLOAT32_FRACTION_BITS)
        }
    };
    (sign * magnitude) as f32
}

/// Pack flags eight to a byte, most significant bit first.
pub fn pack_booleans(values: &[bool]) -> Vec<u8> {
    values
        .chunks(8)
        .map(|chunk| {
            chunk
                .iter()
                .enumerate()
                .fold(0u8, |byte, (i, &flag)| byte | (u8::from(flag) << (7 - i)))
        })
        .collect()
}

/// Unpack every bit of `bytes`; callers truncate to the declared count.
pub fn unpack_booleans(bytes: &[u8]) -> Vec<bool> {
    bytes
        .iter()
        .flat_map(|byte| (0..8).rev().map(move |bit| byte & (1 << bit) != 0))
        .collect()
}

/// Bytes needed to hold `count` packed flags
pub fn packed_len(count: usize) -> usize {
    count.div_ceil(8)
}

/// Number of user-perceived symbols in a string. Multi-byte code points
/// count once.
pub fn symbol_count(text: &str) -> usize {
    text.chars().count()
}

/// Strict UTF-8 decode; truncated or lone sequences are errors.
pub fn decode_utf8(bytes: &[u8]) -> Result<String> {
    std::str::from_utf8(bytes)
        .map(str::to_owned)
        .map_err(|_| ProtocolError::Decode(constants::ERR_INVALID_UTF8))
}
