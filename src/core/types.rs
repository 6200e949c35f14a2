//! Payload encodings.
//!
//! [`PacketType`] is the closed set of encodings a packet slot can use. Each
//! variant knows how to encode a list of [`Value`]s, decode them back, and
//! cheaply check whether a byte slice can possibly hold a payload of at most
//! a given capacity.

use std::sync::Arc;

use crate::core::numeric::{
    decode_float32, decode_sectorized, decode_utf8, encode_float32, pack_booleans, packed_len,
    sector_size, symbol_count, unpack_booleans, write_sectorized, MAX_SECTORS,
};
use crate::core::value::{EnumPackage, Value};
use crate::core::varint::{write_signed_varint, write_varint, Reader};
use crate::error::{constants, ProtocolError, Result};

/// Sectors per value for [`PacketType::IntsFixed`]
pub const FIXED_INT_SECTORS: usize = 2;

/// Largest magnitude an `IntsFixed` slot holds (128^2 - 1)
pub const FIXED_INT_MAX: i64 = 16_383;

/// Fractional digits kept by [`PacketType::Decimals`]
pub const MAX_FRACTION_DIGITS: usize = 14;

const FLOAT32_LEN: usize = 4;

/// Closed set of payload encodings.
#[derive(Debug, Clone, PartialEq)]
pub enum PacketType {
    /// No payload at all
    None,
    /// One opaque string, sent as-is
    Raw,
    /// Length-prefixed strings
    Strings,
    /// Signed integers of bounded magnitude, fixed slot width
    IntsFixed,
    /// Signed integers of any magnitude, one digit width per message
    IntsDynamic,
    /// Decimal numbers sent as whole and fractional integers
    Decimals,
    /// Bit-packed flags
    Booleans,
    /// Indices into an enum package
    Enum(Arc<EnumPackage>),
    /// IEEE-754 single-precision floats
    Floats,
}

impl PacketType {
    /// Type code carried in registry records
    pub fn code(&self) -> u8 {
        match self {
            PacketType::None => 0,
            PacketType::Raw => 1,
            PacketType::Strings => 2,
            PacketType::IntsFixed => 3,
            PacketType::IntsDynamic => 4,
            PacketType::Decimals => 5,
            PacketType::Booleans => 6,
            PacketType::Enum(_) => 7,
            PacketType::Floats => 8,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PacketType::None => "none",
            PacketType::Raw => "raw",
            PacketType::Strings => "strings",
            PacketType::IntsFixed => "ints_fixed",
            PacketType::IntsDynamic => "ints_dynamic",
            PacketType::Decimals => "decimals",
            PacketType::Booleans => "booleans",
            PacketType::Enum(_) => "enum",
            PacketType::Floats => "floats",
        }
    }

    /// Quantity the arity bounds apply to. For `Raw` this is the number of
    /// characters in the string, for every other type the number of values.
    pub fn count(&self, values: &[Value]) -> usize {
        match self {
            PacketType::Raw => values.iter().filter_map(Value::as_str).map(symbol_count).sum(),
            _ => values.len(),
        }
    }

    /// Encode `values`. Arity is checked by the schema, not here.
    pub fn encode(&self, values: &[Value]) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        match self {
            PacketType::None => {
                if !values.is_empty() {
                    return Err(ProtocolError::Encode(format!(
                        "packet without payload got {} values",
                        values.len()
                    )));
                }
            }
            PacketType::Raw => match values {
                [Value::Str(text)] => out.extend_from_slice(text.as_bytes()),
                _ => return Err(ProtocolError::Encode("raw payload takes one string".into())),
            },
            PacketType::Strings => {
                for value in values {
                    let text = value.as_str().ok_or_else(|| mismatch(self, value))?;
                    write_varint(&mut out, text.len() as u64)?;
                    out.extend_from_slice(text.as_bytes());
                }
            }
            PacketType::IntsFixed => {
                for value in values {
                    let n = value.as_i64().ok_or_else(|| mismatch(self, value))?;
                    if n.unsigned_abs() > FIXED_INT_MAX as u64 {
                        return Err(ProtocolError::Encode(format!(
                            "{n} exceeds fixed int range ±{FIXED_INT_MAX}"
                        )));
                    }
                    write_sectorized(&mut out, n, FIXED_INT_SECTORS)?;
                }
            }
            PacketType::IntsDynamic => {
                let ints = values
                    .iter()
                    .map(|value| value.as_i64().ok_or_else(|| mismatch(self, value)))
                    .collect::<Result<Vec<_>>>()?;
                if let Some(width) = ints.iter().map(|&n| sector_size(n)).max() {
                    out.push(width as u8);
                    for n in ints {
                        write_sectorized(&mut out, n, width)?;
                    }
                }
            }
            PacketType::Decimals => {
                for value in values {
                    let x = value.as_f64().ok_or_else(|| mismatch(self, value))?;
                    write_decimal(&mut out, x)?;
                }
            }
            PacketType::Booleans => {
                let flags = values
                    .iter()
                    .map(|value| value.as_bool().ok_or_else(|| mismatch(self, value)))
                    .collect::<Result<Vec<_>>>()?;
                out = pack_booleans(&flags);
            }
            PacketType::Enum(package) => {
                for value in values {
                    let index = package.index_of(value).ok_or_else(|| {
                        ProtocolError::Encode(format!(
                            "{value} is not a member of enum '{}'",
                            package.tag()
                        ))
                    })?;
                    out.push(index);
                }
            }
            PacketType::Floats => {
                for value in values {
                    let x = value.as_f64().ok_or_else(|| mismatch(self, value))?;
                    out.extend_from_slice(&encode_float32(x as f32));
                }
            }
        }
        Ok(out)
    }

    /// Decode a payload of at most `capacity` counted units.
    pub fn decode(&self, bytes: &[u8], capacity: u32) -> Result<Vec<Value>> {
        if !self.validate(bytes, capacity) {
            return Err(ProtocolError::Decode(constants::ERR_CAPACITY));
        }
        let mut reader = Reader::new(bytes);
        let values = match self {
            PacketType::None => Vec::new(),
            PacketType::Raw => vec![Value::Str(decode_utf8(bytes)?)],
            PacketType::Strings => {
                let mut values = Vec::new();
                while !reader.is_empty() {
                    let len = reader.read_len()?;
                    values.push(Value::Str(decode_utf8(reader.read_bytes(len)?)?));
                }
                values
            }
            PacketType::IntsFixed => bytes
                .chunks(FIXED_INT_SECTORS)
                .map(|chunk| decode_sectorized(chunk).map(Value::Int))
                .collect::<Result<_>>()?,
            PacketType::IntsDynamic => match bytes.split_first() {
                None => Vec::new(),
                Some((&width, rest)) => rest
                    .chunks(width as usize)
                    .map(|chunk| decode_sectorized(chunk).map(Value::Int))
                    .collect::<Result<_>>()?,
            },
            PacketType::Decimals => {
                let mut values = Vec::new();
                while !reader.is_empty() {
                    values.push(Value::Number(read_decimal(&mut reader)?));
                }
                values
            }
            PacketType::Booleans => unpack_booleans(bytes)
                .into_iter()
                .take(capacity as usize)
                .map(Value::Bool)
                .collect(),
            PacketType::Enum(package) => bytes
                .iter()
                .map(|&index| {
                    package
                        .value_at(index)
                        .cloned()
                        .ok_or(ProtocolError::Decode(constants::ERR_ENUM_INDEX))
                })
                .collect::<Result<_>>()?,
            PacketType::Floats => bytes
                .chunks_exact(FLOAT32_LEN)
                .map(|chunk| {
                    let mut raw = [0u8; FLOAT32_LEN];
                    raw.copy_from_slice(chunk);
                    Value::Number(f64::from(decode_float32(raw)))
                })
                .collect(),
        };

        if self.count(&values) > capacity as usize {
            return Err(ProtocolError::Decode(constants::ERR_CAPACITY));
        }
        Ok(values)
    }

    /// Structural check: could `bytes` hold a payload of this type with at
    /// most `capacity` counted units? Content errors are left to `decode`.
    pub fn validate(&self, bytes: &[u8], capacity: u32) -> bool {
        let capacity = capacity as usize;
        match self {
            PacketType::None => bytes.is_empty(),
            // every character takes at least one byte, at most four
            PacketType::Raw => bytes.len() <= capacity.saturating_mul(4),
            PacketType::Strings => {
                let mut reader = Reader::new(bytes);
                let mut count = 0;
                while !reader.is_empty() {
                    count += 1;
                    let len = match reader.read_len() {
                        Ok(len) => len,
                        Err(_) => return false,
                    };
                    if count > capacity || reader.read_bytes(len).is_err() {
                        return false;
                    }
                }
                true
            }
            PacketType::IntsFixed => {
                bytes.len() % FIXED_INT_SECTORS == 0
                    && bytes.len() / FIXED_INT_SECTORS <= capacity
            }
            PacketType::IntsDynamic => match bytes.split_first() {
                None => true,
                Some((&width, rest)) => {
                    let width = width as usize;
                    (1..=MAX_SECTORS).contains(&width)
                        && !rest.is_empty()
                        && rest.len() % width == 0
                        && rest.len() / width <= capacity
                }
            },
            PacketType::Decimals => {
                let mut reader = Reader::new(bytes);
                let mut count = 0;
                while !reader.is_empty() {
                    count += 1;
                    if count > capacity
                        || reader.read_varint().is_err()
                        || reader.read_varint().is_err()
                    {
                        return false;
                    }
                }
                true
            }
            PacketType::Booleans => bytes.len() <= packed_len(capacity),
            PacketType::Enum(package) => {
                bytes.len() <= capacity && bytes.iter().all(|&i| (i as usize) < package.len())
            }
            PacketType::Floats => {
                bytes.len() % FLOAT32_LEN == 0 && bytes.len() / FLOAT32_LEN <= capacity
            }
        }
    }

    pub(crate) fn serialize_into(&self, out: &mut Vec<u8>) -> Result<()> {
        out.push(self.code());
        if let PacketType::Enum(package) = self {
            package.serialize_into(out)?;
        }
        Ok(())
    }

    pub(crate) fn deserialize_from(reader: &mut Reader<'_>) -> Result<Self> {
        Ok(match reader.read_u8()? {
            0 => PacketType::None,
            1 => PacketType::Raw,
            2 => PacketType::Strings,
            3 => PacketType::IntsFixed,
            4 => PacketType::IntsDynamic,
            5 => PacketType::Decimals,
            6 => PacketType::Booleans,
            7 => PacketType::Enum(Arc::new(EnumPackage::deserialize_from(reader)?)),
            8 => PacketType::Floats,
            _ => return Err(ProtocolError::Decode(constants::ERR_NOT_PROTOCOL)),
        })
    }
}

fn mismatch(ty: &PacketType, value: &Value) -> ProtocolError {
    ProtocolError::Encode(format!("{} payload cannot hold a {}", ty.name(), value.kind()))
}

/// Whole part as a zigzag varint, then the fractional digits reversed (so
/// leading zeros survive) as a zigzag varint. Both parts carry the sign.
fn write_decimal(out: &mut Vec<u8>, x: f64) -> Result<()> {
    if !x.is_finite() {
        return Err(ProtocolError::Encode(format!("{x} is not a finite decimal")));
    }

    let mut text = format!("{}", x.abs());
    if let Some((_, fraction)) = text.split_once('.') {
        if fraction.len() > MAX_FRACTION_DIGITS {
            text = format!("{:.*}", MAX_FRACTION_DIGITS, x.abs())
                .trim_end_matches('0')
                .trim_end_matches('.')
                .to_string();
        }
    }
    let (whole, fraction) = text.split_once('.').unwrap_or((text.as_str(), ""));

    let whole: i64 = whole
        .parse()
        .map_err(|_| ProtocolError::Encode(format!("{x} is too large for a decimal")))?;
    let reversed: String = fraction.chars().rev().collect();
    let fraction: i64 = if reversed.is_empty() {
        0
    } else {
        reversed
            .parse()
            .map_err(|_| ProtocolError::Encode(format!("{x} has an unencodable fraction")))?
    };

    let sign = if x < 0.0 { -1 } else { 1 };
    write_signed_varint(out, sign * whole)?;
    write_signed_varint(out, sign * fraction)
}

fn read_decimal(reader: &mut Reader<'_>) -> Result<f64> {
    let whole = reader.read_signed_varint()?;
    let fraction = reader.read_signed_varint()?;
    let negative = whole < 0 || fraction < 0;

    let text = if fraction == 0 {
        whole.unsigned_abs().to_string()
    } else {
        let digits: String = fraction.unsigned_abs().to_string().chars().rev().collect();
        format!("{}.{}", whole.unsigned_abs(), digits)
    };
    let magnitude: f64 = text
        .parse()
        .map_err(|_| ProtocolError::Decode(constants::ERR_UNEXPECTED_END))?;
    Ok(if negative { -magnitude } else { magnitude })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ints(values: &[i64]) -> Vec<Value> {
        values.iter().map(|&n| Value::Int(n)).collect()
    }

    #[test]
    fn test_none_requires_empty() {
        assert!(PacketType::None.encode(&[]).unwrap().is_empty());
        assert!(PacketType::None.encode(&[Value::Null]).is_err());
        assert!(PacketType::None.validate(&[], 0));
        assert!(!PacketType::None.validate(&[1], 0));
    }

    #[test]
    fn test_raw_counts_symbols() {
        let values = vec![Value::from("héy🎉")];
        assert_eq!(PacketType::Raw.count(&values), 4);
        let bytes = PacketType::Raw.encode(&values).unwrap();
        assert_eq!(PacketType::Raw.decode(&bytes, 4).unwrap(), values);
        assert!(PacketType::Raw.decode(&bytes, 3).is_err());
        assert!(PacketType::Raw.decode(&bytes[..bytes.len() - 1], 4).is_err());
    }

    #[test]
    fn test_strings_roundtrip() {
        let values = vec![Value::from("a"), Value::from(""), Value::from("çava")];
        let bytes = PacketType::Strings.encode(&values).unwrap();
        assert_eq!(bytes[0], 1);
        assert_eq!(PacketType::Strings.decode(&bytes, 3).unwrap(), values);
        assert!(!PacketType::Strings.validate(&bytes, 2));
        assert!(PacketType::Strings.decode(&[5, b'a'], 1).is_err());
    }

    #[test]
    fn test_ints_fixed_range_and_layout() {
        let bytes = PacketType::IntsFixed.encode(&ints(&[1, -300])).unwrap();
        assert_eq!(bytes, vec![0x00, 0x01, 0x82, 0xAC]);
        assert_eq!(
            PacketType::IntsFixed.decode(&bytes, 2).unwrap(),
            ints(&[1, -300])
        );
        assert!(PacketType::IntsFixed.encode(&ints(&[FIXED_INT_MAX + 1])).is_err());
        assert!(!PacketType::IntsFixed.validate(&bytes[..3], 2));
    }

    #[test]
    fn test_ints_dynamic_uniform_width() {
        let values = ints(&[5, -70_000, i64::MAX]);
        let bytes = PacketType::IntsDynamic.encode(&values).unwrap();
        assert_eq!(bytes[0] as usize, sector_size(i64::MAX));
        assert_eq!(bytes.len(), 1 + 3 * sector_size(i64::MAX));
        assert_eq!(PacketType::IntsDynamic.decode(&bytes, 3).unwrap(), values);
        assert!(PacketType::IntsDynamic.encode(&[]).unwrap().is_empty());
        assert!(!PacketType::IntsDynamic.validate(&[0], 4));
        assert!(!PacketType::IntsDynamic.validate(&[2, 1, 2, 3], 4));
    }

    #[test]
    fn test_decimals_keep_leading_fraction_zeros() {
        let values = vec![
            Value::Number(3.05),
            Value::Number(-0.5),
            Value::Number(-12.125),
            Value::Int(7),
            Value::Number(0.0),
        ];
        let bytes = PacketType::Decimals.encode(&values).unwrap();
        let decoded = PacketType::Decimals.decode(&bytes, 5).unwrap();
        let expected: Vec<Value> = [3.05, -0.5, -12.125, 7.0, 0.0]
            .iter()
            .map(|&x| Value::Number(x))
            .collect();
        assert_eq!(decoded, expected);
        assert!(PacketType::Decimals.encode(&[Value::Number(f64::NAN)]).is_err());
    }

    #[test]
    fn test_booleans_truncate_to_capacity() {
        let values = vec![Value::Bool(true), Value::Bool(false), Value::Bool(true)];
        let bytes = PacketType::Booleans.encode(&values).unwrap();
        assert_eq!(bytes, vec![0b1010_0000]);
        assert_eq!(PacketType::Booleans.decode(&bytes, 3).unwrap(), values);
        assert_eq!(PacketType::Booleans.decode(&bytes, 8).unwrap().len(), 8);
        assert!(!PacketType::Booleans.validate(&[0, 0], 8));
    }

    #[test]
    fn test_enum_indices() {
        let package =
            Arc::new(EnumPackage::new("dir", vec!["up".into(), "down".into()]).unwrap());
        let ty = PacketType::Enum(package);
        let bytes = ty.encode(&[Value::from("down"), Value::from("up")]).unwrap();
        assert_eq!(bytes, vec![1, 0]);
        assert_eq!(
            ty.decode(&bytes, 2).unwrap(),
            vec![Value::from("down"), Value::from("up")]
        );
        assert!(ty.encode(&[Value::from("left")]).is_err());
        assert!(!ty.validate(&[2], 1));
    }

    #[test]
    fn test_floats_roundtrip() {
        let values = vec![Value::Number(1.5), Value::Number(-0.25)];
        let bytes = PacketType::Floats.encode(&values).unwrap();
        assert_eq!(bytes.len(), 8);
        assert_eq!(PacketType::Floats.decode(&bytes, 2).unwrap(), values);
    }

    #[test]
    fn test_type_mismatch_is_encode_error() {
        assert!(matches!(
            PacketType::Strings.encode(&[Value::Int(1)]),
            Err(ProtocolError::Encode(_))
        ));
        assert!(PacketType::Booleans.encode(&[Value::from("x")]).is_err());
    }

    #[test]
    fn test_type_code_roundtrip() {
        let package = Arc::new(EnumPackage::new("e", vec![Value::Null]).unwrap());
        for ty in [
            PacketType::None,
            PacketType::Raw,
            PacketType::Strings,
            PacketType::IntsFixed,
            PacketType::IntsDynamic,
            PacketType::Decimals,
            PacketType::Booleans,
            PacketType::Enum(package),
            PacketType::Floats,
        ] {
            let mut out = Vec::new();
            ty.serialize_into(&mut out).unwrap();
            let mut reader = Reader::new(&out);
            assert_eq!(PacketType::deserialize_from(&mut reader).unwrap(), ty);
            assert!(reader.is_empty());
        }
    }
}
