//! Packet schemas: payload shape, arity bounds and delivery flags.
//!
//! A schema is either a single typed list or an "object" of several typed
//! slots. Object payloads are a sequence of sections, one per slot, each
//! prefixed by a one-byte length:
//!
//! ```text
//! [len0][slot0 bytes][len1][slot1 bytes]...
//! ```
//!
//! A packed boolean column carries no count of its own. An auto flattened
//! schema whose slots are all booleans therefore leads with a varint row
//! count; otherwise the row count comes from the other columns.

use crate::core::types::PacketType;
use crate::core::value::Value;
use crate::core::varint::{write_varint, Reader};
use crate::error::{constants, ProtocolError, Result};

/// Largest object section (its length prefix is one byte)
pub const MAX_SECTION_LEN: usize = u8::MAX as usize;

/// One typed slot with its arity bounds.
#[derive(Debug, Clone, PartialEq)]
pub struct Slot {
    pub ty: PacketType,
    pub min: u32,
    pub max: u32,
}

impl Slot {
    fn check_arity(&self, tag: &str, actual: usize) -> Result<()> {
        if actual < self.min as usize || actual > self.max as usize {
            return Err(ProtocolError::ArityViolation {
                tag: tag.to_string(),
                min: self.min,
                max: self.max,
                actual,
            });
        }
        Ok(())
    }
}

/// Single-typed or multi-typed payload layout.
#[derive(Debug, Clone, PartialEq)]
pub enum SchemaShape {
    Single(Slot),
    Object(Vec<Slot>),
}

/// Declared shape and flags of one packet.
#[derive(Debug, Clone, PartialEq)]
pub struct PacketSchema {
    shape: SchemaShape,
    spread: bool,
    auto_flatten: bool,
    batching_ms: u32,
    max_batch_size: u32,
    rate_limit: u32,
}

impl PacketSchema {
    /// Single-typed schema accepting between `min` and `max` values.
    pub fn single(ty: PacketType, min: u32, max: u32) -> Result<Self> {
        let (min, max) = if ty == PacketType::None { (0, 0) } else { (min, max) };
        if min > max {
            return Err(ProtocolError::InvalidSchema(format!(
                "min arity {min} exceeds max arity {max}"
            )));
        }
        Ok(Self::from_shape(SchemaShape::Single(Slot { ty, min, max })))
    }

    /// Multi-typed schema; the three lists must be the same length.
    pub fn object(types: Vec<PacketType>, mins: Vec<u32>, maxs: Vec<u32>) -> Result<Self> {
        if types.is_empty() || types.len() != mins.len() || types.len() != maxs.len() {
            return Err(ProtocolError::InvalidSchema(format!(
                "object schema has {} types, {} min and {} max arities",
                types.len(),
                mins.len(),
                maxs.len()
            )));
        }
        if types.len() > u8::MAX as usize {
            return Err(ProtocolError::InvalidSchema(format!(
                "object schema has {} slots",
                types.len()
            )));
        }
        let slots = types
            .into_iter()
            .zip(mins.into_iter().zip(maxs))
            .map(|(ty, (min, max))| {
                if min > max {
                    Err(ProtocolError::InvalidSchema(format!(
                        "slot {} min arity {min} exceeds max arity {max}",
                        ty.name()
                    )))
                } else {
                    Ok(Slot { ty, min, max })
                }
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::from_shape(SchemaShape::Object(slots)))
    }

    fn from_shape(shape: SchemaShape) -> Self {
        Self {
            shape,
            spread: true,
            auto_flatten: false,
            batching_ms: 0,
            max_batch_size: 0,
            rate_limit: 0,
        }
    }

    /// Deliver decoded values as separate listener arguments (default) or
    /// as one list.
    pub fn with_spread(mut self, spread: bool) -> Self {
        self.spread = spread;
        self
    }

    /// Transpose rows into columns before encoding. Object schemas only.
    pub fn with_auto_flatten(mut self, auto_flatten: bool) -> Result<Self> {
        if auto_flatten && !self.is_object() {
            return Err(ProtocolError::InvalidSchema(
                "auto flatten requires an object schema".into(),
            ));
        }
        self.auto_flatten = auto_flatten;
        Ok(self)
    }

    /// Accumulate sends for `interval_ms` and emit them as one message,
    /// at most `max_batch_size` entries per message (0 = unlimited).
    pub fn with_batching(mut self, interval_ms: u32, max_batch_size: u32) -> Self {
        self.batching_ms = interval_ms;
        self.max_batch_size = max_batch_size;
        self
    }

    /// Cap sends per rate window (0 = unlimited).
    pub fn with_rate_limit(mut self, per_window: u32) -> Self {
        self.rate_limit = per_window;
        self
    }

    pub fn shape(&self) -> &SchemaShape {
        &self.shape
    }

    pub fn slots(&self) -> &[Slot] {
        match &self.shape {
            SchemaShape::Single(slot) => std::slice::from_ref(slot),
            SchemaShape::Object(slots) => slots,
        }
    }

    pub fn is_object(&self) -> bool {
        matches!(self.shape, SchemaShape::Object(_))
    }

    pub fn spread(&self) -> bool {
        self.spread
    }

    pub fn auto_flatten(&self) -> bool {
        self.auto_flatten
    }

    pub fn batching_ms(&self) -> u32 {
        self.batching_ms
    }

    pub fn max_batch_size(&self) -> u32 {
        self.max_batch_size
    }

    pub fn rate_limit(&self) -> u32 {
        self.rate_limit
    }

    pub fn is_batched(&self) -> bool {
        self.batching_ms > 0
    }

    /// Encode the values supplied to `send`. Arity is enforced before any
    /// byte is produced.
    pub fn encode(&self, tag: &str, values: &[Value]) -> Result<Vec<u8>> {
        match &self.shape {
            SchemaShape::Single(slot) => {
                slot.check_arity(tag, slot.ty.count(values))?;
                slot.ty.encode(values)
            }
            SchemaShape::Object(slots) => {
                let groups = if self.auto_flatten {
                    let rows = values
                        .iter()
                        .map(|row| group_of(row).to_vec())
                        .collect::<Vec<_>>();
                    let columns = flatten(&rows)?;
                    if columns.is_empty() {
                        vec![Vec::new(); slots.len()]
                    } else {
                        columns
                    }
                } else {
                    values.iter().map(|group| group_of(group).to_vec()).collect()
                };

                if groups.len() != slots.len() {
                    return Err(ProtocolError::ArityViolation {
                        tag: tag.to_string(),
                        min: slots.len() as u32,
                        max: slots.len() as u32,
                        actual: groups.len(),
                    });
                }
                for (slot, group) in slots.iter().zip(&groups) {
                    slot.check_arity(tag, slot.ty.count(group))?;
                }

                let mut out = Vec::new();
                if self.auto_flatten && all_booleans(slots) {
                    write_varint(&mut out, values.len() as u64)?;
                }
                for (slot, group) in slots.iter().zip(&groups) {
                    let section = slot.ty.encode(group)?;
                    if section.len() > MAX_SECTION_LEN {
                        return Err(ProtocolError::Encode(format!(
                            "'{tag}' {} section is {} bytes (max {MAX_SECTION_LEN})",
                            slot.ty.name(),
                            section.len()
                        )));
                    }
                    out.push(section.len() as u8);
                    out.extend_from_slice(&section);
                }
                Ok(out)
            }
        }
    }

    /// Decode a payload into its value sequence: the values themselves for
    /// single schemas, one list per slot (or per row, when auto flattened)
    /// for object schemas.
    pub fn decode(&self, bytes: &[u8]) -> Result<Vec<Value>> {
        match &self.shape {
            SchemaShape::Single(slot) => {
                let values = slot.ty.decode(bytes, slot.max)?;
                if slot.ty.count(&values) < slot.min as usize {
                    return Err(ProtocolError::Decode(constants::ERR_CAPACITY));
                }
                Ok(values)
            }
            SchemaShape::Object(slots) => {
                let mut reader = Reader::new(bytes);
                let counted_rows = if self.auto_flatten && all_booleans(slots) {
                    Some(reader.read_len()?)
                } else {
                    None
                };
                let mut columns = Vec::with_capacity(slots.len());
                for slot in slots {
                    let len = reader.read_u8()? as usize;
                    let section = reader
                        .read_bytes(len)
                        .map_err(|_| ProtocolError::Decode(constants::ERR_SECTION_LENGTH))?;
                    columns.push(slot.ty.decode(section, slot.max)?);
                }
                reader.finish()?;

                if self.auto_flatten {
                    let rows = counted_rows.unwrap_or_else(|| row_count(slots, &columns));
                    for (slot, column) in slots.iter().zip(columns.iter_mut()) {
                        if matches!(slot.ty, PacketType::Booleans) {
                            if column.len() < rows {
                                return Err(ProtocolError::Decode(constants::ERR_RAGGED_COLUMNS));
                            }
                            column.truncate(rows);
                        }
                    }
                }
                for (slot, column) in slots.iter().zip(&columns) {
                    if slot.ty.count(column) < slot.min as usize {
                        return Err(ProtocolError::Decode(constants::ERR_CAPACITY));
                    }
                }

                let groups = if self.auto_flatten {
                    unflatten(&columns)
                        .map_err(|_| ProtocolError::Decode(constants::ERR_RAGGED_COLUMNS))?
                } else {
                    columns
                };
                Ok(groups.into_iter().map(Value::List).collect())
            }
        }
    }

    /// Cheap structural check of a received payload.
    pub fn validate(&self, bytes: &[u8]) -> bool {
        match &self.shape {
            SchemaShape::Single(slot) => slot.ty.validate(bytes, slot.max),
            SchemaShape::Object(slots) => {
                let mut reader = Reader::new(bytes);
                if self.auto_flatten && all_booleans(slots) && reader.read_len().is_err() {
                    return false;
                }
                for slot in slots {
                    let section = match reader.read_u8() {
                        Ok(len) => reader.read_bytes(len as usize),
                        Err(e) => Err(e),
                    };
                    match section {
                        Ok(section) if slot.ty.validate(section, slot.max) => {}
                        _ => return false,
                    }
                }
                reader.is_empty()
            }
        }
    }

    /// Turn a decoded value sequence into listener arguments.
    pub fn into_arguments(&self, decoded: Vec<Value>) -> Vec<Value> {
        match &self.shape {
            SchemaShape::Single(Slot {
                ty: PacketType::None | PacketType::Raw,
                ..
            }) => decoded,
            _ if self.spread => decoded,
            _ => vec![Value::List(decoded)],
        }
    }
}

fn all_booleans(slots: &[Slot]) -> bool {
    slots.iter().all(|slot| matches!(slot.ty, PacketType::Booleans))
}

/// Rows of a flattened payload, read off its first non-boolean column.
fn row_count(slots: &[Slot], columns: &[Vec<Value>]) -> usize {
    slots
        .iter()
        .zip(columns)
        .find(|(slot, _)| !matches!(slot.ty, PacketType::Booleans))
        .map_or(0, |(_, column)| column.len())
}

fn group_of(value: &Value) -> &[Value] {
    match value {
        Value::List(items) => items,
        scalar => std::slice::from_ref(scalar),
    }
}

/// Transpose rows of equal width into columns:
/// `[[x1, y1], [x2, y2]] -> [[x1, x2], [y1, y2]]`. Empty input stays empty.
pub fn flatten(rows: &[Vec<Value>]) -> Result<Vec<Vec<Value>>> {
    transpose(rows)
}

/// Inverse of [`flatten`].
pub fn unflatten(columns: &[Vec<Value>]) -> Result<Vec<Vec<Value>>> {
    transpose(columns)
}

fn transpose(input: &[Vec<Value>]) -> Result<Vec<Vec<Value>>> {
    let Some(first) = input.first() else {
        return Ok(Vec::new());
    };
    let width = first.len();
    if input.iter().any(|row| row.len() != width) {
        return Err(ProtocolError::InvalidSchema(
            "flattened data must be rectangular".into(),
        ));
    }
    Ok((0..width)
        .map(|i| input.iter().map(|row| row[i].clone()).collect())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strs(items: &[&str]) -> Vec<Value> {
        items.iter().map(|&s| Value::from(s)).collect()
    }

    #[test]
    fn test_single_arity_enforced() {
        let schema = PacketSchema::single(PacketType::Strings, 1, 1).unwrap();
        assert!(schema.encode("chat", &strs(&["hi"])).is_ok());
        let err = schema.encode("chat", &strs(&["a", "b"])).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::ArityViolation { actual: 2, min: 1, max: 1, .. }
        ));
        assert!(schema.encode("chat", &[]).is_err());
    }

    #[test]
    fn test_min_above_max_rejected() {
        assert!(PacketSchema::single(PacketType::Strings, 3, 2).is_err());
        assert!(PacketSchema::object(vec![PacketType::Strings], vec![0, 1], vec![1]).is_err());
        assert!(PacketSchema::object(vec![PacketType::IntsFixed], vec![2], vec![1]).is_err());
    }

    #[test]
    fn test_none_schema_only_empty() {
        let schema = PacketSchema::single(PacketType::None, 5, 9).unwrap();
        assert!(schema.encode("ping", &[]).unwrap().is_empty());
        assert!(schema.validate(&[]));
        assert!(!schema.validate(&[0]));
        assert!(schema.decode(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_object_sections() {
        let schema = PacketSchema::object(
            vec![PacketType::Strings, PacketType::IntsFixed],
            vec![1, 0],
            vec![1, 3],
        )
        .unwrap();
        let values = vec![
            Value::from("bob"),
            Value::List(vec![Value::Int(1), Value::Int(2)]),
        ];
        let bytes = schema.encode("player", &values).unwrap();
        assert_eq!(bytes[0], 4); // varint len + "bob"
        assert_eq!(bytes[5], 4); // two fixed ints
        assert!(schema.validate(&bytes));

        let decoded = schema.decode(&bytes).unwrap();
        assert_eq!(
            decoded,
            vec![
                Value::List(strs(&["bob"])),
                Value::List(vec![Value::Int(1), Value::Int(2)]),
            ]
        );

        // section length reaching past the end
        let mut corrupt = bytes.clone();
        corrupt[5] = 40;
        assert!(!schema.validate(&corrupt));
        assert!(schema.decode(&corrupt).is_err());
    }

    #[test]
    fn test_object_slot_count_checked() {
        let schema = PacketSchema::object(
            vec![PacketType::Strings, PacketType::Booleans],
            vec![0, 0],
            vec![2, 2],
        )
        .unwrap();
        assert!(matches!(
            schema.encode("x", &[Value::from("only one")]),
            Err(ProtocolError::ArityViolation { .. })
        ));
    }

    #[test]
    fn test_object_section_too_large() {
        let schema =
            PacketSchema::object(vec![PacketType::Raw], vec![0], vec![1000]).unwrap();
        let long = "x".repeat(300);
        assert!(matches!(
            schema.encode("blob", &[Value::from(long.as_str())]),
            Err(ProtocolError::Encode(_))
        ));
    }

    #[test]
    fn test_auto_flatten_rows() {
        let schema = PacketSchema::object(
            vec![PacketType::IntsDynamic, PacketType::IntsDynamic],
            vec![0, 0],
            vec![16, 16],
        )
        .unwrap()
        .with_auto_flatten(true)
        .unwrap();
        let rows = vec![
            Value::List(vec![Value::Int(1), Value::Int(10)]),
            Value::List(vec![Value::Int(2), Value::Int(20)]),
            Value::List(vec![Value::Int(3), Value::Int(30)]),
        ];
        let bytes = schema.encode("points", &rows).unwrap();
        // columns [1,2,3] and [10,20,30], one width byte each
        assert_eq!(bytes, vec![4, 1, 1, 2, 3, 4, 1, 10, 20, 30]);
        assert_eq!(schema.decode(&bytes).unwrap(), rows);
    }

    #[test]
    fn test_auto_flatten_boolean_column_trimmed_to_rows() {
        let schema = PacketSchema::object(
            vec![PacketType::Booleans, PacketType::IntsFixed],
            vec![0, 0],
            vec![16, 16],
        )
        .unwrap()
        .with_auto_flatten(true)
        .unwrap();
        let rows = vec![
            Value::List(vec![Value::Bool(true), Value::Int(1)]),
            Value::List(vec![Value::Bool(false), Value::Int(2)]),
            Value::List(vec![Value::Bool(true), Value::Int(3)]),
        ];
        let bytes = schema.encode("flags", &rows).unwrap();
        assert_eq!(schema.decode(&bytes).unwrap(), rows);
    }

    #[test]
    fn test_auto_flatten_all_booleans_counts_rows() {
        let schema = PacketSchema::object(
            vec![PacketType::Booleans, PacketType::Booleans],
            vec![0, 0],
            vec![16, 16],
        )
        .unwrap()
        .with_auto_flatten(true)
        .unwrap();
        let rows: Vec<Value> = [(true, false), (false, false), (true, true)]
            .iter()
            .map(|&(a, b)| Value::List(vec![Value::Bool(a), Value::Bool(b)]))
            .collect();
        let bytes = schema.encode("switches", &rows).unwrap();
        assert_eq!(bytes[0], 3);
        assert!(schema.validate(&bytes));
        assert_eq!(schema.decode(&bytes).unwrap(), rows);

        let empty = schema.encode("switches", &[]).unwrap();
        assert_eq!(empty, vec![0, 0, 0]);
        assert!(schema.decode(&empty).unwrap().is_empty());

        // more rows claimed than one packed byte can hold
        let mut lying = bytes.clone();
        lying[0] = 9;
        assert!(matches!(schema.decode(&lying), Err(ProtocolError::Decode(_))));
    }

    #[test]
    fn test_auto_flatten_ragged_columns_are_decode_errors() {
        let schema = PacketSchema::object(
            vec![PacketType::IntsFixed, PacketType::IntsFixed],
            vec![0, 0],
            vec![16, 16],
        )
        .unwrap()
        .with_auto_flatten(true)
        .unwrap();
        let rows = vec![
            Value::List(vec![Value::Int(1), Value::Int(2)]),
            Value::List(vec![Value::Int(3), Value::Int(4)]),
        ];
        let mut bytes = schema.encode("grid", &rows).unwrap();
        // drop the last entry of the second column
        let width = (bytes[0] / 2) as usize;
        let second = 1 + bytes[0] as usize;
        bytes[second] -= width as u8;
        bytes.truncate(bytes.len() - width);
        assert!(matches!(
            schema.decode(&bytes),
            Err(ProtocolError::Decode(reason)) if reason == constants::ERR_RAGGED_COLUMNS
        ));
    }

    #[test]
    fn test_auto_flatten_requires_object() {
        assert!(PacketSchema::single(PacketType::Strings, 0, 1)
            .unwrap()
            .with_auto_flatten(true)
            .is_err());
    }

    #[test]
    fn test_flatten_inverse_and_empty() {
        let rows = vec![strs(&["x1", "y1"]), strs(&["x2", "y2"])];
        let columns = flatten(&rows).unwrap();
        assert_eq!(columns, vec![strs(&["x1", "x2"]), strs(&["y1", "y2"])]);
        assert_eq!(unflatten(&columns).unwrap(), rows);
        assert!(flatten(&[]).unwrap().is_empty());
        assert!(unflatten(&[]).unwrap().is_empty());
        assert!(flatten(&[strs(&["a"]), strs(&["b", "c"])]).is_err());
    }

    #[test]
    fn test_arguments_follow_spread() {
        let spread = PacketSchema::single(PacketType::Strings, 0, 4).unwrap();
        let listed = spread.clone().with_spread(false);
        let decoded = strs(&["a", "b"]);
        assert_eq!(spread.into_arguments(decoded.clone()), decoded);
        assert_eq!(
            listed.into_arguments(decoded.clone()),
            vec![Value::List(decoded)]
        );

        let raw = PacketSchema::single(PacketType::Raw, 0, 10)
            .unwrap()
            .with_spread(false);
        assert_eq!(raw.into_arguments(strs(&["text"])), strs(&["text"]));
    }
}
