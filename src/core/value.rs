//! Dynamic values carried by packets and enum packages.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::core::varint::{write_signed_varint, write_varint, Reader};
use crate::error::{constants, ProtocolError, Result};

/// Maximum number of values in one enum package (indices are one byte)
pub const MAX_ENUM_VALUES: usize = 255;

/// A decoded or to-be-encoded payload value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Undefined,
    Null,
    Bool(bool),
    Int(i64),
    Number(f64),
    Str(String),
    List(Vec<Value>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            Value::Number(x) if x.fract() == 0.0 && x.abs() < 9.007_199_254_740_992e15 => {
                Some(*x as i64)
            }
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(x) => Some(*x),
            Value::Int(n) => Some(*n as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    /// Short kind name for error messages
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Number(_) => "number",
            Value::Str(_) => "string",
            Value::List(_) => "list",
        }
    }

    /// Equality used for enum lookups: numbers compare by value, NaN never
    /// matches.
    fn enum_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Int(_) | Value::Number(_), Value::Int(_) | Value::Number(_)) => {
                match (self.as_f64(), other.as_f64()) {
                    (Some(a), Some(b)) => a == b,
                    _ => false,
                }
            }
            _ => self == other,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => write!(f, "undefined"),
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(n) => write!(f, "{n}"),
            Value::Number(x) => write!(f, "{x}"),
            Value::Str(s) => write!(f, "{s:?}"),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Int(i64::from(n))
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Number(x)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::List(items.into_iter().map(Into::into).collect())
    }
}

// Wire tags for enum values inside a registry record
const ENUM_UNDEFINED: u8 = 0;
const ENUM_NULL: u8 = 1;
const ENUM_FALSE: u8 = 2;
const ENUM_TRUE: u8 = 3;
const ENUM_INT: u8 = 4;
const ENUM_NUMBER: u8 = 5;
const ENUM_STRING: u8 = 6;

/// A closed, ordered set of scalar values addressed by index.
#[derive(Debug, Clone, PartialEq)]
pub struct EnumPackage {
    tag: String,
    values: Vec<Value>,
}

impl EnumPackage {
    pub fn new(tag: impl Into<String>, values: Vec<Value>) -> Result<Self> {
        let tag = tag.into();
        if tag.is_empty() || tag.len() > u8::MAX as usize {
            return Err(ProtocolError::InvalidTag(tag));
        }
        if values.is_empty() || values.len() > MAX_ENUM_VALUES {
            return Err(ProtocolError::InvalidSchema(format!(
                "enum '{tag}' must have 1..={MAX_ENUM_VALUES} values, got {}",
                values.len()
            )));
        }
        if let Some(list) = values.iter().find(|v| matches!(v, Value::List(_))) {
            return Err(ProtocolError::InvalidSchema(format!(
                "enum '{tag}' value {list} is not a scalar"
            )));
        }
        Ok(Self { tag, values })
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Index of `value` in the package
    pub fn index_of(&self, value: &Value) -> Option<u8> {
        self.values
            .iter()
            .position(|candidate| candidate.enum_eq(value))
            .map(|i| i as u8)
    }

    pub fn value_at(&self, index: u8) -> Option<&Value> {
        self.values.get(index as usize)
    }

    pub(crate) fn serialize_into(&self, out: &mut Vec<u8>) -> Result<()> {
        out.push(self.tag.len() as u8);
        out.extend_from_slice(self.tag.as_bytes());
        out.push(self.values.len() as u8);
        for value in &self.values {
            match value {
                Value::Undefined => out.push(ENUM_UNDEFINED),
                Value::Null => out.push(ENUM_NULL),
                Value::Bool(false) => out.push(ENUM_FALSE),
                Value::Bool(true) => out.push(ENUM_TRUE),
                Value::Int(n) => {
                    out.push(ENUM_INT);
                    write_signed_varint(out, *n)?;
                }
                Value::Number(x) => {
                    out.push(ENUM_NUMBER);
                    out.extend_from_slice(&x.to_be_bytes());
                }
                Value::Str(s) => {
                    out.push(ENUM_STRING);
                    write_varint(out, s.len() as u64)?;
                    out.extend_from_slice(s.as_bytes());
                }
                Value::List(_) => {
                    return Err(ProtocolError::Encode(format!(
                        "enum '{}' holds a list",
                        self.tag
                    )))
                }
            }
        }
        Ok(())
    }

    pub(crate) fn deserialize_from(reader: &mut Reader<'_>) -> Result<Self> {
        let tag_len = reader.read_u8()? as usize;
        let tag = crate::core::numeric::decode_utf8(reader.read_bytes(tag_len)?)?;
        let count = reader.read_u8()? as usize;
        let mut values = Vec::with_capacity(count);
        for _ in 0..count {
            let value = match reader.read_u8()? {
                ENUM_UNDEFINED => Value::Undefined,
                ENUM_NULL => Value::Null,
                ENUM_FALSE => Value::Bool(false),
                ENUM_TRUE => Value::Bool(true),
                ENUM_INT => Value::Int(reader.read_signed_varint()?),
                ENUM_NUMBER => Value::Number(f64::from_be_bytes(reader.read_array::<8>()?)),
                ENUM_STRING => {
                    let len = reader.read_len()?;
                    Value::Str(crate::core::numeric::decode_utf8(reader.read_bytes(len)?)?)
                }
                _ => return Err(ProtocolError::Decode(constants::ERR_NOT_PROTOCOL)),
            };
            values.push(value);
        }
        Self::new(tag, values).map_err(|_| ProtocolError::Decode(constants::ERR_NOT_PROTOCOL))
    }
}

/// Enum packages known to one protocol definition, keyed by tag.
///
/// Built once at startup and shared read-only afterwards.
#[derive(Debug, Clone, Default)]
pub struct EnumRegistry {
    packages: HashMap<String, Arc<EnumPackage>>,
}

impl EnumRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Define a package; redefining a tag is an error.
    pub fn define(&mut self, tag: &str, values: Vec<Value>) -> Result<Arc<EnumPackage>> {
        if self.packages.contains_key(tag) {
            return Err(ProtocolError::DuplicateEnum(tag.to_string()));
        }
        let package = Arc::new(EnumPackage::new(tag, values)?);
        self.packages.insert(tag.to_string(), package.clone());
        Ok(package)
    }

    pub fn get(&self, tag: &str) -> Option<Arc<EnumPackage>> {
        self.packages.get(tag).cloned()
    }

    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enum_index_lookup() {
        let package = EnumPackage::new(
            "color",
            vec!["red".into(), "green".into(), Value::Int(7), Value::Null],
        )
        .unwrap();
        assert_eq!(package.index_of(&"green".into()), Some(1));
        assert_eq!(package.index_of(&Value::Number(7.0)), Some(2));
        assert_eq!(package.index_of(&Value::Null), Some(3));
        assert_eq!(package.index_of(&"blue".into()), None);
        assert_eq!(package.value_at(0), Some(&Value::from("red")));
        assert_eq!(package.value_at(9), None);
    }

    #[test]
    fn test_enum_rejects_bad_definitions() {
        assert!(EnumPackage::new("empty", vec![]).is_err());
        assert!(EnumPackage::new("", vec![Value::Null]).is_err());
        assert!(EnumPackage::new("nested", vec![Value::List(vec![])]).is_err());
        let too_many = (0..256).map(|i| Value::Int(i)).collect();
        assert!(EnumPackage::new("big", too_many).is_err());
    }

    #[test]
    fn test_enum_serialization_roundtrip() {
        let package = EnumPackage::new(
            "mixed",
            vec![
                Value::Undefined,
                Value::Null,
                Value::Bool(true),
                Value::Bool(false),
                Value::Int(-42),
                Value::Number(1.5),
                "text".into(),
            ],
        )
        .unwrap();
        let mut out = Vec::new();
        package.serialize_into(&mut out).unwrap();
        let mut reader = Reader::new(&out);
        let decoded = EnumPackage::deserialize_from(&mut reader).unwrap();
        assert!(reader.is_empty());
        assert_eq!(decoded, package);
    }

    #[test]
    fn test_enum_registry_rejects_duplicates() {
        let mut registry = EnumRegistry::new();
        registry.define("dir", vec!["up".into(), "down".into()]).unwrap();
        assert!(matches!(
            registry.define("dir", vec!["left".into()]),
            Err(ProtocolError::DuplicateEnum(_))
        ));
        assert_eq!(registry.get("dir").unwrap().len(), 2);
        assert!(registry.get("missing").is_none());
    }
}
